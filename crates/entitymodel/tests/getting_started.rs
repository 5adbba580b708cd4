use entitymodel::prelude::*;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

static MY_ENTITY: EntityDescriptor = EntityDescriptor::new("MyEntity", "Id", &["Id", "Name"]);

fn session() -> Session<MemoryStore> {
    let registry = EntityRegistry::builder()
        .register(&MY_ENTITY)
        .build()
        .expect("build registry");
    SessionBuilder::new(registry)
        .tracking(TrackingMode::Untracked)
        .in_memory()
        .expect("open session")
}

fn hello() -> EntityRef {
    Entity::new(&MY_ENTITY)
        .with("Id", 1)
        .with("Name", "Hello")
        .into_ref()
}

#[test]
fn insert_and_select() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let entity = hello();
        session.add(&entity).unwrap();
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 1);

        let loaded = unwrap_outcome(session.first(&cx, &Query::new(&MY_ENTITY)).await)
            .expect("row inserted");
        assert_eq!(loaded.key(), entity.key());
        assert!(!loaded.ptr_eq(&entity));
    });
}

#[test]
fn update_through_tracked_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        session.add(&hello()).unwrap();
        unwrap_outcome(session.commit(&cx).await);

        let loaded = unwrap_outcome(
            session
                .first(&cx, &Query::new(&MY_ENTITY).as_tracking())
                .await,
        )
        .expect("row inserted");
        loaded.set("Name", "Bye");
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.updated, 1);

        let reread = unwrap_outcome(session.first(&cx, &Query::new(&MY_ENTITY)).await)
            .expect("row still present");
        assert_eq!(reread.get("Name"), Some(Value::from("Bye")));
    });
}

#[test]
fn delete_then_count() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        session.add(&hello()).unwrap();
        unwrap_outcome(session.commit(&cx).await);

        let loaded = unwrap_outcome(
            session
                .first(&cx, &Query::new(&MY_ENTITY).as_tracking())
                .await,
        )
        .expect("row inserted");
        session.remove(&loaded).unwrap();
        assert_eq!(session.state_of(&loaded), EntityState::Deleted);

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(session.state_of(&loaded), EntityState::Detached);
        assert_eq!(
            unwrap_outcome(session.count(&cx, &Query::new(&MY_ENTITY)).await),
            0
        );
    });
}

#[test]
fn nothing_pending_commits_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(session.store().ops().is_empty());
    });
}
