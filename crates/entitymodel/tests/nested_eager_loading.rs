use entitymodel::NavigationErrorKind;
use entitymodel::prelude::*;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

static GRAND_PARENT: EntityDescriptor = EntityDescriptor::new("GrandParent", "Id", &["Id", "Name"])
    .navigations(&[
        NavigationInfo::new("Parent", "Parent", NavigationKind::OneToOne)
            .foreign_key("GrandParentId"),
    ]);
static PARENT: EntityDescriptor =
    EntityDescriptor::new("Parent", "Id", &["Id", "Name", "GrandParentId"]).navigations(&[
        NavigationInfo::new("Child1", "Child1", NavigationKind::OneToMany).foreign_key("ParentId"),
        NavigationInfo::new("Child2", "Child2", NavigationKind::OneToMany).foreign_key("ParentId"),
    ]);
static CHILD1: EntityDescriptor = EntityDescriptor::new("Child1", "Id", &["Id", "Name", "ParentId"]);
static CHILD2: EntityDescriptor = EntityDescriptor::new("Child2", "Id", &["Id", "Name", "ParentId"])
    .navigations(&[
        NavigationInfo::new("Baby", "Baby", NavigationKind::OneToOne).foreign_key("Child2Id"),
    ]);
static BABY: EntityDescriptor = EntityDescriptor::new("Baby", "Id", &["Id", "Name", "Child2Id"]);

fn session() -> Session<MemoryStore> {
    let registry = EntityRegistry::builder()
        .register(&GRAND_PARENT)
        .register(&PARENT)
        .register(&CHILD1)
        .register(&CHILD2)
        .register(&BABY)
        .build()
        .expect("build registry");
    SessionBuilder::new(registry)
        .tracking(TrackingMode::Untracked)
        .in_memory()
        .expect("open session")
}

fn entity(descriptor: &'static EntityDescriptor, id: i32, name: &str) -> Entity {
    Entity::new(descriptor).with("Id", id).with("Name", name)
}

fn single_graph() -> EntityRef {
    let baby = entity(&BABY, 1121, "Baby").into_ref();
    let child2 = entity(&CHILD2, 112, "Child2")
        .with_one("Baby", Some(baby))
        .into_ref();
    let child1 = entity(&CHILD1, 111, "Child1").into_ref();
    let parent = entity(&PARENT, 11, "Parent")
        .with_many("Child1", vec![child1])
        .with_many("Child2", vec![child2])
        .into_ref();
    entity(&GRAND_PARENT, 1, "Grand Parent")
        .with_one("Parent", Some(parent))
        .into_ref()
}

fn key_at(entity: &EntityRef, path: &[&str]) -> Option<Value> {
    let mut current = entity.clone();
    for step in path {
        current = match current.navigation(step)? {
            Navigation::Single(one) => one?,
            Navigation::Many(many) => many.into_iter().next()?,
        };
    }
    current.key()
}

fn assert_same_graph(expected: &EntityRef, result: &EntityRef) {
    assert!(!expected.ptr_eq(result));
    for path in [
        &[][..],
        &["Parent"][..],
        &["Parent", "Child1"][..],
        &["Parent", "Child2"][..],
        &["Parent", "Child2", "Baby"][..],
    ] {
        let want = key_at(expected, path);
        assert!(want.is_some(), "expected graph lacks {path:?}");
        assert_eq!(want, key_at(result, path), "mismatch at {path:?}");
    }
}

fn short_syntax() -> Query {
    Query::new(&GRAND_PARENT)
        .include("Parent.Child1")
        .include("Parent.Child2")
        .then_include("Baby")
}

#[test]
fn short_syntax_and_separate_add() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let grand_parent = entity(&GRAND_PARENT, 1, "Grand Parent").into_ref();
        session.add(&grand_parent).unwrap();
        session
            .add(&entity(&PARENT, 11, "Parent").with("GrandParentId", 1).into_ref())
            .unwrap();
        session
            .add(&entity(&CHILD1, 111, "Child1").with("ParentId", 11).into_ref())
            .unwrap();
        session
            .add(&entity(&CHILD2, 112, "Child2").with("ParentId", 11).into_ref())
            .unwrap();
        session
            .add(&entity(&BABY, 1121, "Baby").with("Child2Id", 112).into_ref())
            .unwrap();
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 5);

        let result = unwrap_outcome(session.first(&cx, &short_syntax()).await)
            .expect("grand parent stored");
        assert_same_graph(&grand_parent, &result);
    });
}

#[test]
fn short_syntax_and_single_add() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let grand_parent = single_graph();
        session.add(&grand_parent).unwrap();
        assert_eq!(session.pending_counts().unwrap().new, 5);
        unwrap_outcome(session.commit(&cx).await);

        let result = unwrap_outcome(session.first(&cx, &short_syntax()).await)
            .expect("grand parent stored");
        assert_same_graph(&grand_parent, &result);
    });
}

#[test]
fn longer_syntax_with_repeated_includes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let grand_parent = single_graph();
        session.add(&grand_parent).unwrap();
        unwrap_outcome(session.commit(&cx).await);

        let query = Query::new(&GRAND_PARENT)
            .include("Parent")
            .then_include("Child1")
            .include("Parent")
            .then_include("Child2")
            .then_include("Baby");
        let result = unwrap_outcome(session.first(&cx, &query).await)
            .expect("grand parent stored");
        assert_same_graph(&grand_parent, &result);

        let parent = result.one("Parent").flatten().expect("parent included");
        assert_eq!(parent.many("Child1").map(|c| c.len()), Some(1));
        assert_eq!(parent.many("Child2").map(|c| c.len()), Some(1));
    });
}

#[test]
fn element_step_through_collection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let grand_parent = single_graph();
        session.add(&grand_parent).unwrap();
        unwrap_outcome(session.commit(&cx).await);

        let query = Query::new(&GRAND_PARENT)
            .include("Parent.Child1")
            .include("Parent.Child2[].Baby");
        let result = unwrap_outcome(session.first(&cx, &query).await)
            .expect("grand parent stored");
        assert_same_graph(&grand_parent, &result);
    });
}

#[test]
fn dotted_step_through_collection_is_rejected() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let query = Query::new(&GRAND_PARENT)
            .include("Parent")
            .then_include("Child2.Baby");
        match session.query(&cx, &query).await {
            Outcome::Err(e) => {
                assert_eq!(e.navigation_kind(), Some(NavigationErrorKind::ThroughCollection));
            }
            other => panic!("expected a path error, got {other:?}"),
        }
        assert!(session.store().ops().is_empty());
    });
}

#[test]
fn then_include_without_include_is_rejected() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        let query = Query::new(&GRAND_PARENT).then_include("Parent");
        match session.query(&cx, &query).await {
            Outcome::Err(e) => {
                assert_eq!(e.navigation_kind(), Some(NavigationErrorKind::NoPreviousInclude));
            }
            other => panic!("expected a path error, got {other:?}"),
        }
    });
}

#[test]
fn missing_include_leaves_slots_unloaded() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut session = session();
        session.add(&single_graph()).unwrap();
        unwrap_outcome(session.commit(&cx).await);

        let query = Query::new(&GRAND_PARENT).include("Parent");
        let result = unwrap_outcome(session.first(&cx, &query).await)
            .expect("grand parent stored");
        let parent = result.one("Parent").flatten().expect("parent included");
        assert!(parent.navigation("Child1").is_none());
        assert!(parent.navigation("Child2").is_none());
    });
}
