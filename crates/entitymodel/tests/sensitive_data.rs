use entitymodel::QueryErrorKind;
use entitymodel::prelude::*;
use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

static MY_ENTITY: EntityDescriptor = EntityDescriptor::new("MyEntity", "Id", &["Id", "Name"]);

/// Log output collected in memory.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn session(sensitive: bool) -> Session<MemoryStore> {
    let registry = EntityRegistry::builder()
        .register(&MY_ENTITY)
        .build()
        .expect("build registry");
    SessionBuilder::new(registry)
        .sensitive_data_logging(sensitive)
        .in_memory()
        .expect("open session")
}

/// Commit a row with key 4242 twice, from two sessions over one store, and
/// return the second commit's error along with everything logged.
fn duplicate_key_commit(sensitive: bool) -> (Error, String) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    let err = tracing::subscriber::with_default(subscriber, || {
        rt.block_on(async {
            let mut session = session(sensitive);
            let entity = Entity::new(&MY_ENTITY)
                .with("Id", 4242)
                .with("Name", "top-secret")
                .into_ref();
            session.add(&entity).unwrap();
            unwrap_outcome(session.commit(&cx).await);

            let mut other = session.fork();
            let copy = Entity::new(&MY_ENTITY)
                .with("Id", 4242)
                .with("Name", "top-secret")
                .into_ref();
            other.add(&copy).unwrap();
            match other.commit(&cx).await {
                Outcome::Err(e) => {
                    assert_eq!(other.state_of(&copy), EntityState::Added);
                    e
                }
                result => panic!("expected a duplicate key error, got {result:?}"),
            }
        })
    });
    (err, captured.text())
}

#[test]
fn values_stay_out_of_errors_and_logs() {
    let (err, logs) = duplicate_key_commit(false);

    assert!(matches!(&err, Error::Query(q) if q.kind == QueryErrorKind::Constraint));
    assert_eq!(err.key(), Some(&Value::Int(4242)));
    let text = err.to_string();
    assert!(text.contains("MyEntity"), "{text}");
    assert!(!text.contains("4242"), "{text}");

    assert!(logs.contains("Commit failed"), "{logs}");
    assert!(logs.contains("<redacted>"), "{logs}");
    assert!(!logs.contains("4242"), "{logs}");
    assert!(!logs.contains("top-secret"), "{logs}");
}

#[test]
fn sensitive_logging_shows_values() {
    let (err, logs) = duplicate_key_commit(true);

    assert!(!err.to_string().contains("4242"));
    assert!(logs.contains("4242"), "{logs}");
    assert!(logs.contains("top-secret"), "{logs}");
}
