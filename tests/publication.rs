use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vantage::Result;
use vantage::VantageError;
use vantage::config::{SessionConfig, StoreConfig};
use vantage::construct::PublicationBatch;
use vantage::daemon::Daemon;
use vantage::datatype::{Value, ValueType};
use vantage::message::Identity;
use vantage::persist::{Cell, QueryResult};
use vantage::session::Session;
use vantage::transport::{ChannelTransport, Connection, Transport};

/// Forwards to a real daemon, records what was sent and fails on request.
struct Recording {
    inner: ChannelTransport,
    fail_announces: AtomicUsize,
    fail_publishes: AtomicUsize,
    announced: Mutex<Vec<Vec<(String, ValueType)>>>,
    published: Mutex<Vec<PublicationBatch>>,
}

impl Recording {
    fn new(daemon: &Daemon) -> Arc<Recording> {
        Arc::new(Recording {
            inner: ChannelTransport::new(daemon.handle(), Duration::from_secs(5)),
            fail_announces: AtomicUsize::new(0),
            fail_publishes: AtomicUsize::new(0),
            announced: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }
    fn published(&self) -> Vec<PublicationBatch> {
        self.published.lock().unwrap().clone()
    }
    fn announced(&self) -> Vec<Vec<(String, ValueType)>> {
        self.announced.lock().unwrap().clone()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl Transport for Recording {
    fn connect(&self, identity: &Identity) -> Result<Connection> {
        self.inner.connect(identity)
    }
    fn send_announce(&self, connection: &Connection, schema: &[(String, ValueType)]) -> Result<()> {
        self.announced.lock().unwrap().push(schema.to_vec());
        if take_failure(&self.fail_announces) {
            return Err(VantageError::Connection("injected announce failure".into()));
        }
        self.inner.send_announce(connection, schema)
    }
    fn send_publish(&self, connection: &Connection, batch: &PublicationBatch) -> Result<()> {
        self.published.lock().unwrap().push(batch.clone());
        if take_failure(&self.fail_publishes) {
            return Err(VantageError::Connection("injected publish failure".into()));
        }
        self.inner.send_publish(connection, batch)
    }
    fn send_query(&self, connection: &Connection, sql: &str) -> Result<QueryResult> {
        self.inner.send_query(connection, sql)
    }
    fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.inner.disconnect(connection)
    }
}

fn active(transport: Arc<Recording>) -> Session {
    let session = Session::new(SessionConfig::default(), transport);
    session.init().expect("init");
    session
}

#[test]
fn batch_holds_last_value_of_each_name() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let transport = Recording::new(&daemon);
    let session = active(transport.clone());
    let names = ["a", "b", "c", "d", "e"];
    for (i, name) in names.iter().enumerate() {
        session.pack(name, ValueType::Integer64, i as i64).expect("pack");
        session.pack(name, ValueType::Integer64, 10 * i as i64).expect("repack");
    }
    let receipt = session.publish().expect("publish");
    assert_eq!(receipt.frame, 1);
    assert_eq!(receipt.entries, names.len());
    assert!(!receipt.pending);

    let sent = transport.published();
    assert_eq!(sent.len(), 1);
    let batch = &sent[0];
    assert_eq!(batch.len(), names.len());
    for (i, name) in names.iter().enumerate() {
        let snapshot = batch.get(name).expect("entry");
        assert_eq!(snapshot.value, Value::Integer64(10 * i as i64));
        assert_eq!(snapshot.seq, 2);
    }
    assert_eq!(session.pending_len(), 0);
}

#[test]
fn failed_publish_is_resent_unchanged() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let transport = Recording::new(&daemon);
    let session = active(transport.clone());
    session.pack("a", ValueType::Integer32, 1).expect("pack");
    session.pack("b", ValueType::String, "first").expect("pack");

    transport.fail_publishes.store(1, Ordering::SeqCst);
    match session.publish() {
        Err(VantageError::Publish { frame, .. }) => assert_eq!(frame, 1),
        other => panic!("expected publish error, got {other:?}"),
    }
    assert!(session.has_unacknowledged());

    // packed while the batch waits; must not leak into the resend
    session.pack("c", ValueType::Double, 0.5).expect("pack");
    session.pack("a", ValueType::Integer32, 2).expect("pack");

    let retry = session.publish().expect("retry");
    assert_eq!(retry.frame, 1);
    assert_eq!(retry.entries, 2);
    assert!(retry.pending);
    assert!(!session.has_unacknowledged());

    let next = session.publish().expect("next");
    assert_eq!(next.frame, 2);
    assert_eq!(next.entries, 2);

    let sent = transport.published();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(sent[1].get("a").expect("a").value, Value::Integer32(1));
    let names: Vec<_> = sent[2].entries().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["c", "a"]);

    let rows = session.query("select frame, a from tblvals order by frame").expect("query");
    assert_eq!(rows.rows, vec![
        vec![Cell::Integer(1), Cell::Integer(1)],
        vec![Cell::Integer(2), Cell::Integer(2)],
    ]);
}

#[test]
fn publish_announces_new_names_first() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let transport = Recording::new(&daemon);
    let session = active(transport.clone());
    session.pack("x", ValueType::Integer32, 0).expect("pack");
    session.publish().expect("publish");
    assert_eq!(transport.announced(), vec![vec![("x".to_string(), ValueType::Integer32)]]);
    assert!(session.value("x").expect("x").announced());
    // nothing left to announce
    assert_eq!(session.announce().expect("announce"), 0);
    assert_eq!(transport.announced().len(), 1);
}

#[test]
fn announce_failure_during_publish_keeps_batch() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let transport = Recording::new(&daemon);
    let session = active(transport.clone());
    session.pack("x", ValueType::Double, 1.0).expect("pack");
    transport.fail_announces.store(1, Ordering::SeqCst);
    assert!(matches!(session.publish(), Err(VantageError::Publish { frame: 1, .. })));
    assert!(transport.published().is_empty());
    assert!(session.has_unacknowledged());
    let receipt = session.publish().expect("retry");
    assert_eq!((receipt.frame, receipt.entries), (1, 1));
}

#[test]
fn announce_reports_new_names_only() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let transport = Recording::new(&daemon);
    let session = active(transport.clone());
    session.pack("x", ValueType::Integer32, 1).expect("pack");
    session.pack("y", ValueType::String, "hello").expect("pack");
    assert_eq!(session.announce().expect("announce"), 2);
    assert_eq!(session.announce().expect("announce"), 0);
    session.pack("z", ValueType::Double, 2.0).expect("pack");
    assert_eq!(session.announce().expect("announce"), 1);
    assert_eq!(transport.announced().len(), 2);
}

#[test]
fn empty_publish_sends_nothing() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let transport = Recording::new(&daemon);
    let session = active(transport.clone());
    let receipt = session.publish().expect("publish");
    assert_eq!((receipt.frame, receipt.entries, receipt.pending), (0, 0, false));
    assert!(transport.published().is_empty());
}

#[test]
fn types_are_fixed_and_ranges_checked() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let session = active(Recording::new(&daemon));
    session.pack("x", ValueType::Integer32, 1).expect("pack");
    assert!(matches!(
        session.pack("x", ValueType::Integer64, 1),
        Err(VantageError::TypeMismatch { .. })
    ));
    session.pack("y", ValueType::Integer64, 1).expect("pack");
    assert!(matches!(
        session.pack("y", ValueType::Integer32, 1),
        Err(VantageError::TypeMismatch { .. })
    ));

    let big = 1i64 << 31;
    assert!(matches!(
        session.pack("big", ValueType::Integer32, big),
        Err(VantageError::ValueRange { .. })
    ));
    session.pack("big", ValueType::Integer64, big).expect("fits 64 bits");
    assert!(matches!(
        session.pack("label", ValueType::Integer32, "text"),
        Err(VantageError::ValueKind { .. })
    ));
    assert!(matches!(
        session.pack("has space", ValueType::Double, 1.0),
        Err(VantageError::InvalidName(_))
    ));
}

#[test]
fn sequence_grows_with_every_pack() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let session = active(Recording::new(&daemon));
    for expected in 1..=3 {
        assert_eq!(session.pack("n", ValueType::Integer32, 7).expect("pack"), expected);
    }
    assert_eq!(session.value("n").expect("n").seq(), 3);
    assert_eq!(session.len(), 1);
}

/// Holds every publish until the test lets it through.
struct Stalling {
    inner: ChannelTransport,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Transport for Stalling {
    fn connect(&self, identity: &Identity) -> Result<Connection> {
        self.inner.connect(identity)
    }
    fn send_announce(&self, connection: &Connection, schema: &[(String, ValueType)]) -> Result<()> {
        self.inner.send_announce(connection, schema)
    }
    fn send_publish(&self, connection: &Connection, batch: &PublicationBatch) -> Result<()> {
        self.entered.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        self.inner.send_publish(connection, batch)
    }
    fn send_query(&self, connection: &Connection, sql: &str) -> Result<QueryResult> {
        self.inner.send_query(connection, sql)
    }
    fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.inner.disconnect(connection)
    }
}

#[test]
fn second_publish_while_one_is_in_flight_fails_fast() {
    let daemon = Daemon::spawn(&StoreConfig::default()).expect("daemon");
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let transport = Stalling {
        inner: ChannelTransport::new(daemon.handle(), Duration::from_secs(5)),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let session = Arc::new(Session::new(SessionConfig::default(), Arc::new(transport)));
    session.init().expect("init");
    session.pack("x", ValueType::Integer32, 1).expect("pack");

    let publisher = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || session.publish())
    };
    entered_rx.recv().expect("publish started");

    assert!(matches!(session.publish(), Err(VantageError::PublishInProgress)));
    // packing and querying do not wait for the publish
    session.pack("x", ValueType::Integer32, 2).expect("pack");
    let rows = session.query("select * from tblvals").expect("query");
    assert!(rows.is_empty());

    release_tx.send(()).expect("release");
    let receipt = publisher.join().expect("join").expect("publish");
    assert_eq!(receipt.frame, 1);
    assert!(receipt.pending);

    // let the finalize flush through as well
    release_tx.send(()).expect("release");
    session.finalize().expect("finalize");
}
