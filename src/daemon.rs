//! The collection backend: a background thread that owns the observation
//! store and serves framed requests one at a time.
//!
//! Callers talk to it through a cloneable [`DaemonHandle`]. Every request
//! carries its own reply channel, so a caller that gave up waiting (timeout)
//! does not disturb the daemon.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::StoreConfig;
use crate::error::{Result, VantageError};
use crate::message::{self, Envelope, Message};
use crate::persist::{PersistenceMode, Persistor, QueryResult};

/// What the daemon answers to a request.
#[derive(Debug)]
pub enum Reply {
    Ack,
    Registered { guid: u64 },
    Rows(QueryResult),
    Echo(Vec<u8>),
    Error(VantageError),
}

impl Reply {
    /// Turns an `Error` reply into an `Err`.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

struct Request {
    frame: Vec<u8>,
    reply: Sender<Reply>,
}

#[derive(Debug, Clone)]
pub struct DaemonHandle {
    requests: Sender<Request>,
}

impl DaemonHandle {
    /// Sends one frame and waits for the reply, at most `timeout` if given.
    pub fn call(&self, frame: Vec<u8>, timeout: Option<Duration>) -> Result<Reply> {
        let (reply, answer) = mpsc::channel();
        self.requests
            .send(Request { frame, reply })
            .map_err(|_| VantageError::Connection("daemon is not running".into()))?;
        match timeout {
            Some(timeout) => answer.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    VantageError::Connection(format!("no reply within {} ms", timeout.as_millis()))
                }
                RecvTimeoutError::Disconnected => {
                    VantageError::Connection("daemon stopped before replying".into())
                }
            }),
            None => answer
                .recv()
                .map_err(|_| VantageError::Connection("daemon stopped before replying".into())),
        }
    }

    /// Runs a query outside of any publishing session.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let frame = message::encode(0, 0, &Message::Query(sql.to_string()))?;
        match self.call(frame, None)?.into_result()? {
            Reply::Rows(result) => Ok(result),
            other => Err(VantageError::Connection(format!("unexpected reply {other:?}"))),
        }
    }
}

pub struct Daemon {
    handle: DaemonHandle,
    join: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Opens the store on the calling thread, so a bad path fails here,
    /// then hands it to the daemon thread.
    pub fn spawn(config: &StoreConfig) -> Result<Daemon> {
        let mode = PersistenceMode::from(config.path.clone());
        let store = Persistor::new(&mode)?;
        let (requests, incoming) = mpsc::channel();
        let join = thread::Builder::new()
            .name("vantage-daemon".into())
            .spawn(move || serve(store, incoming))
            .map_err(|e| VantageError::Connection(format!("could not start daemon: {e}")))?;
        info!(?mode, "daemon started");
        Ok(Daemon { handle: DaemonHandle { requests }, join: Some(join) })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            let frame = message::encode(0, 0, &Message::Shutdown)?;
            if let Err(e) = self.handle.call(frame, None) {
                debug!(error = %e, "daemon already gone");
            }
            join.join()
                .map_err(|_| VantageError::Connection("daemon thread panicked".into()))?;
            info!("daemon stopped");
        }
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "daemon shutdown failed");
        }
    }
}

fn serve(mut store: Persistor, incoming: Receiver<Request>) {
    while let Ok(request) = incoming.recv() {
        let (reply, stop) = match message::decode(&request.frame) {
            Ok(envelope) => dispatch(&mut store, envelope),
            Err(e) => (Reply::Error(e), false),
        };
        if let Reply::Error(e) = &reply {
            warn!(error = %e, "request rejected");
        }
        // the caller may have timed out and dropped its receiver
        let _ = request.reply.send(reply);
        if stop {
            break;
        }
    }
}

fn dispatch(store: &mut Persistor, envelope: Envelope) -> (Reply, bool) {
    let Envelope { header, message } = envelope;
    trace!(msg_type = ?header.msg_type, from = header.msg_from, size = header.msg_size, "request");
    let guid = header.pub_guid;
    let outcome = match message {
        Message::Register(identity) => store.register(&identity).map(|guid| Reply::Registered { guid }),
        Message::Announce(schema) => store.announce(guid, &schema).map(|_| Reply::Ack),
        Message::Publish(batch) => store.publish(guid, &batch).map(|_| Reply::Ack),
        Message::Query(sql) => store.query(&sql).map(Reply::Rows),
        Message::Echo(payload) => Ok(Reply::Echo(payload)),
        Message::Unregister => store.unregister(guid).map(|_| Reply::Ack),
        Message::Shutdown => return (Reply::Ack, true),
    };
    (outcome.unwrap_or_else(Reply::Error), false)
}
