//! The backend boundary a session talks through.
//!
//! [`Transport`] is the capability set a session needs (connect, announce,
//! publish, query, disconnect). [`ChannelTransport`] implements it by framing
//! each call with [`crate::message`] and handing it to a [`DaemonHandle`],
//! waiting at most a bounded time for every reply.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::construct::PublicationBatch;
use crate::daemon::{DaemonHandle, Reply};
use crate::datatype::ValueType;
use crate::error::{Result, VantageError};
use crate::message::{self, Identity, Message};
use crate::persist::QueryResult;

/// An established link to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub guid: u64,
    pub identity: Identity,
}

pub trait Transport: Send + Sync {
    fn connect(&self, identity: &Identity) -> Result<Connection>;
    fn send_announce(&self, connection: &Connection, schema: &[(String, ValueType)]) -> Result<()>;
    fn send_publish(&self, connection: &Connection, batch: &PublicationBatch) -> Result<()>;
    fn send_query(&self, connection: &Connection, sql: &str) -> Result<QueryResult>;
    fn disconnect(&self, connection: &Connection) -> Result<()>;
}

pub struct ChannelTransport {
    daemon: DaemonHandle,
    timeout: Duration,
}

impl ChannelTransport {
    pub fn new(daemon: DaemonHandle, timeout: Duration) -> Self {
        Self { daemon, timeout }
    }

    fn round_trip(&self, guid: u64, message: &Message) -> Result<Reply> {
        let frame = message::encode(guid, guid, message)?;
        trace!(msg_type = ?message.message_type(), bytes = frame.len(), "sending");
        self.daemon.call(frame, Some(self.timeout))?.into_result()
    }

    fn expect_ack(&self, guid: u64, message: &Message) -> Result<()> {
        match self.round_trip(guid, message)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Sends an echo and reports how long the reply took.
    pub fn ping(&self, payload: &[u8]) -> Result<Duration> {
        let started = Instant::now();
        match self.round_trip(0, &Message::Echo(payload.to_vec()))? {
            Reply::Echo(echoed) if echoed == payload => Ok(started.elapsed()),
            Reply::Echo(_) => Err(VantageError::Connection("echo came back altered".into())),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> VantageError {
    VantageError::Connection(format!("unexpected reply {reply:?}"))
}

impl Transport for ChannelTransport {
    fn connect(&self, identity: &Identity) -> Result<Connection> {
        match self.round_trip(0, &Message::Register(identity.clone()))? {
            Reply::Registered { guid } => Ok(Connection { guid, identity: identity.clone() }),
            other => Err(unexpected(other)),
        }
    }

    fn send_announce(&self, connection: &Connection, schema: &[(String, ValueType)]) -> Result<()> {
        self.expect_ack(connection.guid, &Message::Announce(schema.to_vec()))
    }

    fn send_publish(&self, connection: &Connection, batch: &PublicationBatch) -> Result<()> {
        self.expect_ack(connection.guid, &Message::Publish(batch.clone()))
    }

    fn send_query(&self, connection: &Connection, sql: &str) -> Result<QueryResult> {
        match self.round_trip(connection.guid, &Message::Query(sql.to_string()))? {
            Reply::Rows(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.expect_ack(connection.guid, &Message::Unregister)
    }
}
