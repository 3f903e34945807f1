//! A publishing session: the process-local handle that packs named values,
//! announces their schema, publishes them in batches and queries the store.
//!
//! A session moves through `Uninitialized -> Active -> Finalized`. Only
//! `init` leaves `Uninitialized` and only `finalize` enters `Finalized`;
//! everything else requires `Active`.
//!
//! Publishing is last-value-wins: packing the same name twice between
//! publishes keeps only the latest snapshot. Names that were never announced
//! are announced automatically by `publish` before the batch is sent. A batch
//! that fails to send is kept in flight and the next `publish` resends exactly
//! that batch, with the same frame number.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, info, trace, warn};

use crate::config::{SessionConfig, Settings};
use crate::construct::{NamedValue, PublicationBatch, ValueKeeper, now};
use crate::daemon::Daemon;
use crate::datatype::{Scalar, ValueType};
use crate::error::{Result, VantageError};
use crate::message::Identity;
use crate::persist::QueryResult;
use crate::transport::{ChannelTransport, Connection, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Finalized,
}

/// What a `publish` call did. `frame` is 0 when nothing was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub frame: u64,
    pub entries: usize,
    /// Values packed after the sent batch was cut, waiting for the next publish.
    pub pending: bool,
}

struct Inner {
    state: Lifecycle,
    connection: Option<Connection>,
    keeper: ValueKeeper,
    pending: PublicationBatch,
    in_flight: Option<PublicationBatch>,
    next_frame: u64,
}

impl Inner {
    fn ensure_active(&self) -> Result<&Connection> {
        match self.state {
            Lifecycle::Uninitialized => {
                Err(VantageError::InvalidState("session is not initialized".into()))
            }
            Lifecycle::Finalized => Err(VantageError::SessionClosed),
            Lifecycle::Active => self
                .connection
                .as_ref()
                .ok_or_else(|| VantageError::Connection("session has no connection".into())),
        }
    }
}

pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    // held for the whole duration of a publish
    publishing: Mutex<()>,
    daemon: Mutex<Option<Daemon>>,
}

impl Session {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Session {
        Session {
            config,
            transport,
            inner: Mutex::new(Inner {
                state: Lifecycle::Uninitialized,
                connection: None,
                keeper: ValueKeeper::new(),
                pending: PublicationBatch::new(),
                in_flight: None,
                next_frame: 1,
            }),
            publishing: Mutex::new(()),
            daemon: Mutex::new(None),
        }
    }

    /// Spawns a daemon over `settings.store`, connects to it and returns an
    /// active session that shuts the daemon down when finalized.
    pub fn local(settings: &Settings) -> Result<Session> {
        let daemon = Daemon::spawn(&settings.store)?;
        let transport = ChannelTransport::new(daemon.handle(), settings.session.timeout());
        let session = Session::new(settings.session.clone(), Arc::new(transport));
        *session.daemon.lock()? = Some(daemon);
        session.init()?;
        Ok(session)
    }

    fn identity(&self) -> Identity {
        Identity {
            program_name: self.config.program_name.clone(),
            program_version: self.config.program_version.clone(),
            title: self.config.title.clone(),
            node_id: self.config.node_id.clone(),
            process_id: std::process::id(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn init(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            Lifecycle::Active => {
                return Err(VantageError::InvalidState("session is already initialized".into()));
            }
            Lifecycle::Finalized => return Err(VantageError::SessionClosed),
            Lifecycle::Uninitialized => (),
        }
        let connection = self.transport.connect(&self.identity())?;
        info!(guid = connection.guid, program = %self.config.program_name, "session initialized");
        inner.connection = Some(connection);
        inner.state = Lifecycle::Active;
        Ok(())
    }

    /// Records `value` under `name` as `value_type` and returns the name's
    /// new sequence number. Never touches the backend.
    pub fn pack(&self, name: &str, value_type: ValueType, value: impl Into<Scalar>) -> Result<u64> {
        let mut inner = self.inner.lock()?;
        inner.ensure_active()?;
        let value = value_type.coerce(value.into())?;
        let (snapshot, _) = inner.keeper.keep(name, value)?;
        let seq = snapshot.seq;
        trace!(name, seq, "packed");
        inner.pending.record(snapshot);
        Ok(seq)
    }

    /// Sends the schema of every name not yet announced and returns how many
    /// there were.
    pub fn announce(&self) -> Result<usize> {
        let (connection, schema) = {
            let inner = self.inner.lock()?;
            let connection = inner.ensure_active()?.clone();
            (connection, inner.keeper.unannounced())
        };
        if schema.is_empty() {
            return Ok(0);
        }
        self.transport.send_announce(&connection, &schema)?;
        self.inner.lock()?.keeper.mark_announced(schema.iter().map(|(name, _)| name.as_str()));
        info!(count = schema.len(), "schema announced");
        Ok(schema.len())
    }

    pub fn publish(&self) -> Result<PublishReceipt> {
        let _gate = self.publishing.try_lock().map_err(|e| match e {
            TryLockError::WouldBlock => VantageError::PublishInProgress,
            TryLockError::Poisoned(p) => VantageError::Lock(p.to_string()),
        })?;

        let (connection, batch, schema) = {
            let mut inner = self.inner.lock()?;
            let connection = inner.ensure_active()?.clone();
            if inner.in_flight.is_none() {
                if inner.pending.is_empty() {
                    return Ok(PublishReceipt { frame: 0, entries: 0, pending: false });
                }
                let mut batch = std::mem::take(&mut inner.pending);
                batch.frame = inner.next_frame;
                batch.time_send = now();
                inner.next_frame += 1;
                inner.in_flight = Some(batch);
            }
            let batch = match &inner.in_flight {
                Some(batch) => batch.clone(),
                None => return Err(VantageError::InvalidState("no batch in flight".into())),
            };
            let schema: Vec<(String, ValueType)> = batch
                .entries()
                .iter()
                .filter(|s| !inner.keeper.get(&s.name).is_some_and(NamedValue::announced))
                .map(|s| (s.name.clone(), s.value_type()))
                .collect();
            (connection, batch, schema)
        };

        let frame = batch.frame;
        let failed = |e: VantageError| {
            warn!(frame, error = %e, "publish failed, batch retained");
            match e {
                VantageError::Publish { .. } => e,
                other => VantageError::Publish { frame, message: other.to_string() },
            }
        };
        if !schema.is_empty() {
            self.transport.send_announce(&connection, &schema).map_err(failed)?;
            self.inner.lock()?.keeper.mark_announced(schema.iter().map(|(name, _)| name.as_str()));
            debug!(frame, count = schema.len(), "schema announced with publish");
        }
        self.transport.send_publish(&connection, &batch).map_err(failed)?;

        let mut inner = self.inner.lock()?;
        inner.in_flight = None;
        let receipt = PublishReceipt { frame, entries: batch.len(), pending: !inner.pending.is_empty() };
        info!(frame, entries = receipt.entries, "published");
        Ok(receipt)
    }

    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let connection = self.inner.lock()?.ensure_active()?.clone();
        let result = self.transport.send_query(&connection, sql)?;
        debug!(rows = result.len(), columns = result.columns.len(), "query answered");
        Ok(result)
    }

    /// Flushes what it can, disconnects and closes the session for good.
    /// Flush failures are logged, not returned.
    pub fn finalize(&self) -> Result<()> {
        let state = self.inner.lock()?.state;
        match state {
            Lifecycle::Finalized => return Ok(()),
            Lifecycle::Uninitialized => self.inner.lock()?.state = Lifecycle::Finalized,
            Lifecycle::Active => {
                for round in 1..=2 {
                    if !self.has_unacknowledged() && self.pending_len() == 0 {
                        break;
                    }
                    if let Err(e) = self.publish() {
                        warn!(round, error = %e, "flush during finalize failed");
                    }
                }
                let connection = {
                    let mut inner = self.inner.lock()?;
                    inner.state = Lifecycle::Finalized;
                    inner.connection.take()
                };
                if let Some(connection) = connection {
                    if let Err(e) = self.transport.disconnect(&connection) {
                        warn!(guid = connection.guid, error = %e, "disconnect failed");
                    }
                }
            }
        }
        if let Some(daemon) = self.daemon.lock()?.take() {
            if let Err(e) = daemon.shutdown() {
                warn!(error = %e, "daemon shutdown failed");
            }
        }
        info!("session finalized");
        Ok(())
    }

    pub fn state(&self) -> Lifecycle {
        self.lock().state
    }

    pub fn value(&self, name: &str) -> Option<NamedValue> {
        self.lock().keeper.get(name).cloned()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.lock().keeper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().keeper.is_empty()
    }

    /// Names packed since the last batch was cut.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether a batch failed to send and waits to be resent.
    pub fn has_unacknowledged(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    pub fn guid(&self) -> Option<u64> {
        self.lock().connection.as_ref().map(|c| c.guid)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == Lifecycle::Active {
            if let Err(e) = self.finalize() {
                warn!(error = %e, "finalize on drop failed");
            }
        }
    }
}
