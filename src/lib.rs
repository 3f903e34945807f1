//! Vantage – typed observation publishing with a queryable store.
//!
//! A process opens a [`session::Session`], packs named, typed values into it,
//! announces their schema and publishes them in batches to a collection
//! backend. Published observations land in an SQLite store that can later be
//! queried with a small SQL subset.
//!
//! * A [`construct::NamedValue`] has a fixed [`datatype::ValueType`]
//!   (`Integer32`, `Integer64`, `Double` or `String`) and a sequence number
//!   that grows with every pack.
//! * A [`construct::PublicationBatch`] holds the latest snapshot of every name
//!   packed since the previous publish.
//! * The backend is a [`daemon::Daemon`] thread owning a [`persist::Persistor`];
//!   sessions reach it through the [`transport::Transport`] trait, framed with
//!   [`message`].
//!
//! ## Modules
//! * [`datatype`] – value kinds, typed values and their wire codec.
//! * [`construct`] – named values, snapshots, batches and the value keeper.
//! * [`message`] – framed requests exchanged with the daemon.
//! * [`persist`] – the SQLite observation store.
//! * [`sql`] – parser for the accepted query subset (grammar in `sql.pest`).
//! * [`daemon`] – the store-owning backend thread.
//! * [`transport`] – backend boundary and its channel implementation.
//! * [`session`] – the publishing session and its lifecycle.
//! * [`config`] – layered settings.
//! * [`server`] – HTTP query endpoint served by `vantaged`.
//!
//! ## Quick Start
//! ```
//! use vantage::{config::Settings, datatype::ValueType, session::Session};
//! let session = Session::local(&Settings::default()).unwrap();
//! session.pack("x", ValueType::Integer32, 0).unwrap();
//! session.announce().unwrap();
//! session.publish().unwrap();
//! let result = session.query("select * from tblvals where rowid < 11;").unwrap();
//! assert!(result.column_index("x").is_some());
//! session.finalize().unwrap();
//! ```

pub mod config;
pub mod construct;
pub mod daemon;
pub mod datatype;
pub mod error;
pub mod message;
pub mod persist;
pub mod server;
pub mod session;
pub mod sql;
pub mod transport;

pub use error::{Result, VantageError};
