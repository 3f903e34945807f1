use thiserror::Error;

use crate::datatype::ValueType;

#[derive(Error, Debug)]
pub enum VantageError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Type mismatch for '{name}': announced as {announced}, packed as {packed}")]
    TypeMismatch { name: String, announced: ValueType, packed: ValueType },
    #[error("Value out of range for {value_type}: {value}")]
    ValueRange { value_type: ValueType, value: String },
    #[error("Value of kind {found} cannot be stored as {expected}")]
    ValueKind { expected: ValueType, found: &'static str },
    #[error("Invalid value name '{0}'")]
    InvalidName(String),
    #[error("Schema not announced for '{0}'")]
    SchemaNotAnnounced(String),
    #[error("Publish failed for frame {frame}: {message}")]
    Publish { frame: u64, message: String },
    #[error("A publish is already in flight")]
    PublishInProgress,
    #[error("Query syntax error: {0}")]
    QuerySyntax(String),
    #[error("Query execution error: {0}")]
    QueryExecution(String),
    #[error("Session is closed")]
    SessionClosed,
    #[error("Invalid session state: {0}")]
    InvalidState(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, VantageError>;

// Helper conversions
impl From<rusqlite::Error> for VantageError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}

impl From<config::ConfigError> for VantageError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}

impl<T> From<std::sync::PoisonError<T>> for VantageError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
