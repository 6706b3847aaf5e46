use thiserror::Error;

use crate::DestinationKey;

#[derive(Error, Debug)]
pub enum SinkError {
    /// The destination of a record could not be resolved, or the destination
    /// table could not be prepared. Fatal for the record.
    #[error("Routing error: {0}")]
    Routing(String),

    /// The target rejected a flush.
    #[error("Load error for {table}: {reason} (applied {applied}, rejected {rejected})")]
    Load {
        table: DestinationKey,
        applied: u64,
        rejected: u64,
        reason: String,
    },

    #[error("Session conflict: a pull session is already attached to {0}")]
    SessionConflict(String),

    #[error("Protocol timeout: {0}")]
    ProtocolTimeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is closed")]
    Closed(String),
}

impl SinkError {
    /// Whether a failed write cycle may succeed if it is attempted again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SinkError::Load { .. } | SinkError::Database(_) | SinkError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SinkError>;
