//! Error types for storage and position persistence
//!
//! Read-path failures (`NotFound`, `EndOfStream`) are recoverable: callers are
//! expected to wait and retry, or fall back to another position class.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Index has no oldest/latest/matching entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// No further data is currently available
    #[error("End of stream")]
    EndOfStream,

    /// A stored frame failed its CRC or length check
    #[error("Corrupted record at {location}: {reason}")]
    Corrupted { location: String, reason: String },

    /// Another writer holds the database's storage
    #[error("Writer busy: {0}")]
    WriterBusy(String),

    /// Lifecycle misuse (e.g. reading from a channel that was never started)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn corrupted(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Whether waiting and retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::EndOfStream | Self::WriterBusy(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Corrupted { .. }
            | Self::InvalidState(_)
            | Self::InvalidConfig(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::EndOfStream => "end_of_stream",
            Self::Corrupted { .. } => "corrupted",
            Self::WriterBusy(_) => "writer_busy",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Other(_) => "unknown",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
