//! Error types for transport channels.

use thiserror::Error;

/// Errors from dialling or listening on a transport channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The port spec could not be parsed. No connection was attempted.
    #[error("Invalid transport address: {0}")]
    InvalidAddress(String),

    /// The connect, bind or accept failed.
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No transport backend exists for this platform.
    #[error("Transport not supported on this platform")]
    Unsupported,
}

impl TransportError {
    /// The underlying I/O error kind, if any.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
