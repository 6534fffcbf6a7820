//! Error types for socket flows.
//!
//! These are only returned while a flow or server is being established.
//! Once a flow is open, failures are reported as end of stream instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from opening flows and servers.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The connection registry is full.
    #[error("Too many connections")]
    TooManyConnections,

    /// Failed to connect to a peer.
    #[error("Failed to connect to {peer}: {source}")]
    Connect {
        /// The peer we tried to reach.
        peer: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to bind a listening socket.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// The address we tried to bind.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Refused to replace something that is not a socket.
    #[error("Refusing to remove {0}: not a Unix domain socket")]
    UnsafePath(PathBuf),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FlowError {
    /// The underlying I/O error kind, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            FlowError::Connect { source, .. } | FlowError::Bind { source, .. } => {
                Some(source.kind())
            }
            FlowError::Io(e) => Some(e.kind()),
            FlowError::TooManyConnections | FlowError::UnsafePath(_) => None,
        }
    }
}

/// Result type for flow operations.
pub type FlowResult<T> = Result<T, FlowError>;
