//! Error types for port forwards.

use std::io;
use thiserror::Error;

use crate::flow::FlowError;

/// Errors from building or running a port forward.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The port description could not be parsed.
    #[error("Invalid port: {0}")]
    InvalidAddress(String),

    /// The host-side listener or endpoint could not be bound.
    #[error("Failed to bind {port}: {source}")]
    BindFailure {
        /// The port being forwarded.
        port: String,
        /// Why the bind failed.
        #[source]
        source: io::Error,
    },

    /// The connection ceiling was reached.
    #[error("Too many connections")]
    TooManyConnections,

    /// The listener failed after it was bound.
    #[error("Transport failure: {0}")]
    TransportFailure(#[source] io::Error),

    /// The multiplexer could not reach the destination.
    #[error("Unable to reach {destination}: {reason}")]
    DestinationUnreachable {
        /// Where the forward dials.
        destination: String,
        /// Why the dial failed.
        reason: String,
    },
}

impl ForwardError {
    /// The underlying I/O error kind, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::BindFailure { source, .. } | Self::TransportFailure(source) => Some(source.kind()),
            _ => None,
        }
    }

    /// Map a bind-time flow error for `port`.
    pub(crate) fn from_bind(port: &impl std::fmt::Display, err: FlowError) -> Self {
        let port = port.to_string();
        match err {
            FlowError::TooManyConnections => Self::TooManyConnections,
            FlowError::Bind { source, .. } | FlowError::Io(source) => {
                Self::BindFailure { port, source }
            }
            FlowError::Connect { source, .. } => Self::BindFailure { port, source },
            FlowError::UnsafePath(path) => Self::BindFailure {
                port,
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("refusing to remove {}: not a socket", path.display()),
                ),
            },
        }
    }
}

/// Result type for forward operations.
pub type ForwardResult<T> = Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_bind_failure_keeps_kind() {
        let err = ForwardError::from_bind(
            &"tcp:127.0.0.1:80:tcp:10.0.0.2:80",
            FlowError::Bind {
                address: "127.0.0.1:80".to_string(),
                source: io::Error::from(io::ErrorKind::AddrInUse),
            },
        );
        assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse));
        assert!(err.to_string().contains("tcp:127.0.0.1:80"));
    }

    #[test]
    fn test_unsafe_path_is_a_bind_failure() {
        let err = ForwardError::from_bind(&"unix:/a:unix:/b", FlowError::UnsafePath(PathBuf::from("/a")));
        assert!(matches!(err, ForwardError::BindFailure { .. }));
        assert!(err.to_string().contains("refusing to remove /a"));
    }

    #[test]
    fn test_ceiling_maps_across() {
        let err = ForwardError::from_bind(&"udp:0.0.0.0:53:udp:10.0.0.2:53", FlowError::TooManyConnections);
        assert!(matches!(err, ForwardError::TooManyConnections));
    }
}
