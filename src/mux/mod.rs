//! Connection multiplexer contract.
//!
//! Forwards never open connections into the VM themselves. They ask the
//! current [`Multiplexer`] to dial a [`Destination`] and relay whatever flow
//! comes back. The multiplexer is looked up through a [`Control`] at dial
//! time, so it can be replaced while forwards are running.

mod direct;

pub use direct::DirectMux;

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::flow::{Flow, FlowError};
use crate::port::Destination;

/// Errors from multiplexer operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Opening a flow to the destination failed.
    #[error("Dial {destination} failed: {source}")]
    Dial {
        /// Where we tried to go.
        destination: String,
        /// What went wrong.
        #[source]
        source: FlowError,
    },

    /// The multiplexer does not support this operation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// The multiplexer has been closed.
    #[error("Multiplexer is closed")]
    Closed,
}

/// Result type for multiplexer operations.
pub type MuxResult<T> = Result<T, MuxError>;

/// Opens and accepts flows through a shared connection.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Open a new flow to `destination`.
    async fn dial(&self, destination: &Destination) -> MuxResult<Box<dyn Flow>>;

    /// Wait for a flow opened by the remote side.
    async fn accept(&self) -> MuxResult<(Box<dyn Flow>, Destination)>;

    /// Start processing. Returns once running.
    fn run(&self);

    /// Whether `run` has been called and `close` has not.
    fn is_running(&self) -> bool;

    /// Shut down. Idempotent.
    async fn close(&self);
}

/// Source of the current multiplexer.
pub trait Control: Send + Sync {
    /// The multiplexer to dial through, if one is connected.
    fn mux(&self) -> Option<Arc<dyn Multiplexer>>;
}

/// A [`Control`] holding a replaceable multiplexer.
#[derive(Default)]
pub struct StaticControl {
    mux: RwLock<Option<Arc<dyn Multiplexer>>>,
}

impl StaticControl {
    /// A control with `mux` already connected.
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            mux: RwLock::new(Some(mux)),
        }
    }

    /// A control with no multiplexer yet.
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Replace the multiplexer. `None` disconnects.
    pub fn set_mux(&self, mux: Option<Arc<dyn Multiplexer>>) {
        *self.mux.write().unwrap_or_else(|p| p.into_inner()) = mux;
    }
}

impl Control for StaticControl {
    fn mux(&self) -> Option<Arc<dyn Multiplexer>> {
        self.mux.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use std::time::Duration;

    #[test]
    fn test_static_control_swaps_mux() {
        let control = StaticControl::disconnected();
        assert!(control.mux().is_none());

        let registry = Arc::new(ConnectionRegistry::new());
        let mux: Arc<dyn Multiplexer> = Arc::new(DirectMux::new(registry, Duration::from_secs(1)));
        control.set_mux(Some(Arc::clone(&mux)));
        assert!(control.mux().is_some_and(|m| Arc::ptr_eq(&m, &mux)));

        control.set_mux(None);
        assert!(control.mux().is_none());
    }

    #[test]
    fn test_dial_error_names_destination() {
        let err = MuxError::Dial {
            destination: "tcp:10.0.0.2:80".to_string(),
            source: FlowError::TooManyConnections,
        };
        assert!(err.to_string().contains("tcp:10.0.0.2:80"));
    }
}
