//! Accounting for live native sockets.
//!
//! Every flow or server that opens a socket registers a human-readable
//! description here and deregisters it on close. The table is bounded by an
//! optional ceiling so a flood of peers cannot exhaust file descriptors.
//!
//! The registry is an ordinary value shared through an `Arc`, so each
//! forwarder (and each test) can own an independent table.
//!
//! # Example
//!
//! ```
//! use portrelay::registry::ConnectionRegistry;
//!
//! let registry = ConnectionRegistry::with_max_connections(Some(1));
//! let first = registry.register("tcp:127.0.0.1:8080").unwrap();
//! assert!(registry.register("tcp:127.0.0.1:8081").is_err());
//!
//! registry.deregister(first);
//! assert!(registry.register("tcp:127.0.0.1:8081").is_ok());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::flow::FlowError;

/// Minimum interval between two "too many connections" warnings.
pub const OVERLOAD_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Opaque identifier of one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Raw numeric value, for diagnostics.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Table {
    next: u64,
    entries: BTreeMap<u64, String>,
    max_connections: Option<usize>,
    last_overload_warning: Option<Instant>,
}

impl Table {
    fn insert(&mut self, description: String) -> Handle {
        let handle = self.next;
        self.next += 1;
        self.entries.insert(handle, description);
        Handle(handle)
    }
}

/// Table of live connections with an optional ceiling.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    table: Mutex<Table>,
}

impl ConnectionRegistry {
    /// Create an unbounded registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that refuses entries once `max` are live.
    #[must_use]
    pub fn with_max_connections(max: Option<usize>) -> Self {
        Self {
            table: Mutex::new(Table {
                max_connections: max,
                ..Table::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the lock cannot leave the table half-updated.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a connection, subject to the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::TooManyConnections`] when the table is full. The
    /// table is left unchanged in that case.
    pub fn register(&self, description: impl Into<String>) -> Result<Handle, FlowError> {
        let mut table = self.lock();
        if let Some(max) = table.max_connections
            && table.entries.len() >= max
        {
            let now = Instant::now();
            let due = table
                .last_overload_warning
                .is_none_or(|last| now.duration_since(last) >= OVERLOAD_LOG_INTERVAL);
            if due {
                table.last_overload_warning = Some(now);
                warn!(
                    "Exceeded maximum number of concurrent connections ({}); refusing new ones",
                    max
                );
            }
            return Err(FlowError::TooManyConnections);
        }
        Ok(table.insert(description.into()))
    }

    /// Register a connection without checking the ceiling.
    ///
    /// Used for sockets accepted elsewhere and handed in already open.
    pub fn register_unconditional(&self, description: impl Into<String>) -> Handle {
        self.lock().insert(description.into())
    }

    /// Remove a connection. Removing an unknown handle only logs a warning.
    pub fn deregister(&self, handle: Handle) {
        if self.lock().entries.remove(&handle.0).is_none() {
            warn!("Connection {} deregistered more than once", handle);
        }
    }

    /// Descriptions of all live connections, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().entries.values().cloned().collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured ceiling, if any.
    #[must_use]
    pub fn max_connections(&self) -> Option<usize> {
        self.lock().max_connections
    }

    /// Change the ceiling. Existing entries are never evicted.
    pub fn set_max_connections(&self, max: Option<usize>) {
        self.lock().max_connections = max;
    }

    /// Register and wrap the handle in a guard that deregisters on drop.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionRegistry::register`].
    pub fn acquire(
        self: &Arc<Self>,
        description: impl Into<String>,
    ) -> Result<Registration, FlowError> {
        let handle = self.register(description)?;
        Ok(Registration::new(Arc::clone(self), handle))
    }

    /// Like [`ConnectionRegistry::acquire`] but bypasses the ceiling.
    pub fn acquire_unconditional(self: &Arc<Self>, description: impl Into<String>) -> Registration {
        let handle = self.register_unconditional(description);
        Registration::new(Arc::clone(self), handle)
    }
}

/// A registry entry owned by a flow or server.
///
/// Released at most once, either explicitly or when dropped.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    handle: Handle,
    released: AtomicBool,
}

impl Registration {
    fn new(registry: Arc<ConnectionRegistry>, handle: Handle) -> Self {
        Self {
            registry,
            handle,
            released: AtomicBool::new(false),
        }
    }

    /// The registry handle.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Deregister now. Returns `false` if this was already done.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.registry.deregister(self.handle);
        true
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let a = registry.register("a").unwrap();
        let b = registry.register("b").unwrap();
        registry.deregister(a);
        registry.deregister(b);
        let c = registry.register("c").unwrap();
        assert!(a < b && b < c);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ceiling_rejects_and_recovers() {
        let registry = ConnectionRegistry::with_max_connections(Some(3));
        let handles: Vec<_> = (0..3)
            .map(|i| registry.register(format!("conn {}", i)).unwrap())
            .collect();

        let result = registry.register("one too many");
        assert!(matches!(result, Err(FlowError::TooManyConnections)));
        assert_eq!(registry.len(), 3);

        registry.deregister(handles[1]);
        assert!(registry.register("fits again").is_ok());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_unconditional_bypasses_ceiling() {
        let registry = ConnectionRegistry::with_max_connections(Some(0));
        assert!(registry.register("refused").is_err());
        registry.register_unconditional("handed in");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_deregister_is_harmless() {
        let registry = ConnectionRegistry::new();
        let handle = registry.register("once").unwrap();
        registry.deregister(handle);
        registry.deregister(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_by_handle() {
        let registry = ConnectionRegistry::new();
        registry.register("first").unwrap();
        let second = registry.register("second").unwrap();
        registry.register("third").unwrap();
        registry.deregister(second);
        assert_eq!(registry.snapshot(), vec!["first", "third"]);
    }

    #[test]
    fn test_registration_releases_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let registration = registry.acquire("guarded").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registration.release());
        assert!(!registration.release());
        drop(registration);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_released_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        {
            let _registration = registry.acquire_unconditional("scoped");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_respects_ceiling() {
        let registry = Arc::new(ConnectionRegistry::with_max_connections(Some(8)));
        let threads: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register(format!("t{}", i)).is_ok())
            })
            .collect();
        let accepted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 8);
        assert_eq!(registry.len(), 8);
    }
}
