//! Uniform flows over TCP, UDP and Unix domain sockets.
//!
//! A [`Flow`] is an open byte stream with one set of semantics regardless of
//! the socket underneath:
//!
//! - `read` yields data or [`ReadOutcome::Eof`]; resets and unexpected
//!   errors are reported as end of stream, never raised
//! - `write` sends the whole buffer or reports [`WriteOutcome::Eof`]
//! - `shutdown_read` / `shutdown_write` half-close and are idempotent
//! - `close` is idempotent and releases the registry entry
//!
//! All methods take `&self`, so the relay can read one direction while
//! writing the other.
//!
//! # Servers
//!
//! Stream servers ([`TcpServer`], [`UnixServer`]) implement
//! [`StreamListener`]. The datagram side is a [`UdpEndpoint`] that yields
//! individual packets.

mod channel;
mod error;
mod stream;
mod tcp;
mod udp;
#[cfg(unix)]
mod unix;

pub use channel::ChannelFlow;
pub use error::{FlowError, FlowResult};
pub use stream::{StreamFlow, StreamSocket};
pub use tcp::{TcpFlow, TcpServer};
pub use udp::{UdpEndpoint, UdpFlow, send_to};
#[cfg(unix)]
pub use unix::{UnixFlow, UnixServer};

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Size of the buffer used for a single stream read.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Label used when a peer address cannot be determined.
pub const UNKNOWN_PEER: &str = "unknown";

/// Result of reading from a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes received from the peer.
    Data(Bytes),
    /// The flow is finished, cleanly or not.
    Eof,
}

/// Result of writing to a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole buffer was sent.
    Written,
    /// The peer is gone; nothing more can be written.
    Eof,
}

/// An open connection with uniform read/write/shutdown/close semantics.
#[async_trait]
pub trait Flow: Send + Sync {
    /// Read the next chunk of data.
    async fn read(&self) -> ReadOutcome;

    /// Write the whole buffer.
    async fn write(&self, buf: &[u8]) -> WriteOutcome;

    /// Stop receiving. Idempotent.
    async fn shutdown_read(&self);

    /// Stop sending, signalling end of stream to the peer. Idempotent.
    async fn shutdown_write(&self);

    /// Close the flow and deregister it. Idempotent.
    async fn close(&self);

    /// Human-readable description, used in logs.
    fn description(&self) -> &str;
}

/// A listening stream server.
#[async_trait]
pub trait StreamListener: Send + Sync {
    /// Wait for the next peer.
    ///
    /// Returns `Ok(None)` once the server has been closed. Individual bad
    /// accepts are logged and skipped; an error means the listening socket
    /// itself has failed.
    async fn accept(&self) -> FlowResult<Option<Box<dyn Flow>>>;

    /// Stop accepting and release the registry entries. Idempotent.
    fn close(&self);

    /// The logical address being listened on.
    fn local_addr(&self) -> String;
}

/// Run an accept loop, spawning `on_accept` for every peer.
///
/// Returns when the server is closed or fails.
pub async fn listen<L, F, Fut>(server: &L, on_accept: F) -> FlowResult<()>
where
    L: StreamListener + ?Sized,
    F: Fn(Box<dyn Flow>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    while let Some(flow) = server.accept().await? {
        tokio::spawn(on_accept(flow));
    }
    debug!("Stopped accepting on {}", server.local_addr());
    Ok(())
}

/// Wait until a watch flag becomes `true` or its sender goes away.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run `connecting`, failing with a `TimedOut` connect error after `timeout`.
///
/// On expiry `connecting` is dropped, taking the half-made socket and its
/// registry entry with it.
pub(crate) async fn connect_within<T, F>(
    peer: &str,
    timeout: Duration,
    connecting: F,
) -> FlowResult<T>
where
    F: Future<Output = FlowResult<T>>,
{
    match tokio::time::timeout(timeout, connecting).await {
        Ok(result) => result,
        Err(_elapsed) => Err(FlowError::Connect {
            peer: peer.to_string(),
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeout),
            ),
        }),
    }
}

/// Whether an I/O error is a routine disconnect rather than a fault.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}

/// Map a read error to end of stream, logging it unless it is routine.
pub(crate) fn read_failed(description: &str, e: &io::Error) -> ReadOutcome {
    if is_disconnect(e) {
        debug!("{}: read ended: {}", description, e);
    } else {
        warn!("{}: unexpected error reading: {}", description, e);
    }
    ReadOutcome::Eof
}

/// Map a write error to end of stream, logging it unless it is routine.
pub(crate) fn write_failed(description: &str, e: &io::Error) -> WriteOutcome {
    if is_disconnect(e) {
        debug!("{}: write ended: {}", description, e);
    } else {
        warn!("{}: unexpected error writing: {}", description, e);
    }
    WriteOutcome::Eof
}

/// Log a shutdown failure, ignoring the already-disconnected case.
pub(crate) fn shutdown_failed(description: &str, e: &io::Error) {
    if e.kind() != io::ErrorKind::NotConnected {
        debug!("{}: shutdown failed: {}", description, e);
    }
}

/// Whether an accept error means the listening socket itself is unusable.
pub(crate) fn is_listener_fault(e: &io::Error) -> bool {
    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return matches!(code, libc::EBADF | libc::EINVAL | libc::ENOTSOCK);
    }
    e.kind() == io::ErrorKind::InvalidInput
}
