//! UDP endpoints and datagram flows.
//!
//! A [`UdpEndpoint`] is a bound, unconnected socket that yields one datagram
//! at a time. Each datagram is copied into its own buffer so callers can hand
//! it to another task while the next one is being received.
//!
//! A [`UdpFlow`] comes in two shapes:
//!
//! - **already read**: built from a datagram the endpoint has received. The
//!   first `read` returns that payload, every later `read` is EOF. Writes go
//!   back to the sender through the endpoint's socket, and fail once the
//!   endpoint is closed.
//! - **connected**: a registered socket connected to one peer, used when
//!   dialling a UDP destination.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    Flow, FlowError, FlowResult, ReadOutcome, WriteOutcome, lock, read_failed, signalled,
    write_failed,
};
use crate::registry::{ConnectionRegistry, Registration};

/// Default receive buffer: larger than any UDP payload.
pub const DEFAULT_RECV_BUFFER: usize = 64 * 1024;

/// The endpoint's native socket, shared with the flows built from it.
///
/// Emptied by [`UdpEndpoint::close`], which frees the port even while
/// flows still refer to the slot.
struct SocketSlot(Mutex<Option<UdpSocket>>);

impl SocketSlot {
    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "UDP endpoint closed")
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        poll_fn(|cx| {
            let slot = lock(&self.0);
            let Some(socket) = slot.as_ref() else {
                return Poll::Ready(Err(Self::closed_error()));
            };
            let mut read = ReadBuf::new(&mut *buf);
            socket
                .poll_recv_from(cx, &mut read)
                .map_ok(|from| (read.filled().len(), from))
        })
        .await
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        poll_fn(|cx| match lock(&self.0).as_ref() {
            Some(socket) => socket.poll_send_to(cx, buf, addr),
            None => Poll::Ready(Err(Self::closed_error())),
        })
        .await
    }

    fn close(&self) {
        lock(&self.0).take();
    }
}

/// A bound, unconnected UDP socket.
pub struct UdpEndpoint {
    socket: Arc<SocketSlot>,
    local_addr: SocketAddr,
    recv_buffer: usize,
    registration: Registration,
    closed: watch::Sender<bool>,
}

impl UdpEndpoint {
    /// Bind a UDP socket on `addr`.
    ///
    /// # Errors
    ///
    /// [`FlowError::Bind`] with the OS error. The endpoint is registered
    /// without checking the connection ceiling.
    pub async fn bind(addr: SocketAddr, registry: &Arc<ConnectionRegistry>) -> FlowResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| FlowError::Bind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = socket.local_addr()?;
        let registration =
            registry.acquire_unconditional(format!("udp:{} (listening)", local_addr));
        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(SocketSlot(Mutex::new(Some(socket)))),
            local_addr,
            recv_buffer: DEFAULT_RECV_BUFFER,
            registration,
            closed,
        })
    }

    /// Use a receive buffer of `size` bytes.
    ///
    /// Datagrams that do not fit are dropped rather than delivered truncated.
    #[must_use]
    pub fn with_recv_buffer(mut self, size: usize) -> Self {
        self.recv_buffer = size.max(1);
        self
    }

    /// The resolved local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive the next datagram.
    ///
    /// Returns `Ok(None)` once the endpoint is closed. A datagram that fills
    /// the whole receive buffer is assumed truncated, logged and skipped.
    ///
    /// # Errors
    ///
    /// Only when the socket itself fails.
    pub async fn recv(&self) -> FlowResult<Option<(Bytes, SocketAddr)>> {
        let mut closed = self.closed.subscribe();
        let mut buf = vec![0u8; self.recv_buffer];
        loop {
            if *closed.borrow() {
                return Ok(None);
            }
            let received = tokio::select! {
                _ = signalled(&mut closed) => return Ok(None),
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Err(_) if self.is_closed() => return Ok(None),
                Ok((n, from)) if n >= buf.len() => {
                    warn!(
                        "Dropping datagram from {} on {}: larger than {} bytes",
                        from, self.local_addr, buf.len()
                    );
                }
                Ok((n, from)) => return Ok(Some((Bytes::copy_from_slice(&buf[..n]), from))),
                // An ICMP port-unreachable from an earlier send, reported here.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("Ignoring {} on {}", e, self.local_addr);
                }
                Err(e) => return Err(FlowError::Io(e)),
            }
        }
    }

    /// Stop receiving, close the native socket and release the registry
    /// entry. Idempotent.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.socket.close();
        self.registration.release();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Send one datagram from `endpoint` to `addr`.
///
/// Datagrams are all-or-nothing, so there is no partial-write retry.
pub async fn send_to(endpoint: &UdpEndpoint, addr: SocketAddr, buf: &[u8]) -> io::Result<()> {
    let n = endpoint.socket.send_to(buf, addr).await?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short datagram send: {} of {} bytes", n, buf.len()),
        ));
    }
    Ok(())
}

enum Inner {
    AlreadyRead {
        socket: Arc<SocketSlot>,
        peer: SocketAddr,
        payload: Mutex<Option<Bytes>>,
    },
    Connected {
        socket: UdpSocket,
        registration: Registration,
    },
}

/// A datagram flow.
pub struct UdpFlow {
    inner: Inner,
    description: String,
    closed: watch::Sender<bool>,
    close_started: AtomicBool,
}

impl UdpFlow {
    /// A flow holding one datagram already received by `endpoint`.
    ///
    /// It shares the endpoint's socket and has no registry entry of its own.
    pub fn already_read(endpoint: &UdpEndpoint, peer: SocketAddr, payload: Bytes) -> Self {
        Self::build(
            Inner::AlreadyRead {
                socket: Arc::clone(&endpoint.socket),
                peer,
                payload: Mutex::new(Some(payload)),
            },
            format!("udp:{} (via {})", peer, endpoint.local_addr),
        )
    }

    /// A registered UDP socket connected to `addr`.
    ///
    /// # Errors
    ///
    /// [`FlowError::TooManyConnections`] or [`FlowError::Connect`].
    pub async fn connect(addr: SocketAddr, registry: &Arc<ConnectionRegistry>) -> FlowResult<Self> {
        let description = format!("udp:{}", addr);
        let registration = registry.acquire(description.clone())?;
        let local: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let connect_err = |source| FlowError::Connect {
            peer: addr.to_string(),
            source,
        };
        let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
        socket.connect(addr).await.map_err(connect_err)?;
        Ok(Self::build(
            Inner::Connected {
                socket,
                registration,
            },
            description,
        ))
    }

    fn build(inner: Inner, description: String) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner,
            description,
            closed,
            close_started: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Flow for UdpFlow {
    async fn read(&self) -> ReadOutcome {
        if self.is_closed() {
            return ReadOutcome::Eof;
        }
        match &self.inner {
            Inner::AlreadyRead { payload, .. } => {
                let taken = payload
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                match taken {
                    Some(bytes) => ReadOutcome::Data(bytes),
                    None => ReadOutcome::Eof,
                }
            }
            Inner::Connected { socket, .. } => {
                let mut closed = self.closed.subscribe();
                let mut buf = vec![0u8; DEFAULT_RECV_BUFFER];
                loop {
                    let received = tokio::select! {
                        _ = signalled(&mut closed) => return ReadOutcome::Eof,
                        received = socket.recv(&mut buf) => received,
                    };
                    match received {
                        Ok(n) if n >= buf.len() => {
                            warn!("{}: dropping oversized datagram", self.description);
                        }
                        Ok(n) => {
                            buf.truncate(n);
                            return ReadOutcome::Data(Bytes::from(buf));
                        }
                        // Nothing listening at the peer yet; keep waiting.
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                            debug!("{}: {}", self.description, e);
                        }
                        Err(e) => return read_failed(&self.description, &e),
                    }
                }
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> WriteOutcome {
        if self.is_closed() {
            return WriteOutcome::Eof;
        }
        let sent = match &self.inner {
            Inner::AlreadyRead { socket, peer, .. } => socket.send_to(buf, *peer).await,
            Inner::Connected { socket, .. } => socket.send(buf).await,
        };
        match sent {
            Ok(_) => WriteOutcome::Written,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("{}: {}", self.description, e);
                WriteOutcome::Written
            }
            Err(e) => write_failed(&self.description, &e),
        }
    }

    // Datagram sockets have no half-close.
    async fn shutdown_read(&self) {}

    async fn shutdown_write(&self) {}

    async fn close(&self) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            debug!("{}: already closed", self.description);
            return;
        }
        self.closed.send_replace(true);
        if let Inner::Connected { registration, .. } = &self.inner {
            registration.release();
        }
    }

    fn description(&self) -> &str {
        &self.description
    }
}
