//! TCP flows and servers.

use async_trait::async_trait;
use socket2::SockRef;
use std::io;
use std::future::poll_fn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::stream::{StreamFlow, StreamSocket};
use super::{
    Flow, FlowError, FlowResult, StreamListener, connect_within, is_listener_fault, lock,
    signalled,
};
use crate::registry::{ConnectionRegistry, Registration};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[async_trait]
impl StreamSocket for TcpStream {
    async fn wait_readable(&self) -> io::Result<()> {
        self.readable().await
    }

    async fn wait_writable(&self) -> io::Result<()> {
        self.writable().await
    }

    fn try_read_buf(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn try_write_buf(&self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }

    fn shutdown_socket(&self, how: Shutdown) -> io::Result<()> {
        SockRef::from(self).shutdown(how)
    }
}

/// A connected TCP flow.
pub type TcpFlow = StreamFlow<TcpStream>;

impl StreamFlow<TcpStream> {
    /// Connect to `addr`.
    ///
    /// The connection is registered before the connect is attempted, so a
    /// failed attempt is accounted for and then released.
    ///
    /// # Errors
    ///
    /// [`FlowError::TooManyConnections`] if the registry is full, otherwise
    /// [`FlowError::Connect`] naming the peer.
    pub async fn connect(addr: SocketAddr, registry: &Arc<ConnectionRegistry>) -> FlowResult<Self> {
        let registration = registry.acquire(format!("tcp:{}", addr))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| FlowError::Connect {
                peer: addr.to_string(),
                source,
            })?;
        Ok(Self::from_connected(stream, addr, registration))
    }

    /// Connect to `addr`, giving up after `timeout`.
    ///
    /// On expiry the half-open socket is dropped, its registry entry is
    /// released and the error kind is `TimedOut`.
    pub async fn connect_timeout(
        addr: SocketAddr,
        timeout: Duration,
        registry: &Arc<ConnectionRegistry>,
    ) -> FlowResult<Self> {
        connect_within(&addr.to_string(), timeout, Self::connect(addr, registry)).await
    }

    fn from_connected(stream: TcpStream, peer: SocketAddr, registration: Registration) -> Self {
        let description = match stream.local_addr() {
            Ok(local) => format!("tcp:{}->{}", local, peer),
            Err(_) => format!("tcp:->{}", peer),
        };
        Self::new(stream, description, registration)
    }

    /// The remote address, if still known.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket().peer_addr()
    }
}

/// Whether binding `ip` should also try `[::1]` on the same port.
///
/// Clients resolving `localhost` may pick IPv6 first; listening there too
/// keeps them from getting a connection refused.
fn wants_ipv6_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED || v4.is_loopback(),
        IpAddr::V6(_) => false,
    }
}

/// A listening TCP server, possibly dual-bound to `[::1]`.
///
/// [`StreamListener::close`] drops the native sockets before returning, so
/// the port can be bound again straight away.
pub struct TcpServer {
    listeners: Mutex<Vec<TcpListener>>,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    registrations: Vec<Registration>,
    closed: watch::Sender<bool>,
}

impl TcpServer {
    /// Bind a listening socket on `addr`.
    ///
    /// # Errors
    ///
    /// [`FlowError::Bind`] with the OS error (address in use, address not
    /// available, permission denied). Listening sockets are registered
    /// without checking the connection ceiling.
    pub async fn bind(addr: SocketAddr, registry: &Arc<ConnectionRegistry>) -> FlowResult<Self> {
        let primary = TcpListener::bind(addr)
            .await
            .map_err(|source| FlowError::Bind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = primary.local_addr()?;

        let mut listeners = vec![primary];
        let mut registrations =
            vec![registry.acquire_unconditional(format!("tcp:{} (listening)", local_addr))];

        if wants_ipv6_loopback(addr.ip()) {
            let secondary = SocketAddr::from((Ipv6Addr::LOCALHOST, local_addr.port()));
            match TcpListener::bind(secondary).await {
                Ok(listener) => {
                    debug!("Also listening on {}", secondary);
                    listeners.push(listener);
                    registrations.push(
                        registry.acquire_unconditional(format!("tcp:{} (listening)", secondary)),
                    );
                }
                Err(e) => debug!("Best-effort bind of {} failed: {}", secondary, e),
            }
        }

        let (closed, _) = watch::channel(false);
        Ok(Self {
            listeners: Mutex::new(listeners),
            local_addr,
            registry: Arc::clone(registry),
            registrations,
            closed,
        })
    }

    /// The resolved primary address (port 0 is replaced by the real port).
    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open native listening sockets: 1, or 2 with the IPv6
    /// loopback, and 0 once closed.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Poll every native listener. `None` once they have been closed.
    fn poll_accept_any(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
        let listeners = lock(&self.listeners);
        if listeners.is_empty() {
            return Poll::Ready(None);
        }
        for listener in listeners.iter() {
            if let Poll::Ready(accepted) = listener.poll_accept(cx) {
                return Poll::Ready(Some(accepted));
            }
        }
        Poll::Pending
    }
}

#[async_trait]
impl StreamListener for TcpServer {
    async fn accept(&self) -> FlowResult<Option<Box<dyn Flow>>> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return Ok(None);
            }
            let accepted = tokio::select! {
                _ = signalled(&mut closed) => return Ok(None),
                accepted = poll_fn(|cx| self.poll_accept_any(cx)) => accepted,
            };
            let Some(accepted) = accepted else {
                return Ok(None);
            };
            match accepted {
                Ok((stream, peer)) => {
                    let description = format!("tcp:{} (accepted on {})", peer, self.local_addr);
                    match self.registry.acquire(description) {
                        Ok(registration) => {
                            let flow = TcpFlow::from_connected(stream, peer, registration);
                            return Ok(Some(Box::new(flow)));
                        }
                        Err(_) => {
                            debug!("Dropping connection from {}: too many connections", peer);
                            drop(stream);
                        }
                    }
                }
                Err(e) if is_listener_fault(&e) => return Err(FlowError::Io(e)),
                Err(e) => {
                    warn!("Accept on {} failed: {}", self.local_addr, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        lock(&self.listeners).clear();
        for registration in &self.registrations {
            registration.release();
        }
    }

    fn local_addr(&self) -> String {
        format!("tcp:{}", self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ReadOutcome, WriteOutcome};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn localhost() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_ipv6_loopback_policy() {
        assert!(wants_ipv6_loopback(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(wants_ipv6_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!wants_ipv6_loopback(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!wants_ipv6_loopback(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[tokio::test]
    async fn test_bind_registers_and_close_releases() {
        let registry = Arc::new(ConnectionRegistry::new());
        let server = TcpServer::bind(localhost(), &registry).await.unwrap();
        assert_ne!(server.socket_addr().port(), 0);
        assert_eq!(registry.len(), server.listener_count());

        server.close();
        server.close();
        assert!(registry.is_empty());
        assert!(server.accept().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let registry = Arc::new(ConnectionRegistry::new());
        let first = TcpServer::bind(localhost(), &registry).await.unwrap();
        let second = TcpServer::bind(first.socket_addr(), &registry).await;
        let err = second.err().expect("second bind must fail");
        assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse));
        // The failed attempt must not stay registered.
        assert_eq!(registry.len(), first.listener_count());
    }

    #[tokio::test]
    async fn test_accept_read_write_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let server = TcpServer::bind(localhost(), &registry).await.unwrap();
        let addr = server.socket_addr();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let flow = server.accept().await.unwrap().unwrap();
        assert_eq!(flow.read().await, ReadOutcome::Data(bytes::Bytes::from_static(b"ping")));
        assert_eq!(flow.write(b"pong").await, WriteOutcome::Written);
        assert_eq!(&client.await.unwrap(), b"pong");

        // Peer closed after reading its reply.
        assert_eq!(flow.read().await, ReadOutcome::Eof);

        let before = registry.len();
        flow.close().await;
        flow.close().await;
        assert_eq!(registry.len(), before - 1);
        assert_eq!(flow.write(b"late").await, WriteOutcome::Eof);
    }

    #[tokio::test]
    async fn test_accept_drops_peer_over_ceiling() {
        let registry = Arc::new(ConnectionRegistry::with_max_connections(Some(1)));
        let server = Arc::new(TcpServer::bind(localhost(), &registry).await.unwrap());
        let addr = server.socket_addr();

        let accepting = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept().await })
        };

        let mut refused = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // The server closes the raw socket instead of handing it out.
        let n = refused.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        server.close();
        assert!(accepting.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused_is_released() {
        let registry = Arc::new(ConnectionRegistry::new());
        let addr = {
            let listener = std::net::TcpListener::bind(localhost()).unwrap();
            listener.local_addr().unwrap()
        };
        let err = TcpFlow::connect(addr, &registry).await.err().unwrap();
        assert!(matches!(err, FlowError::Connect { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connect_timeout_succeeds_quickly() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = TcpListener::bind(localhost()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let flow = TcpFlow::connect_timeout(addr, Duration::from_secs(5), &registry)
            .await
            .unwrap();
        assert_eq!(flow.peer_addr().unwrap(), addr);
        assert_eq!(registry.len(), 1);
        flow.close().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_frees_port_while_accept_pending() {
        let registry = Arc::new(ConnectionRegistry::new());
        let server = Arc::new(TcpServer::bind(localhost(), &registry).await.unwrap());
        let addr = server.socket_addr();

        let accepting = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept().await })
        };
        tokio::task::yield_now().await;

        // The accepting task still holds the server, but not the socket.
        server.close();
        assert_eq!(server.listener_count(), 0);
        let again = TcpServer::bind(addr, &registry).await.unwrap();
        assert_eq!(again.socket_addr(), addr);

        assert!(accepting.await.unwrap().unwrap().is_none());
        again.close();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_bind_ignores_connection_ceiling() {
        let registry = Arc::new(ConnectionRegistry::with_max_connections(Some(1)));
        let _held = registry.acquire("tcp:elsewhere").unwrap();

        let server = TcpServer::bind(localhost(), &registry).await.unwrap();
        assert_eq!(registry.len(), 1 + server.listener_count());

        // Outbound connects still honour it.
        let err = TcpFlow::connect(server.socket_addr(), &registry)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::TooManyConnections));
    }

    // A listener with a zero backlog stops answering SYNs once one
    // connection is queued, so further connects hang until timed out.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_connect_timeout_expires() {
        use socket2::{Domain, Socket, Type};

        let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        listener.bind(&localhost().into()).unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        let mut saturated = false;
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(stream) => queued.push(stream.unwrap()),
                Err(_) => {
                    saturated = true;
                    break;
                }
            }
        }
        assert!(saturated, "backlog never filled");

        let registry = Arc::new(ConnectionRegistry::new());
        let err = TcpFlow::connect_timeout(addr, Duration::from_millis(50), &registry)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::Connect { .. }));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::TimedOut));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_write_signals_eof() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = TcpListener::bind(localhost()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let flow = TcpFlow::connect(addr, &registry).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        flow.shutdown_write().await;
        flow.shutdown_write().await;
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        peer.write_all(b"still open").await.unwrap();
        assert_eq!(
            flow.read().await,
            ReadOutcome::Data(bytes::Bytes::from_static(b"still open"))
        );
        flow.close().await;
    }

    #[tokio::test]
    async fn test_listen_spawns_per_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let server = Arc::new(TcpServer::bind(localhost(), &registry).await.unwrap());
        let addr = server.socket_addr();

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                crate::flow::listen(&*server, |flow| async move {
                    if let ReadOutcome::Data(bytes) = flow.read().await {
                        flow.write(&bytes).await;
                    }
                    flow.close().await;
                })
                .await
            })
        };

        for msg in [b"one", b"two"] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(msg).await.unwrap();
            let mut reply = [0u8; 3];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, msg);
        }

        server.close();
        serving.await.unwrap().unwrap();
    }
}
