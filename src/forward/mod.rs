//! Port forwards.
//!
//! A [`Forward`] owns the host-side listener (TCP, Unix) or endpoint (UDP)
//! for one [`Port`] and relays every peer to the port's fixed
//! [`Destination`] through the current multiplexer.
//!
//! # Lifecycle
//!
//! ```text
//! make() ──► Created ──run()──► Running ──stop()──► Stopped
//!               └──────────────stop()──────────────────┘
//! ```
//!
//! Binding happens in [`Forward::make`], so address conflicts are reported
//! before anything runs. [`Forward::stop`] closes the listener at once;
//! [`Forward::stopped`] waits for the loop and its relays to finish.

mod datagram;
mod error;
mod stream;

pub use error::{ForwardError, ForwardResult};

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::flow::{StreamListener, TcpServer, UdpEndpoint, lock};
use crate::mux::Control;
use crate::port::{Destination, Port, Protocol};
use crate::registry::ConnectionRegistry;

/// Default time after which a silent UDP session is dropped.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings shared by every forward.
#[derive(Clone)]
pub struct ForwardOptions {
    /// Registry accounting every socket the forward opens.
    pub registry: Arc<ConnectionRegistry>,
    /// How long a UDP source may stay silent before its session is dropped.
    pub udp_idle_timeout: Duration,
}

impl ForwardOptions {
    /// Options with defaults, accounting in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }

    /// Override the UDP idle timeout.
    #[must_use]
    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }
}

/// Lifecycle state of a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    /// Bound, not yet accepting.
    Created,
    /// Accept / receive loop started.
    Running,
    /// Listener closed.
    Stopped,
}

/// What the loop task needs, shared with it.
struct Shared {
    control: Arc<dyn Control>,
    port: Port,
    destination: Destination,
    options: ForwardOptions,
}

#[derive(Clone)]
enum Listener {
    Stream(Arc<dyn StreamListener>),
    Datagram(Arc<UdpEndpoint>),
}

impl Listener {
    fn close(&self) {
        match self {
            Listener::Stream(server) => server.close(),
            Listener::Datagram(endpoint) => endpoint.close(),
        }
    }
}

/// A forward for one port.
pub struct Forward {
    shared: Arc<Shared>,
    listener: Mutex<Option<Listener>>,
    state: Mutex<ForwardState>,
    task: Mutex<Option<JoinHandle<()>>>,
    quit: watch::Sender<bool>,
}

impl Forward {
    /// Bind the host side of `port`.
    ///
    /// # Errors
    ///
    /// [`ForwardError::BindFailure`] when the address is in use, not
    /// assignable, or a non-socket file occupies a Unix path. The
    /// connection ceiling does not apply to the listener itself.
    pub async fn make(
        control: Arc<dyn Control>,
        port: Port,
        options: ForwardOptions,
    ) -> ForwardResult<Self> {
        info!("Adding {}", port);
        let registry = &options.registry;
        let listener = match port.proto() {
            Protocol::Tcp => {
                let addr = port
                    .out_socket_addr()
                    .ok_or_else(|| ForwardError::InvalidAddress(port.to_string()))?;
                let server = TcpServer::bind(addr, registry)
                    .await
                    .map_err(|e| ForwardError::from_bind(&port, e))?;
                Listener::Stream(Arc::new(server))
            }
            Protocol::Udp => {
                let addr = port
                    .out_socket_addr()
                    .ok_or_else(|| ForwardError::InvalidAddress(port.to_string()))?;
                let endpoint = UdpEndpoint::bind(addr, registry)
                    .await
                    .map_err(|e| ForwardError::from_bind(&port, e))?;
                Listener::Datagram(Arc::new(endpoint))
            }
            Protocol::Unix => Listener::Stream(bind_unix(&port, registry)?),
        };

        let (quit, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                control,
                destination: port.destination(),
                port,
                options,
            }),
            listener: Mutex::new(Some(listener)),
            state: Mutex::new(ForwardState::Created),
            task: Mutex::new(None),
            quit,
        })
    }

    /// Start the accept / receive loop in a background task.
    ///
    /// Calling it again, or after [`Forward::stop`], only logs a warning.
    pub fn run(&self) {
        let mut state = lock(&self.state);
        if *state != ForwardState::Created {
            warn!("Not running {}: already {:?}", self.shared.port, *state);
            return;
        }
        let Some(listener) = lock(&self.listener).clone() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let quit = self.quit.subscribe();
        let handle = match listener {
            Listener::Stream(server) => tokio::spawn(stream::run(shared, server, quit)),
            Listener::Datagram(endpoint) => tokio::spawn(datagram::run(shared, endpoint, quit)),
        };
        *lock(&self.task) = Some(handle);
        *state = ForwardState::Running;
    }

    /// Stop accepting, close the listener and cancel running relays.
    ///
    /// The native listening socket is closed before this returns, so the
    /// address can be bound again immediately. Relays are not waited for;
    /// use [`Forward::stopped`] to drain.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ForwardState::Stopped {
                debug!("{} already stopped", self.shared.port);
                return;
            }
            *state = ForwardState::Stopped;
        }
        info!("Removing {}", self.shared.port);
        self.quit.send_replace(true);
        if let Some(listener) = lock(&self.listener).take() {
            listener.close();
        }
    }

    /// Wait until the loop task and every relay it started have finished.
    pub async fn stopped(&self) {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Forward task for {} failed: {}", self.shared.port, e);
        }
    }

    /// The port being forwarded.
    pub fn port(&self) -> &Port {
        &self.shared.port
    }

    /// Where peers are relayed to.
    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ForwardState {
        *lock(&self.state)
    }

    /// Logical address of the host-side listener, while it is open.
    pub fn local_addr(&self) -> Option<String> {
        lock(&self.listener).as_ref().map(|listener| match listener {
            Listener::Stream(server) => server.local_addr(),
            Listener::Datagram(endpoint) => format!("udp:{}", endpoint.local_addr()),
        })
    }
}

impl Drop for Forward {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn bind_unix(
    port: &Port,
    registry: &Arc<ConnectionRegistry>,
) -> ForwardResult<Arc<dyn StreamListener>> {
    let path = port
        .out_path()
        .ok_or_else(|| ForwardError::InvalidAddress(port.to_string()))?;
    let server = crate::flow::UnixServer::bind(path, registry)
        .map_err(|e| ForwardError::from_bind(port, e))?;
    Ok(Arc::new(server))
}

#[cfg(not(unix))]
fn bind_unix(
    port: &Port,
    _registry: &Arc<ConnectionRegistry>,
) -> ForwardResult<Arc<dyn StreamListener>> {
    Err(ForwardError::InvalidAddress(format!(
        "{}: Unix domain sockets are not supported on this platform",
        port
    )))
}
