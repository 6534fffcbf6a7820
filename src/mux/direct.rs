//! A multiplexer that dials destinations as ordinary host sockets.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::{Multiplexer, MuxError, MuxResult};
use crate::flow::{Flow, FlowError, TcpFlow, UdpFlow};
use crate::port::{Address, Destination, Protocol};
use crate::registry::ConnectionRegistry;

/// Dials every destination directly from the host.
///
/// Useful when the "VM" addresses are reachable from the host, for local
/// testing and for relaying between two host services.
pub struct DirectMux {
    registry: Arc<ConnectionRegistry>,
    connect_timeout: Duration,
    running: AtomicBool,
}

impl DirectMux {
    /// A direct multiplexer accounting its flows in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            connect_timeout,
            running: AtomicBool::new(false),
        }
    }

    async fn open(&self, destination: &Destination) -> Result<Box<dyn Flow>, FlowError> {
        match (destination.proto, &destination.addr) {
            (Protocol::Tcp, Address::Inet(addr)) => {
                let flow = TcpFlow::connect_timeout(*addr, self.connect_timeout, &self.registry).await?;
                Ok(Box::new(flow))
            }
            (Protocol::Udp, Address::Inet(addr)) => {
                Ok(Box::new(UdpFlow::connect(*addr, &self.registry).await?))
            }
            #[cfg(unix)]
            (Protocol::Unix, Address::Path(path)) => {
                let flow = crate::flow::UnixFlow::connect_timeout(path, self.connect_timeout, &self.registry)
                    .await?;
                Ok(Box::new(flow))
            }
            _ => Err(FlowError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("cannot dial {}", destination),
            ))),
        }
    }
}

#[async_trait]
impl Multiplexer for DirectMux {
    async fn dial(&self, destination: &Destination) -> MuxResult<Box<dyn Flow>> {
        debug!("Dialling {} directly", destination);
        self.open(destination).await.map_err(|source| MuxError::Dial {
            destination: destination.to_string(),
            source,
        })
    }

    async fn accept(&self) -> MuxResult<(Box<dyn Flow>, Destination)> {
        Err(MuxError::Unsupported("direct multiplexer has no remote side"))
    }

    fn run(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("Direct multiplexer running");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Direct multiplexer closed");
        }
    }
}
