//! AF_VSOCK channels.

use super::{TransportError, TransportResult};

/// CID of the host, the target of every dial.
pub const CID_HOST: u32 = 2;

/// Wildcard CID used when listening.
pub const CID_ANY: u32 = u32::MAX;

/// Parse a vsock port spec: a bare decimal `u32`.
///
/// # Errors
///
/// [`TransportError::InvalidAddress`] for anything else.
pub fn parse_port(spec: &str) -> TransportResult<u32> {
    spec.trim()
        .parse::<u32>()
        .map_err(|e| TransportError::InvalidAddress(format!("vsock port {:?}: {}", spec, e)))
}

#[cfg(target_os = "linux")]
pub use linux::VsockTransport;

#[cfg(target_os = "linux")]
mod linux {
    use async_trait::async_trait;
    use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
    use tracing::debug;

    use super::{CID_ANY, CID_HOST, parse_port};
    use crate::transport::{
        Channel, ChannelListener, Transport, TransportKind, TransportResult,
    };

    /// The Linux vsock backend.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct VsockTransport;

    #[async_trait]
    impl Transport for VsockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Vsock
        }

        fn validate(&self, spec: &str) -> TransportResult<()> {
            parse_port(spec).map(|_| ())
        }

        async fn dial(&self, spec: &str) -> TransportResult<Channel> {
            let port = parse_port(spec)?;
            debug!("Dialling vsock {}:{}", CID_HOST, port);
            let stream = VsockStream::connect(VsockAddr::new(CID_HOST, port)).await?;
            Ok(Box::new(stream))
        }

        async fn listen(&self, spec: &str) -> TransportResult<Box<dyn ChannelListener>> {
            let port = parse_port(spec)?;
            let listener = VsockListener::bind(VsockAddr::new(CID_ANY, port))?;
            debug!("Listening on vsock port {}", port);
            Ok(Box::new(Listener { listener, port }))
        }
    }

    struct Listener {
        listener: VsockListener,
        port: u32,
    }

    #[async_trait]
    impl ChannelListener for Listener {
        async fn accept(&self) -> TransportResult<(Channel, String)> {
            let (stream, peer) = self.listener.accept().await?;
            let peer = format!("vsock:{}:{}", peer.cid(), peer.port());
            Ok((Box::new(stream), peer))
        }

        fn local_addr(&self) -> String {
            format!("vsock:*:{}", self.port)
        }
    }
}
