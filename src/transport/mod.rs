//! Point-to-point byte channels into the VM.
//!
//! A channel is addressed by a short port spec whose meaning depends on the
//! backend:
//!
//! - **vsock** (Linux): a bare decimal `u32` port. Dials go to the host CID,
//!   listeners bind every CID.
//! - **Hyper-V sockets** (Windows): `[<vm-id>/]<port>`. The port is mapped to
//!   a service id GUID; an absent VM id means the zero GUID.
//!
//! Parsing is platform independent, so malformed specs are rejected the same
//! way everywhere and before any socket is created.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), portrelay::transport::TransportError> {
//! use portrelay::transport::default_transport;
//!
//! let transport = default_transport()?;
//! let channel = transport.dial("62373").await?;
//! # drop(channel);
//! # Ok(())
//! # }
//! ```

mod error;
pub mod hvsock;
pub mod vsock;

pub use error::{TransportError, TransportResult};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carried by a transport channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

/// A connected transport channel.
pub type Channel = Box<dyn ChannelStream>;

/// Supported transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// AF_VSOCK
    Vsock,
    /// AF_HYPERV
    HyperV,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Vsock => write!(f, "vsock"),
            TransportKind::HyperV => write!(f, "hvsock"),
        }
    }
}

/// A listening transport endpoint.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Wait for the next channel. The string describes the peer.
    async fn accept(&self) -> TransportResult<(Channel, String)>;

    /// The address being listened on, for logs.
    fn local_addr(&self) -> String;
}

/// A platform transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> TransportKind;

    /// Check a port spec without touching the network.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidAddress`] describing what is wrong.
    fn validate(&self, spec: &str) -> TransportResult<()>;

    /// Open a channel to `spec`.
    async fn dial(&self, spec: &str) -> TransportResult<Channel>;

    /// Listen for channels on `spec`.
    async fn listen(&self, spec: &str) -> TransportResult<Box<dyn ChannelListener>>;
}

/// The transport for the current platform.
///
/// # Errors
///
/// [`TransportError::Unsupported`] where neither vsock nor Hyper-V sockets
/// are available.
pub fn default_transport() -> TransportResult<Box<dyn Transport>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(vsock::VsockTransport))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(hvsock::HvsockTransport))
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        Err(TransportError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ChannelFlow, Flow, ReadOutcome, WriteOutcome};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Vsock.to_string(), "vsock");
        assert_eq!(TransportKind::HyperV.to_string(), "hvsock");
    }

    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn test_default_transport_rejects_garbage() {
        let transport = default_transport().unwrap();
        assert!(matches!(
            transport.validate("not-a-port"),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(transport.validate("1234").is_ok());
    }

    #[tokio::test]
    async fn test_channel_flow_over_boxed_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        let channel: Channel = Box::new(near);
        let flow = ChannelFlow::new(channel, "channel:duplex", None);

        far.write_all(b"in").await.unwrap();
        assert_eq!(flow.read().await, ReadOutcome::Data(Bytes::from_static(b"in")));
        assert_eq!(flow.write(b"out").await, WriteOutcome::Written);
        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"out");
    }
}
