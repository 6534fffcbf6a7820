//! Hyper-V socket channels.
//!
//! A port spec is `[<vm-id>/]<port>`. The numeric port selects a service id
//! in the range Hyper-V reserves for Linux guests talking AF_VSOCK:
//!
//! ```text
//! <port as 8 hex digits>-FACB-11E6-BD58-64006A7986D3
//! ```

use uuid::Uuid;

use super::{TransportError, TransportResult};

/// Fixed tail of every vsock-compatible service id.
const SERVICE_ID_TEMPLATE: &str = "FACB-11E6-BD58-64006A7986D3";

/// A parsed Hyper-V socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HvsockAddr {
    /// Target VM, or the zero GUID.
    pub vm_id: Uuid,
    /// Service within the VM.
    pub service_id: Uuid,
}

/// The service id for a vsock port.
pub fn service_id_for_port(port: u32) -> Uuid {
    // Eight hex digits plus a fixed valid tail always form a GUID.
    Uuid::parse_str(&format!("{:08x}-{}", port, SERVICE_ID_TEMPLATE)).unwrap_or_default()
}

/// Parse `[<vm-id>/]<port>`.
///
/// # Errors
///
/// [`TransportError::InvalidAddress`] for a malformed VM id, a non-numeric
/// port or extra `/` segments.
pub fn parse_spec(spec: &str) -> TransportResult<HvsockAddr> {
    let (vm_id, port) = match spec.split_once('/') {
        Some((vm, port)) => {
            let vm_id = Uuid::parse_str(vm).map_err(|e| {
                TransportError::InvalidAddress(format!("Hyper-V VM id {:?}: {}", vm, e))
            })?;
            (vm_id, port)
        }
        None => (Uuid::nil(), spec),
    };
    let port = port.parse::<u32>().map_err(|e| {
        TransportError::InvalidAddress(format!(
            "expected <port> or <vm-id>/<port>, got {:?}: {}",
            spec, e
        ))
    })?;
    Ok(HvsockAddr {
        vm_id,
        service_id: service_id_for_port(port),
    })
}

#[cfg(windows)]
pub use windows::HvsockTransport;

#[cfg(windows)]
mod windows {
    use async_trait::async_trait;
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use std::io;
    use std::mem;
    use std::sync::Arc;
    use tracing::debug;
    use uuid::Uuid;

    use super::{HvsockAddr, parse_spec};
    use crate::transport::{
        Channel, ChannelListener, Transport, TransportKind, TransportResult,
    };

    const AF_HYPERV: i32 = 34;
    const HV_PROTOCOL_RAW: i32 = 1;
    const LISTEN_BACKLOG: i32 = 128;

    #[repr(C)]
    struct SockaddrHv {
        family: u16,
        reserved: u16,
        vm_id: [u8; 16],
        service_id: [u8; 16],
    }

    fn sockaddr(addr: &HvsockAddr) -> io::Result<SockAddr> {
        let raw = SockaddrHv {
            family: AF_HYPERV as u16,
            reserved: 0,
            vm_id: addr.vm_id.to_bytes_le(),
            service_id: addr.service_id.to_bytes_le(),
        };
        // SAFETY: the storage is large enough for any sockaddr, and the
        // length written matches the struct placed in it.
        let ((), sockaddr) = unsafe {
            SockAddr::try_init(|storage, len| {
                std::ptr::write(storage.cast::<SockaddrHv>(), raw);
                *len = mem::size_of::<SockaddrHv>() as _;
                Ok(())
            })?
        };
        Ok(sockaddr)
    }

    fn new_socket() -> io::Result<Socket> {
        Socket::new(
            Domain::from(AF_HYPERV),
            Type::STREAM,
            Some(Protocol::from(HV_PROTOCOL_RAW)),
        )
    }

    fn into_tokio(socket: Socket) -> io::Result<tokio::net::TcpStream> {
        socket.set_nonblocking(true)?;
        tokio::net::TcpStream::from_std(socket.into())
    }

    /// The Windows Hyper-V socket backend.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HvsockTransport;

    #[async_trait]
    impl Transport for HvsockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::HyperV
        }

        fn validate(&self, spec: &str) -> TransportResult<()> {
            parse_spec(spec).map(|_| ())
        }

        async fn dial(&self, spec: &str) -> TransportResult<Channel> {
            let addr = parse_spec(spec)?;
            debug!("Dialling hvsock {}/{}", addr.vm_id, addr.service_id);
            let target = sockaddr(&addr)?;
            let socket = tokio::task::spawn_blocking(move || -> io::Result<Socket> {
                let socket = new_socket()?;
                socket.connect(&target)?;
                Ok(socket)
            })
            .await
            .map_err(io::Error::other)??;
            Ok(Box::new(into_tokio(socket)?))
        }

        async fn listen(&self, spec: &str) -> TransportResult<Box<dyn ChannelListener>> {
            let addr = HvsockAddr {
                vm_id: Uuid::nil(),
                service_id: parse_spec(spec)?.service_id,
            };
            let socket = new_socket()?;
            socket.bind(&sockaddr(&addr)?)?;
            socket.listen(LISTEN_BACKLOG)?;
            debug!("Listening on hvsock service {}", addr.service_id);
            Ok(Box::new(Listener {
                socket: Arc::new(socket),
                service_id: addr.service_id,
            }))
        }
    }

    struct Listener {
        socket: Arc<Socket>,
        service_id: Uuid,
    }

    #[async_trait]
    impl ChannelListener for Listener {
        async fn accept(&self) -> TransportResult<(Channel, String)> {
            let socket = Arc::clone(&self.socket);
            let (accepted, _) = tokio::task::spawn_blocking(move || socket.accept())
                .await
                .map_err(io::Error::other)??;
            let peer = format!("hvsock:{}", self.service_id);
            Ok((Box::new(into_tokio(accepted)?), peer))
        }

        fn local_addr(&self) -> String {
            format!("hvsock:*/{}", self.service_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_layout() {
        let id = service_id_for_port(0x1234);
        assert_eq!(
            id.to_string().to_uppercase(),
            "00001234-FACB-11E6-BD58-64006A7986D3"
        );
        assert_eq!(service_id_for_port(62373), service_id_for_port(62373));
        assert_ne!(service_id_for_port(1), service_id_for_port(2));
    }

    #[test]
    fn test_port_only_uses_zero_vm_id() {
        let addr = parse_spec("62373").unwrap();
        assert!(addr.vm_id.is_nil());
        assert_eq!(addr.service_id, service_id_for_port(62373));
    }

    #[test]
    fn test_vm_id_and_port() {
        let addr = parse_spec("3049e1c8-d16c-4b91-8ac7-3e2b4ea86e3c/1525").unwrap();
        assert_eq!(
            addr.vm_id,
            Uuid::parse_str("3049e1c8-d16c-4b91-8ac7-3e2b4ea86e3c").unwrap()
        );
        assert_eq!(addr.service_id, service_id_for_port(1525));
    }

    #[cfg(windows)]
    #[tokio::test]
    async fn test_bad_spec_rejected_before_socket() {
        use crate::transport::Transport;

        let transport = HvsockTransport;
        for spec in ["abc", "not-a-guid/1"] {
            assert!(matches!(
                transport.dial(spec).await,
                Err(TransportError::InvalidAddress(_))
            ));
            assert!(matches!(
                transport.listen(spec).await,
                Err(TransportError::InvalidAddress(_))
            ));
        }
    }

    #[test]
    fn test_rejects_malformed_specs() {
        for spec in ["", "port", "not-a-guid/1", "3049e1c8-d16c-4b91-8ac7-3e2b4ea86e3c/x", "a/b/c"] {
            assert!(
                matches!(parse_spec(spec), Err(TransportError::InvalidAddress(_))),
                "accepted {:?}",
                spec
            );
        }
    }
}
