//! Port mappings and forward destinations.
//!
//! A [`Port`] pairs a host-side ("out") address with a VM-side ("in")
//! address. Its text form names the protocol on both sides:
//!
//! ```text
//! tcp:127.0.0.1:8080:tcp:10.0.0.2:80
//! udp:[::1]:5353:udp:10.0.0.2:53
//! unix:/run/host.sock:unix:/run/guest.sock
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::forward::ForwardError;

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP stream
    Tcp,
    /// UDP datagrams
    Udp,
    /// Unix domain stream socket
    Unix,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "unix" => Ok(Protocol::Unix),
            other => Err(ForwardError::InvalidAddress(format!(
                "unknown protocol {:?}",
                other
            ))),
        }
    }
}

/// One side of a mapping: an IP endpoint or a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP address and port.
    Inet(SocketAddr),
    /// Unix domain socket path.
    Path(PathBuf),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(f, "{}", addr),
            Address::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A forwarded port: where to listen on the host and where to connect in
/// the VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    proto: Protocol,
    out_addr: Address,
    in_addr: Address,
}

impl Port {
    /// A TCP mapping.
    pub fn tcp(out_addr: SocketAddr, in_addr: SocketAddr) -> Self {
        Self {
            proto: Protocol::Tcp,
            out_addr: Address::Inet(out_addr),
            in_addr: Address::Inet(in_addr),
        }
    }

    /// A UDP mapping.
    pub fn udp(out_addr: SocketAddr, in_addr: SocketAddr) -> Self {
        Self {
            proto: Protocol::Udp,
            out_addr: Address::Inet(out_addr),
            in_addr: Address::Inet(in_addr),
        }
    }

    /// A Unix domain socket mapping.
    pub fn unix(out_path: impl Into<PathBuf>, in_path: impl Into<PathBuf>) -> Self {
        Self {
            proto: Protocol::Unix,
            out_addr: Address::Path(out_path.into()),
            in_addr: Address::Path(in_path.into()),
        }
    }

    /// The protocol on both sides.
    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// Host-side address.
    pub fn out_addr(&self) -> &Address {
        &self.out_addr
    }

    /// VM-side address.
    pub fn in_addr(&self) -> &Address {
        &self.in_addr
    }

    /// Host-side socket address, for TCP and UDP.
    pub fn out_socket_addr(&self) -> Option<SocketAddr> {
        match self.out_addr {
            Address::Inet(addr) => Some(addr),
            Address::Path(_) => None,
        }
    }

    /// Host-side path, for Unix.
    pub fn out_path(&self) -> Option<&Path> {
        match &self.out_addr {
            Address::Path(path) => Some(path),
            Address::Inet(_) => None,
        }
    }

    /// Where connections on this port are sent.
    pub fn destination(&self) -> Destination {
        Destination {
            proto: self.proto,
            addr: self.in_addr.clone(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{proto}:{}:{proto}:{}",
            self.out_addr,
            self.in_addr,
            proto = self.proto
        )
    }
}

impl FromStr for Port {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ForwardError::InvalidAddress(format!("{:?}: {}", s, why));

        let (proto, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected <proto>:<out>:<proto>:<in>"))?;
        let proto: Protocol = proto.parse()?;
        let separator = format!(":{}:", proto);
        let (out_part, in_part) = rest
            .split_once(&separator)
            .ok_or_else(|| invalid("both sides must use the same protocol"))?;
        if out_part.is_empty() || in_part.is_empty() {
            return Err(invalid("empty address"));
        }

        match proto {
            Protocol::Tcp | Protocol::Udp => {
                let out_addr: SocketAddr = out_part
                    .parse()
                    .map_err(|e| invalid(&format!("host address {:?}: {}", out_part, e)))?;
                let in_addr: SocketAddr = in_part
                    .parse()
                    .map_err(|e| invalid(&format!("VM address {:?}: {}", in_part, e)))?;
                Ok(if proto == Protocol::Tcp {
                    Port::tcp(out_addr, in_addr)
                } else {
                    Port::udp(out_addr, in_addr)
                })
            }
            Protocol::Unix => Ok(Port::unix(out_part, in_part)),
        }
    }
}

impl Serialize for Port {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The fixed VM-side target of a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Protocol to dial with.
    pub proto: Protocol,
    /// Address inside the VM.
    pub addr: Address,
}

impl Destination {
    /// A TCP destination.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            proto: Protocol::Tcp,
            addr: Address::Inet(addr),
        }
    }

    /// A UDP destination.
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            proto: Protocol::Udp,
            addr: Address::Inet(addr),
        }
    }

    /// A Unix domain socket destination.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            proto: Protocol::Unix,
            addr: Address::Path(path.into()),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.proto, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let port: Port = "tcp:127.0.0.1:8080:tcp:10.0.0.2:80".parse().unwrap();
        assert_eq!(port.proto(), Protocol::Tcp);
        assert_eq!(port.out_socket_addr(), Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(port.destination(), Destination::tcp("10.0.0.2:80".parse().unwrap()));
        assert_eq!(port.to_string(), "tcp:127.0.0.1:8080:tcp:10.0.0.2:80");
    }

    #[test]
    fn test_parse_udp_ipv6() {
        let port: Port = "udp:[::1]:5353:udp:10.0.0.2:53".parse().unwrap();
        assert_eq!(port.proto(), Protocol::Udp);
        assert_eq!(port.out_socket_addr(), Some("[::1]:5353".parse().unwrap()));
        assert_eq!(port.to_string(), "udp:[::1]:5353:udp:10.0.0.2:53");
    }

    #[test]
    fn test_parse_unix() {
        let port: Port = "unix:/run/host.sock:unix:/run/guest.sock".parse().unwrap();
        assert_eq!(port.out_path(), Some(Path::new("/run/host.sock")));
        assert_eq!(port.destination(), Destination::unix("/run/guest.sock"));
        assert_eq!(port.destination().to_string(), "unix:/run/guest.sock");
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let err = "sctp:1.2.3.4:1:sctp:1.2.3.4:1".parse::<Port>().unwrap_err();
        assert!(matches!(err, ForwardError::InvalidAddress(_)));
        assert!(err.to_string().contains("sctp"));
    }

    #[test]
    fn test_rejects_mixed_or_malformed() {
        for s in [
            "tcp:127.0.0.1:80:udp:10.0.0.2:80",
            "tcp:127.0.0.1:tcp:10.0.0.2:80",
            "tcp:localhost:80:tcp:10.0.0.2:80",
            "unix::unix:/b",
            "tcp",
        ] {
            assert!(s.parse::<Port>().is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn test_deserialize_from_toml_string() {
        #[derive(Deserialize)]
        struct Holder {
            port: Port,
        }
        let holder: Holder = toml::from_str(r#"port = "tcp:0.0.0.0:80:tcp:10.0.0.2:8080""#).unwrap();
        assert_eq!(holder.port, Port::tcp("0.0.0.0:80".parse().unwrap(), "10.0.0.2:8080".parse().unwrap()));
    }
}
