//! Shape of the TOML configuration.
//!
//! This module defines the structure of the portrelay configuration files.
//! See [`super`] for the load order and merge rules.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::forward::DEFAULT_UDP_IDLE_TIMEOUT;
use crate::port::Port;

/// Defaults shipped with the binary.
const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Connect timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully merged configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Ports to forward.
    #[serde(default)]
    pub ports: Vec<Port>,

    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Connection accounting.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Forwarding behaviour.
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Channel into the VM.
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// The configuration compiled into the binary.
    ///
    /// # Errors
    ///
    /// Only if the shipped defaults fail to parse.
    pub fn embedded() -> Result<Self, ConfigError> {
        toml::from_str(DEFAULT_CONFIG).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<embedded:default.toml>"),
            source: e,
        })
    }

    /// Layer `other` on top of `self`.
    ///
    /// Lists (ports) are merged (appended, skipping duplicates).
    /// Scalars are overridden when the other value is set.
    pub fn merge(&mut self, other: Config) {
        for port in other.ports {
            if !self.ports.contains(&port) {
                self.ports.push(port);
            }
        }
        self.general.merge(other.general);
        self.registry.merge(other.registry);
        self.forward.merge(other.forward);
        self.transport.merge(other.transport);
    }

    /// Check values that parse but make no sense.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroMaxConnections`] or [`ConfigError::DuplicatePort`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.max_connections == Some(0) {
            return Err(ConfigError::ZeroMaxConnections);
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert((port.proto(), port.out_addr())) {
                return Err(ConfigError::DuplicatePort {
                    proto: port.proto(),
                    address: port.out_addr().clone(),
                });
            }
        }
        Ok(())
    }

    /// UDP session idle timeout.
    pub fn udp_idle_timeout(&self) -> Duration {
        match self.forward.udp_idle_timeout_secs {
            0 => DEFAULT_UDP_IDLE_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    /// Timeout for outbound connects.
    pub fn connect_timeout(&self) -> Duration {
        match self.forward.connect_timeout_secs {
            0 => DEFAULT_CONNECT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}

/// Settings that are not about forwarding.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Default tracing filter when `RUST_LOG` and `-v` are absent.
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Connection registry settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RegistryConfig {
    /// Maximum number of open sockets. Unlimited when absent.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl RegistryConfig {
    fn merge(&mut self, other: RegistryConfig) {
        if other.max_connections.is_some() {
            self.max_connections = other.max_connections;
        }
    }
}

/// Forwarding settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ForwardConfig {
    /// Seconds a UDP source may stay silent. 0 = default.
    #[serde(default)]
    pub udp_idle_timeout_secs: u64,

    /// Seconds to wait for an outbound connect. 0 = default.
    #[serde(default)]
    pub connect_timeout_secs: u64,
}

impl ForwardConfig {
    fn merge(&mut self, other: ForwardConfig) {
        if other.udp_idle_timeout_secs != 0 {
            self.udp_idle_timeout_secs = other.udp_idle_timeout_secs;
        }
        if other.connect_timeout_secs != 0 {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
    }
}

/// Transport channel settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    /// Channel port spec: `<port>` for vsock, `[<vm-id>/]<port>` for Hyper-V.
    #[serde(default)]
    pub port: String,
}

impl TransportConfig {
    fn merge(&mut self, other: TransportConfig) {
        if !other.port.is_empty() {
            self.port = other.port;
        }
    }
}
