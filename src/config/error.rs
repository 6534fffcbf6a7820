//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::port::{Address, Protocol};

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("Cannot read {path}: {source}")]
    Read {
        /// File being read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A file named on the command line does not exist.
    #[error("Config file {0} does not exist")]
    Missing(PathBuf),

    /// A config file is not valid TOML or does not match the schema.
    #[error("Cannot parse {path}: {source}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// `registry.max_connections` was set to zero.
    #[error("registry.max_connections must be at least 1")]
    ZeroMaxConnections,

    /// Two ports listen on the same host address.
    #[error("{proto} address {address} is forwarded twice")]
    DuplicatePort {
        /// Protocol of both ports.
        proto: Protocol,
        /// The shared host address.
        address: Address,
    },
}
