//! TOML configuration.
//!
//! [`ConfigLoader`] layers the embedded `config/default.toml`, the system
//! and user files, an optional `--config` file and the command-line flags.
//! Later layers append to `ports` and replace any scalar they set.
//!
//! ```toml
//! ports = ["tcp:127.0.0.1:8080:tcp:10.0.0.2:80"]
//!
//! [registry]
//! max_connections = 2048
//!
//! [forward]
//! udp_idle_timeout_secs = 30
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, DEFAULT_CONNECT_TIMEOUT, ForwardConfig, GeneralConfig, RegistryConfig,
    TransportConfig,
};
