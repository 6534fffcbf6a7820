//! portrelay: host-side port forwarding into virtual machines
//!
//! This crate listens on host TCP, UDP and Unix domain sockets and relays
//! each peer to a fixed destination inside a VM through a connection
//! multiplexer carried over a vsock or Hyper-V socket channel.
//!
//! # Architecture
//!
//! - **Transport**: AF_VSOCK / Hyper-V socket channels into the VM
//! - **Registry**: Accounting of every open socket with an optional ceiling
//! - **Flow**: Uniform read/write/shutdown/close over TCP, UDP and Unix sockets
//! - **Forward**: One accept or receive loop per forwarded port
//! - **Relay**: Bidirectional byte copy between two flows
//! - **Config**: Hierarchical TOML configuration

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod flow;
pub mod forward;
pub mod mux;
pub mod port;
pub mod registry;
pub mod relay;
pub mod transport;
