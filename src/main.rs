//! portrelay: host-side port forwarding into virtual machines
//!
//! This is the main entry point for the portrelay binary. It handles CLI
//! argument parsing, configuration loading and tracing initialization, then
//! either validates the configuration (`check`) or runs one forward per
//! configured port until Ctrl-C (`run`).
//!
//! Configuration is loaded before the async runtime starts, so blocking
//! file access never happens on a runtime thread.

use anyhow::{Context, Result, bail};
use clap::Parser;
use portrelay::{
    cli::{Cli, Commands},
    config::{Config, ConfigLoader},
    forward::{Forward, ForwardOptions},
    mux::{DirectMux, Multiplexer, StaticControl},
    registry::ConnectionRegistry,
    transport::{self, TransportError},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    debug!("Loaded configuration: {:?}", config);

    match cli.command() {
        Commands::Check => check(&config),
        Commands::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(run(config))
        }
    }
}

/// Print what would be forwarded and validate the transport port spec.
fn check(config: &Config) -> Result<()> {
    match transport::default_transport() {
        Ok(transport) => {
            transport
                .validate(&config.transport.port)
                .with_context(|| format!("Invalid transport port {:?}", config.transport.port))?;
            println!("transport: {} {}", transport.kind(), config.transport.port);
        }
        Err(TransportError::Unsupported) => {
            println!("transport: not available on this platform");
        }
        Err(e) => return Err(e).context("Failed to select transport"),
    }

    match config.registry.max_connections {
        Some(max) => println!("max connections: {}", max),
        None => println!("max connections: unlimited"),
    }
    for port in &config.ports {
        println!("{} -> {}", port, port.destination());
    }
    println!("{} port(s) OK", config.ports.len());
    Ok(())
}

/// Forward every configured port until interrupted.
async fn run(config: Config) -> Result<()> {
    if config.ports.is_empty() {
        bail!("No ports configured: pass --publish or add `ports` to a config file");
    }

    let registry = Arc::new(ConnectionRegistry::with_max_connections(
        config.registry.max_connections,
    ));
    let mux = Arc::new(DirectMux::new(Arc::clone(&registry), config.connect_timeout()));
    mux.run();
    let control = Arc::new(StaticControl::new(mux.clone()));
    let options = ForwardOptions::new(Arc::clone(&registry))
        .with_udp_idle_timeout(config.udp_idle_timeout());

    let mut forwards = Vec::with_capacity(config.ports.len());
    for port in &config.ports {
        let forward = Forward::make(control.clone(), port.clone(), options.clone())
            .await
            .with_context(|| format!("Failed to forward {}", port))?;
        forward.run();
        forwards.push(forward);
    }
    info!("Forwarding {} port(s)", forwards.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Interrupted, shutting down");

    for forward in &forwards {
        forward.stop();
    }
    for forward in &forwards {
        forward.stopped().await;
    }
    mux.close().await;

    let leftover = registry.snapshot();
    if !leftover.is_empty() {
        warn!("{} connection(s) still registered: {:?}", leftover.len(), leftover);
    }
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured `log_level`, else warn
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fallback = if log_level.is_empty() { "warn" } else { log_level };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
