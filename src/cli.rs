//! Command-line arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::port::Port;

/// Host-side port forwarding into virtual machines.
///
/// portrelay listens on host TCP, UDP and Unix domain sockets and relays
/// every connection to a fixed destination through a connection
/// multiplexer.
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Forward a port (repeatable).
    ///
    /// Format: PROTO:HOST_ADDR:PROTO:VM_ADDR
    /// (e.g., -p tcp:127.0.0.1:8080:tcp:10.0.0.2:80,
    ///  -p unix:/tmp/host.sock:unix:/var/run/guest.sock)
    #[arg(short = 'p', long = "publish", value_name = "PORT", global = true)]
    pub publish: Vec<Port>,

    /// Extra TOML file layered over the system and user files.
    ///
    /// Only `--publish` and `--max-connections` take precedence over it.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Maximum number of open sockets across all forwards.
    #[arg(long = "max-connections", value_name = "N", global = true)]
    pub max_connections: Option<usize>,

    /// Raise the log level: -v info, -vv debug, -vvv trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for portrelay.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Start forwarding every configured port until interrupted.
    Run,

    /// Validate the configuration and print the ports it forwards.
    Check,
}

impl Cli {
    /// The subcommand to execute.
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_means_run() {
        let cli = Cli::parse_from(["portrelay"]);
        assert_eq!(cli.command(), Commands::Run);
        assert!(cli.publish.is_empty());
        assert!(cli.config.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_check_with_every_flag() {
        let cli = Cli::parse_from([
            "portrelay",
            "check",
            "-p",
            "tcp:127.0.0.1:8080:tcp:10.0.0.2:80",
            "-p",
            "unix:/tmp/a.sock:unix:/tmp/b.sock",
            "--max-connections",
            "64",
            "-c",
            "/tmp/extra.toml",
            "-vv",
        ]);

        assert_eq!(cli.command(), Commands::Check);
        assert_eq!(cli.publish.len(), 2);
        assert_eq!(cli.publish[1], Port::unix("/tmp/a.sock", "/tmp/b.sock"));
        assert_eq!(cli.max_connections, Some(64));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/extra.toml")));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_invalid_publish_is_rejected() {
        let result = Cli::try_parse_from(["portrelay", "-p", "3000:3000"]);
        assert!(result.is_err());
    }
}
