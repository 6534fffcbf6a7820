//! Layered configuration loading.
//!
//! Sources are applied lowest priority first:
//!
//! 1. Defaults compiled into the binary
//! 2. `/etc/portrelay/config.toml`
//! 3. `$XDG_CONFIG_HOME/portrelay/config.toml`
//! 4. The file passed with `--config`
//! 5. `--publish` and `--max-connections`
//!
//! Files 2 and 3 are optional. A `--config` file must exist.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Cli;

/// Host-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/portrelay/config.toml";

/// Per-user file, relative to the platform config directory.
const USER_CONFIG_RELATIVE: &str = "portrelay/config.toml";

/// A config file and whether its absence is an error.
enum Source<'a> {
    Optional(&'a Path),
    Required(&'a Path),
}

impl Source<'_> {
    fn path(&self) -> &Path {
        match self {
            Source::Optional(path) | Source::Required(path) => path,
        }
    }

    /// Read and parse the file. `Ok(None)` for an absent optional file.
    fn read(&self) -> Result<Option<Config>, ConfigError> {
        let path = self.path();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return match self {
                    Source::Optional(_) => Ok(None),
                    Source::Required(_) => Err(ConfigError::Missing(path.to_path_buf())),
                };
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Builds a [`Config`] from every source.
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Loader reading the standard system and user locations.
    #[must_use]
    pub fn new() -> Self {
        let user_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(USER_CONFIG_RELATIVE);
        Self::with_paths(PathBuf::from(SYSTEM_CONFIG_PATH), user_path)
    }

    /// Loader reading the given system and user files instead.
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Merge every source over the embedded defaults, then validate.
    ///
    /// # Errors
    ///
    /// Any unreadable or unparsable file, a missing `--config` file, or a
    /// merged result that fails [`Config::validate`].
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::embedded()?;

        let mut sources = vec![
            Source::Optional(&self.system_path),
            Source::Optional(&self.user_path),
        ];
        if let Some(path) = &cli.config {
            sources.push(Source::Required(path));
        }

        for source in &sources {
            match source.read()? {
                Some(layer) => {
                    debug!("Merging config from {}", source.path().display());
                    config.merge(layer);
                }
                None => debug!("No config at {}", source.path().display()),
            }
        }

        config.merge(Self::flags(cli));
        config.validate()?;
        Ok(config)
    }

    /// The command-line flags as a config layer.
    fn flags(cli: &Cli) -> Config {
        let mut layer = Config {
            ports: cli.publish.clone(),
            ..Config::default()
        };
        layer.registry.max_connections = cli.max_connections;
        layer
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use tempfile::{TempDir, tempdir};

    fn bare_cli() -> Cli {
        Cli {
            command: None,
            publish: vec![],
            config: None,
            max_connections: None,
            verbose: 0,
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
            }
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
            ConfigLoader::with_paths(
                self.dir.path().join("system.toml"),
                self.dir.path().join("user.toml"),
            )
            .load(cli)
        }
    }

    #[test]
    fn test_no_files_gives_embedded_defaults() {
        let config = Fixture::new().load(&bare_cli()).unwrap();

        assert!(config.ports.is_empty());
        assert_eq!(config.forward.udp_idle_timeout_secs, 60);
        assert_eq!(config.transport.port, "62373");
    }

    #[test]
    fn test_user_file_beats_system_file() {
        let fx = Fixture::new();
        fx.write("system.toml", "[forward]\nconnect_timeout_secs = 30\n");
        fx.write("user.toml", "[forward]\nconnect_timeout_secs = 90\n");

        let config = fx.load(&bare_cli()).unwrap();
        assert_eq!(config.forward.connect_timeout_secs, 90);
    }

    #[test]
    fn test_ports_accumulate_across_layers() {
        let fx = Fixture::new();
        fx.write("system.toml", r#"ports = ["tcp:127.0.0.1:8080:tcp:10.0.0.2:80"]"#);
        let extra = fx.write("extra.toml", r#"ports = ["udp:127.0.0.1:5353:udp:10.0.0.2:53"]"#);

        let mut cli = bare_cli();
        cli.config = Some(extra);
        cli.publish = vec!["unix:/tmp/a.sock:unix:/tmp/b.sock".parse::<Port>().unwrap()];
        let config = fx.load(&cli).unwrap();

        assert_eq!(config.ports.len(), 3);
        assert_eq!(config.ports[2], Port::unix("/tmp/a.sock", "/tmp/b.sock"));
    }

    #[test]
    fn test_flag_beats_files() {
        let fx = Fixture::new();
        fx.write("user.toml", "[registry]\nmax_connections = 10\n");

        let mut cli = bare_cli();
        cli.max_connections = Some(3);
        let config = fx.load(&cli).unwrap();
        assert_eq!(config.registry.max_connections, Some(3));
    }

    #[test]
    fn test_missing_config_flag_file() {
        let fx = Fixture::new();
        let mut cli = bare_cli();
        cli.config = Some(fx.dir.path().join("absent.toml"));

        let err = fx.load(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_unparsable_file() {
        let fx = Fixture::new();
        fx.write("system.toml", "ports = [[[");

        let err = fx.load(&bare_cli()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_merged_result_is_validated() {
        let fx = Fixture::new();
        fx.write("user.toml", "[registry]\nmax_connections = 0\n");

        let err = fx.load(&bare_cli()).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroMaxConnections));
    }
}
