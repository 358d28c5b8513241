//! Configuration module for the switchboard server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocols::chat::handler::DEFAULT_MAX_LINE;
use crate::protocols::frame::handler::DEFAULT_MAX_PAYLOAD;
use crate::protocols::frame::parser::MAX_FRAME_PAYLOAD;
use crate::runtime::{BroadcastPolicy, StartAction, DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_DEPTH};

/// Task run on every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    #[default]
    Chat,
    Frame,
}

/// What a connection does first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    #[default]
    Read,
    Greet,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(author = "switchboard authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client TCP message switch", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Protocol spoken on every connection
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Receive buffer size per connection in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// What a connection does when accepted
    #[arg(long, value_enum)]
    pub start: Option<StartMode>,

    /// Greeting sent when --start=greet
    #[arg(long)]
    pub greeting: Option<String>,

    /// Whether broadcasts are echoed back to the sender
    #[arg(long, value_enum)]
    pub broadcast: Option<BroadcastPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Protocol spoken on every connection
    #[serde(default)]
    pub protocol: ProtocolType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            protocol: ProtocolType::default(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Receive buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Writes a connection may have queued before it is dropped as too slow
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// What a connection does when accepted
    #[serde(default)]
    pub start: StartMode,
    /// Greeting sent in greet mode
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Whether broadcasts are echoed back to the sender
    #[serde(default)]
    pub broadcast: BroadcastPolicy,
    /// Longest chat line
    #[serde(default = "default_max_line")]
    pub max_line: usize,
    /// Largest frame payload
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            queue_depth: default_queue_depth(),
            start: StartMode::default(),
            greeting: default_greeting(),
            broadcast: BroadcastPolicy::default(),
            max_line: default_max_line(),
            max_payload: default_max_payload(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_greeting() -> String {
    "HELLO\r\n".to_string()
}

fn default_max_line() -> usize {
    DEFAULT_MAX_LINE
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub protocol: ProtocolType,
    pub buffer_size: usize,
    pub queue_depth: usize,
    pub start: StartMode,
    pub greeting: String,
    pub broadcast: BroadcastPolicy,
    pub max_line: usize,
    pub max_payload: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file they point at, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let config = Config {
            listen: listen
                .parse()
                .map_err(|_| ConfigError::InvalidValue("listen", listen.clone()))?,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            protocol: cli.protocol.unwrap_or(toml_config.server.protocol),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            queue_depth: toml_config.connection.queue_depth,
            start: cli.start.unwrap_or(toml_config.connection.start),
            greeting: cli.greeting.unwrap_or(toml_config.connection.greeting),
            broadcast: cli.broadcast.unwrap_or(toml_config.connection.broadcast),
            max_line: toml_config.connection.max_line,
            max_payload: toml_config.connection.max_payload,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidValue("buffer_size", "0".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidValue("queue_depth", "0".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections", "0".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::InvalidValue("workers", "0".into()));
        }
        if self.max_line == 0 {
            return Err(ConfigError::InvalidValue("max_line", "0".into()));
        }
        if self.max_payload == 0 || self.max_payload > MAX_FRAME_PAYLOAD {
            return Err(ConfigError::InvalidValue(
                "max_payload",
                self.max_payload.to_string(),
            ));
        }
        Ok(())
    }

    /// Start action handed to every new connection.
    pub fn start_action(&self) -> StartAction {
        match self.start {
            StartMode::Read => StartAction::Read,
            StartMode::Greet => StartAction::Greet(Bytes::from(self.greeting.clone())),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("switchboard").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7878");
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.connection.buffer_size, 1024);
        assert_eq!(config.connection.queue_depth, 1024);
        assert_eq!(config.connection.start, StartMode::Read);
        assert_eq!(config.connection.broadcast, BroadcastPolicy::ExcludeSender);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4
            max_connections = 64
            protocol = "frame"

            [connection]
            buffer_size = 4096
            start = "greet"
            greeting = "hi\r\n"
            broadcast = "include-sender"
            max_payload = 512
            queue_depth = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.protocol, ProtocolType::Frame);
        assert_eq!(config.connection.buffer_size, 4096);
        assert_eq!(config.connection.start, StartMode::Greet);
        assert_eq!(config.connection.greeting, "hi\r\n");
        assert_eq!(config.connection.broadcast, BroadcastPolicy::IncludeSender);
        assert_eq!(config.connection.max_line, 1024);
        assert_eq!(config.connection.max_payload, 512);
        assert_eq!(config.connection.queue_depth, 16);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = temp_config("override.toml");
        writeln!(
            file.1,
            "[server]\nlisten = \"0.0.0.0:9000\"\nprotocol = \"frame\"\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let path = file.0.to_str().unwrap().to_string();
        let config = Config::resolve(cli(&[
            "--config",
            &path,
            "--listen",
            "127.0.0.1:9100",
            "--start",
            "greet",
        ]))
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.protocol, ProtocolType::Frame);
        assert_eq!(config.log_level, "warn");
        assert_eq!(
            config.start_action(),
            StartAction::Greet(Bytes::from_static(b"HELLO\r\n"))
        );
        let _ = std::fs::remove_file(&file.0);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::resolve(cli(&["--listen", "nowhere"])),
            Err(ConfigError::InvalidValue("listen", _))
        ));
        assert!(matches!(
            Config::resolve(cli(&["--buffer-size", "0"])),
            Err(ConfigError::InvalidValue("buffer_size", _))
        ));
        assert!(matches!(
            Config::resolve(cli(&["--config", "/nonexistent/switchboard.toml"])),
            Err(ConfigError::FileRead(..))
        ));
    }

    #[test]
    fn test_zero_limits_in_file_are_rejected() {
        for (key, section) in [
            ("max_payload", "[connection]\nmax_payload = 0"),
            ("max_line", "[connection]\nmax_line = 0"),
            ("queue_depth", "[connection]\nqueue_depth = 0"),
        ] {
            let mut file = temp_config(&format!("zero-{key}.toml"));
            writeln!(file.1, "{section}").unwrap();

            let path = file.0.to_str().unwrap().to_string();
            match Config::resolve(cli(&["--config", &path])) {
                Err(ConfigError::InvalidValue(name, value)) => {
                    assert_eq!(name, key);
                    assert_eq!(value, "0");
                }
                other => panic!("{key}: unexpected {other:?}"),
            }
            let _ = std::fs::remove_file(&file.0);
        }
    }

    #[test]
    fn test_cli_broadcast_policy() {
        let config = Config::resolve(cli(&["--broadcast", "include-sender"])).unwrap();
        assert_eq!(config.broadcast, BroadcastPolicy::IncludeSender);
        assert_eq!(config.start_action(), StartAction::Read);
    }

    fn temp_config(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("switchboard-{}-{name}", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
