//! Configuration module for the linemux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What to do when a connection accumulates `max_line_size` bytes without a newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Hand the accumulated fragment to the handler as an unterminated event.
    #[default]
    Deliver,
    /// Close the connection.
    Close,
}

/// Built-in per-connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Send every line back to the client.
    #[default]
    Echo,
    /// PING/PONG health-check protocol.
    Ping,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "linemux")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Evict connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum unterminated line size in bytes
    #[arg(long)]
    pub max_line_size: Option<usize>,

    /// Size of each socket read in bytes
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Behavior when a line exceeds the maximum size
    #[arg(long, value_enum)]
    pub overflow_policy: Option<OverflowPolicy>,

    /// Per-connection handler
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

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
    pub framing: FramingConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle eviction threshold in seconds, 0 disables it
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            idle_timeout: 0,
        }
    }
}

/// Line framing and buffering configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_max_line_size")]
    pub max_line_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on queued outbound bytes per connection
    #[serde(default = "default_max_pending_write")]
    pub max_pending_write: usize,
    /// Reads performed for one connection before yielding to the others
    #[serde(default = "default_reads_per_event")]
    pub reads_per_event: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_line_size: default_max_line_size(),
            read_buffer_size: default_read_buffer_size(),
            overflow_policy: OverflowPolicy::default(),
            max_pending_write: default_max_pending_write(),
            reads_per_event: default_reads_per_event(),
        }
    }
}

/// Handler selection
#[derive(Debug, Deserialize, Default)]
pub struct HandlerConfig {
    #[serde(default)]
    pub kind: HandlerKind,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_backlog() -> u32 {
    10
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_line_size() -> usize {
    4096
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_max_pending_write() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_reads_per_event() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub max_line_size: usize,
    pub read_buffer_size: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_pending_write: usize,
    pub reads_per_event: usize,
    pub handler: HandlerKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let idle_secs = cli.idle_timeout.unwrap_or(toml_config.server.idle_timeout);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            max_line_size: cli
                .max_line_size
                .unwrap_or(toml_config.framing.max_line_size),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.framing.read_buffer_size),
            overflow_policy: cli
                .overflow_policy
                .unwrap_or(toml_config.framing.overflow_policy),
            max_pending_write: toml_config.framing.max_pending_write,
            reads_per_event: toml_config.framing.reads_per_event,
            handler: cli.handler.unwrap_or(toml_config.handler.kind),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("backlog", self.backlog as usize),
            ("max_connections", self.max_connections),
            ("max_line_size", self.max_line_size),
            ("read_buffer_size", self.read_buffer_size),
            ("max_pending_write", self.max_pending_write),
            ("reads_per_event", self.reads_per_event),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        self.listen_addr()?;
        Ok(())
    }

    /// The socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
