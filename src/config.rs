//! Configuration module for the sort server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::DEFAULT_MAX_MESSAGE_BYTES;
use crate::protocol::Protocol;
use crate::sort::SortStrategy;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Server concurrency architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Reader and writer thread per connection.
    Blocking,
    /// One read event loop and one write event loop for all connections.
    #[default]
    Nonblocking,
}

/// Message body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// 4 bytes per integer, big-endian.
    #[default]
    Fixed,
    /// CBOR array.
    Cbor,
}

impl From<Encoding> for Protocol {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Fixed => Protocol::FixedWidth,
            Encoding::Cbor => Protocol::Cbor,
        }
    }
}

/// Sort algorithm run by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortKind {
    /// Standard library sort.
    #[default]
    Standard,
    /// Slow exchange sort for benchmarking.
    Quadratic,
}

impl From<SortKind> for SortStrategy {
    fn from(kind: SortKind) -> Self {
        match kind {
            SortKind::Standard => SortStrategy::Standard,
            SortKind::Quadratic => SortStrategy::Quadratic,
        }
    }
}

/// Command-line arguments for the sort server
#[derive(Parser, Debug, Default)]
#[command(name = "sort-server")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that sorts integer lists", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Server architecture
    #[arg(short, long, value_enum)]
    pub architecture: Option<Architecture>,

    /// Message body encoding
    #[arg(long, value_enum)]
    pub protocol: Option<Encoding>,

    /// Number of sort worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Sort algorithm
    #[arg(long, value_enum)]
    pub sort: Option<SortKind>,

    /// Largest accepted message body in bytes
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub workers: WorkersSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Events drained per selector wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Bound on every shutdown wait, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            architecture: Architecture::default(),
            backlog: default_backlog(),
            event_capacity: default_event_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// Sort pool configuration
#[derive(Debug, Deserialize)]
pub struct WorkersSection {
    /// Fixed pool size; derived from available parallelism when unset
    pub threads: Option<usize>,
    /// Cores left for I/O threads when the size is derived
    #[serde(default = "default_reserve")]
    pub reserve: usize,
    #[serde(default)]
    pub sort: SortKind,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            threads: None,
            reserve: default_reserve(),
            sort: SortKind::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_backlog() -> i32 {
    1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_reserve() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub architecture: Architecture,
    pub backlog: i32,
    pub event_capacity: usize,
    pub shutdown_timeout: Duration,
    pub protocol: Protocol,
    pub max_message_bytes: usize,
    pub workers: Option<usize>,
    pub worker_reserve: usize,
    pub sort: SortStrategy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from parsed CLI args, reading the TOML file
    /// they point at. CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.listen_addr()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            architecture: cli
                .architecture
                .unwrap_or(toml_config.server.architecture),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            event_capacity: toml_config.server.event_capacity,
            shutdown_timeout: Duration::from_millis(toml_config.server.shutdown_timeout_ms),
            protocol: cli
                .protocol
                .unwrap_or(toml_config.protocol.encoding)
                .into(),
            max_message_bytes: cli
                .max_message_bytes
                .unwrap_or(toml_config.protocol.max_message_bytes),
            workers: cli.workers.or(toml_config.workers.threads),
            worker_reserve: toml_config.workers.reserve,
            sort: cli.sort.unwrap_or(toml_config.workers.sort).into(),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Resolve `host:port` to the socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()
            .map_err(|e| ConfigError::InvalidAddress(addr.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| ConfigError::InvalidAddress(addr, "no addresses resolved".to_string()))
    }

    /// Number of sort worker threads.
    ///
    /// An explicit size wins; otherwise available parallelism minus the
    /// reserve, never less than one.
    pub fn pool_size(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => num_cpus().saturating_sub(self.worker_reserve).max(1),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}", path = .0.display(), source = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {source}", path = .0.display(), source = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}': {1}")]
    InvalidAddress(String, String),
}
