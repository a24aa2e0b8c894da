//! Configuration module for hello-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "hello-server")]
#[command(author = "hello-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A fixed-response TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8081)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Accept backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrently served connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Accept backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Per-connection I/O deadlines and the shutdown drain window
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds allowed for the request read (0 disables the deadline)
    #[serde(default = "default_io_timeout")]
    pub read_secs: u64,
    /// Seconds allowed for the response write (0 disables the deadline)
    #[serde(default = "default_io_timeout")]
    pub write_secs: u64,
    /// Seconds granted to in-flight connections during shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: default_io_timeout(),
            write_secs: default_io_timeout(),
            drain_secs: default_drain_timeout(),
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
    "0.0.0.0:8081".to_string()
}

fn default_backlog() -> u32 {
    128
}

fn default_max_connections() -> usize {
    1024
}

fn default_io_timeout() -> u64 {
    30 // seconds
}

fn default_drain_timeout() -> u64 {
    10 // seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            read_timeout_secs: toml_config.timeouts.read_secs,
            write_timeout_secs: toml_config.timeouts.write_secs,
            drain_timeout_secs: toml_config.timeouts.drain_secs,
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
