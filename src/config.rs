//! Configuration module for the botlink control-plane server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The shared
//! authentication secret is only read from the command line or the
//! environment, never from the config file.

use crate::auth::SharedSecret;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the shared authentication secret.
pub const AUTH_SECRET_ENV: &str = "BOTLINK_AUTH_SECRET";

/// How request and response frames are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// A read shorter than the chunk size ends the frame.
    #[default]
    ShortRead,
    /// Each frame carries a 4-byte big-endian length prefix.
    LengthPrefixed,
}

/// Command-line arguments for the control-plane server
#[derive(Parser, Debug)]
#[command(name = "botlink")]
#[command(author = "botlink authors")]
#[command(version = "0.1.0")]
#[command(about = "Authenticated JSON control-plane server for a chat bot", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:15555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Frame delimiting scheme
    #[arg(long, value_enum)]
    pub framing: Option<FramingMode>,

    /// Maximum size of a single request frame in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Socket read size used by the short-read framing
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Shared secret clients must present before calling endpoints
    #[arg(long, env = AUTH_SECRET_ENV, hide_env_values = true)]
    pub auth_secret: Option<String>,

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
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds to wait for sessions to finish during shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub framing: FramingMode,
    /// Maximum accumulated frame size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Read chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            framing: FramingMode::default(),
            max_frame_size: default_max_frame_size(),
            chunk_size: default_chunk_size(),
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
    "0.0.0.0:15555".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KiB
}

fn default_chunk_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
    pub framing: FramingMode,
    pub max_frame_size: usize,
    pub chunk_size: usize,
    pub auth_secret: SharedSecret,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args, the environment, and an optional
    /// TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let max_frame_size = cli
            .max_frame_size
            .unwrap_or(toml_config.protocol.max_frame_size);
        let chunk_size = cli.chunk_size.unwrap_or(toml_config.protocol.chunk_size);
        if chunk_size == 0 || chunk_size > max_frame_size {
            return Err(ConfigError::InvalidChunkSize {
                chunk_size,
                max_frame_size,
            });
        }

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }

        let auth_secret = match cli.auth_secret {
            Some(secret) if !secret.is_empty() => SharedSecret::new(secret),
            _ => return Err(ConfigError::MissingSecret),
        };

        Ok(Config {
            listen,
            max_connections,
            shutdown_timeout: Duration::from_secs(toml_config.server.shutdown_timeout),
            framing: cli.framing.unwrap_or(toml_config.protocol.framing),
            max_frame_size,
            chunk_size,
            auth_secret,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("Chunk size {chunk_size} must be between 1 and the max frame size {max_frame_size}")]
    InvalidChunkSize {
        chunk_size: usize,
        max_frame_size: usize,
    },
    #[error("max_connections must be at least 1")]
    NoConnections,
    #[error("No authentication secret configured; pass --auth-secret or set BOTLINK_AUTH_SECRET")]
    MissingSecret,
}
