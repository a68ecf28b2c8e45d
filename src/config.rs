//! Configuration module for the email-intake server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The port may be
//! left unset in both, in which case `main` asks the operator for it.

use clap::Parser;
use serde::Deserialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "email-intake")]
#[command(author = "email-intake authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP server that collects topic:value records", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host or address to bind to (e.g., 0.0.0.0 or ::)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on (prompted for when not set anywhere)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Cap on concurrent connections (unlimited when unset)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Maximum buffered bytes per connection without a line terminator
    #[arg(long)]
    pub max_request_size: Option<usize>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host or address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    pub port: Option<u16>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Optional cap on concurrent connections
    pub max_connections: Option<usize>,
    /// Events processed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            backlog: default_backlog(),
            max_connections: None,
            batch_size: default_batch_size(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum buffered bytes without a line terminator
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Maximum length of a stored email value
    #[serde(default = "default_max_email_len")]
    pub max_email_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            max_email_len: default_max_email_len(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_request_size() -> usize {
    2047
}

fn default_max_email_len() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: Option<u16>,
    pub backlog: i32,
    pub max_connections: Option<usize>,
    pub batch_size: usize,
    pub max_request_size: usize,
    pub max_email_len: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["email-intake"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli.max_connections.or(toml_config.server.max_connections),
            batch_size: toml_config.server.batch_size,
            max_request_size: cli
                .max_request_size
                .unwrap_or(toml_config.connection.max_request_size),
            max_email_len: toml_config.connection.max_email_len,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be positive"));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive"));
        }
        Ok(())
    }

    /// Port to listen on, asking the operator if none was configured.
    pub fn resolve_port(&self) -> Result<u16, ConfigError> {
        match self.port {
            Some(port) => Ok(port),
            None => {
                let stdin = io::stdin();
                prompt_port(&mut stdin.lock(), &mut io::stdout())
            }
        }
    }
}

/// Ask for a port number on `output` and read one line from `input`.
pub fn prompt_port<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<u16, ConfigError> {
    write!(output, "Enter the port number to host the SMTP server: ").map_err(ConfigError::Prompt)?;
    output.flush().map_err(ConfigError::Prompt)?;

    let mut line = String::new();
    input.read_line(&mut line).map_err(ConfigError::Prompt)?;

    let trimmed = line.trim();
    trimmed
        .parse()
        .map_err(|_| ConfigError::InvalidPort(trimmed.to_string()))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("Failed to read port from console: {0}")]
    Prompt(std::io::Error),

    #[error("Invalid port number '{0}'")]
    InvalidPort(String),
}
