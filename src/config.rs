//! Configuration module for the xxe-targets server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the target server
#[derive(Parser, Debug)]
#[command(name = "xxe-targets")]
#[command(author = "xxe-targets authors")]
#[command(version = "0.1.0")]
#[command(about = "HTTP endpoints for exercising XML entity handling", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum request body size in bytes
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Timeout for fetching `url` and external entities, in seconds
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

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
    pub routes: RoutesConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
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
    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Request paths of the two targets
#[derive(Debug, Deserialize)]
pub struct RoutesConfig {
    #[serde(default = "default_raw_input_route")]
    pub raw_input: String,
    #[serde(default = "default_url_or_body_route")]
    pub url_or_body: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            raw_input: default_raw_input_route(),
            url_or_body: default_url_or_body_route(),
        }
    }
}

/// Outbound fetch configuration
#[derive(Debug, Deserialize)]
pub struct FetchConfig {
    /// Request timeout in seconds; no timeout when absent
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            user_agent: default_user_agent(),
        }
    }
}

/// Response body configuration
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Write `Warning:` lines into response bodies
    #[serde(default = "default_inline_warnings")]
    pub inline_warnings: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            inline_warnings: default_inline_warnings(),
        }
    }
}

/// Request bin configuration
#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    /// Seconds a bin lives after its last captured request
    #[serde(default = "default_bin_ttl")]
    pub bin_ttl_secs: u64,
    /// Interval for dropping expired bins in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bin_ttl_secs: default_bin_ttl(),
            cleanup_interval: default_cleanup_interval(),
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
    "127.0.0.1:8080".to_string()
}

fn default_max_body_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_raw_input_route() -> String {
    "/xml.php".to_string()
}

fn default_url_or_body_route() -> String {
    "/xmldom.php".to_string()
}

fn default_user_agent() -> String {
    concat!("xxe-targets/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_inline_warnings() -> bool {
    true
}

fn default_bin_ttl() -> u64 {
    24 * 60 * 60 // one day
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_body_size: usize,
    pub raw_input_route: String,
    pub url_or_body_route: String,
    pub fetch_timeout: Option<Duration>,
    pub user_agent: String,
    pub inline_warnings: bool,
    pub bin_ttl: Duration,
    pub cleanup_interval: u64,
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

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_body_size: cli
                .max_body_size
                .unwrap_or(toml_config.server.max_body_size),
            raw_input_route: toml_config.routes.raw_input,
            url_or_body_route: toml_config.routes.url_or_body,
            fetch_timeout: cli
                .fetch_timeout
                .or(toml_config.fetch.timeout_secs)
                .map(Duration::from_secs),
            user_agent: toml_config.fetch.user_agent,
            inline_warnings: toml_config.output.inline_warnings,
            bin_ttl: Duration::from_secs(toml_config.capture.bin_ttl_secs),
            cleanup_interval: toml_config.capture.cleanup_interval,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Config {
            listen: toml_config.server.listen,
            workers: None,
            max_body_size: toml_config.server.max_body_size,
            raw_input_route: toml_config.routes.raw_input,
            url_or_body_route: toml_config.routes.url_or_body,
            fetch_timeout: None,
            user_agent: toml_config.fetch.user_agent,
            inline_warnings: toml_config.output.inline_warnings,
            bin_ttl: Duration::from_secs(toml_config.capture.bin_ttl_secs),
            cleanup_interval: toml_config.capture.cleanup_interval,
            log_level: toml_config.logging.level,
        }
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
