//! Configuration module for the Modbus slave.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::modbus::DEFAULT_FRAME_TIMEOUT;
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Highest register count addressable with 16-bit register addresses.
pub const MAX_REGISTER_COUNT: usize = 1 << 16;

/// Command-line arguments for the Modbus slave
#[derive(Parser, Debug)]
#[command(name = "Modbus Server", bin_name = "modbus_server")]
#[command(version = concat!("- Version ", env!("CARGO_PKG_VERSION")))]
#[command(disable_version_flag = true)]
#[command(about = "Modbus-TCP slave serving a bank of holding registers", long_about = None)]
#[command(after_help = "Example:\n  modbus_server -i 192.168.1.100 -p 502 -r 20 --debug")]
pub struct CliArgs {
    /// Show version information
    #[arg(short = 'v', long, action = ArgAction::Version)]
    pub version: (),

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server IP address (default: 0.0.0.0)
    #[arg(short, long)]
    pub ip: Option<IpAddr>,

    /// Server port (default: 502)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of holding registers (default: 10)
    #[arg(short = 'r', long = "registers")]
    pub register_count: Option<usize>,

    /// Enable debug output (hex dumps of every query and response)
    #[arg(long)]
    pub debug: bool,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Close connections whose frame stalls for this many milliseconds (default: 500)
    #[arg(long)]
    pub frame_timeout_ms: Option<u64>,

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
    pub registers: RegistersSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_ip")]
    pub ip: IpAddr,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Idle timeout in seconds (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
    /// Time allowed for a started frame to complete, in milliseconds
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            workers: None,
            idle_timeout: 0,
            frame_timeout_ms: default_frame_timeout_ms(),
            backlog: default_backlog(),
        }
    }
}

/// Register bank configuration
#[derive(Debug, Deserialize)]
pub struct RegistersSection {
    /// Number of holding registers
    #[serde(default = "default_register_count")]
    pub count: usize,
}

impl Default for RegistersSection {
    fn default() -> Self {
        Self {
            count: default_register_count(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    /// Log level
    pub level: Option<String>,
    /// Hex-dump every query and response
    #[serde(default)]
    pub debug: bool,
}

fn default_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    502
}

fn default_register_count() -> usize {
    10
}

fn default_frame_timeout_ms() -> u64 {
    DEFAULT_FRAME_TIMEOUT.as_millis() as u64
}

fn default_backlog() -> i32 {
    128
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: IpAddr,
    pub port: u16,
    pub register_count: usize,
    pub debug: bool,
    pub workers: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub frame_timeout: Duration,
    pub backlog: i32,
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

        Self::merge(cli, toml_config)
    }

    /// Merge parsed CLI args over a TOML config and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let register_count = cli
            .register_count
            .unwrap_or(toml_config.registers.count);
        if register_count == 0 || register_count > MAX_REGISTER_COUNT {
            return Err(ConfigError::InvalidRegisterCount(register_count));
        }

        let debug = cli.debug || toml_config.logging.debug;

        // Hex dumps are debug-level events
        let log_level = cli
            .log_level
            .or(toml_config.logging.level)
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        let idle_timeout = cli
            .idle_timeout
            .unwrap_or(toml_config.server.idle_timeout);

        let frame_timeout_ms = cli
            .frame_timeout_ms
            .unwrap_or(toml_config.server.frame_timeout_ms);
        if frame_timeout_ms == 0 {
            return Err(ConfigError::InvalidFrameTimeout);
        }

        Ok(Config {
            ip: cli.ip.unwrap_or(toml_config.server.ip),
            port: cli.port.unwrap_or(toml_config.server.port),
            register_count,
            debug,
            workers: cli.workers.or(toml_config.server.workers),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            frame_timeout: Duration::from_millis(frame_timeout_ms),
            backlog: toml_config.server.backlog,
            log_level,
        })
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidRegisterCount(usize),
    InvalidFrameTimeout,
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
            ConfigError::InvalidRegisterCount(count) => {
                write!(
                    f,
                    "Invalid register count {count}: must be between 1 and {MAX_REGISTER_COUNT}"
                )
            }
            ConfigError::InvalidFrameTimeout => {
                write!(f, "Invalid frame timeout: must be at least 1 ms")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
