//! Configuration module for linechat.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "linechat")]
#[command(author = "linechat authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:4000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port to listen on, replacing the port of the listen address
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Directory that receives one log file per client IP
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Seconds a client may stay silent before being disconnected
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum message length in characters after trimming
    #[arg(long)]
    pub max_message_len: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub session: SessionConfig,
    #[serde(default)]
    pub client_log: ClientLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection protocol limits
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Idle deadline in seconds, reset before every read
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Maximum trimmed message length in characters
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Bytes of a single line kept in the read buffer
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            max_message_len: default_max_message_len(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Per-client message log configuration
#[derive(Debug, Deserialize)]
pub struct ClientLogConfig {
    /// Directory holding `<ip>.log` files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for ClientLogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
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
    "0.0.0.0:4000".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_max_message_len() -> usize {
    1024
}

fn default_max_line_bytes() -> usize {
    64 * 1024 // 64 KiB
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub max_message_len: usize,
    pub max_line_bytes: usize,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            max_message_len: default_max_message_len(),
            max_line_bytes: default_max_line_bytes(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
        }
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
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);

        Config {
            listen: match cli.port {
                Some(port) => with_port(&listen, port),
                None => listen,
            },
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout
                    .unwrap_or(toml_config.session.idle_timeout),
            ),
            max_message_len: cli
                .max_message_len
                .unwrap_or(toml_config.session.max_message_len),
            max_line_bytes: toml_config.session.max_line_bytes,
            log_dir: cli.log_dir.unwrap_or(toml_config.client_log.dir),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject limits the session loop cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle_timeout must be positive".into()));
        }
        if self.max_message_len == 0 {
            return Err(ConfigError::Invalid(
                "max_message_len must be positive".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be positive".into(),
            ));
        }
        // A UTF-8 character takes at most four bytes.
        let needed = self.max_message_len.saturating_mul(4);
        if self.max_line_bytes < needed {
            return Err(ConfigError::Invalid(format!(
                "max_line_bytes ({}) must be at least {} for max_message_len {}",
                self.max_line_bytes, needed, self.max_message_len
            )));
        }
        Ok(())
    }
}

/// Swap the port of `listen` for `port`, keeping the host part.
///
/// IP literals go through `SocketAddr`, so bare IPv6 hosts come back
/// bracketed. Anything else is treated as `hostname[:port]`.
fn with_port(listen: &str, port: u16) -> String {
    if let Ok(mut addr) = listen.parse::<SocketAddr>() {
        addr.set_port(port);
        return addr.to_string();
    }

    let bare = listen.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }

    let host = match listen.rsplit_once(':') {
        Some((host, _)) => host,
        None => listen,
    };
    format!("{host}:{port}")
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:4000");
        assert_eq!(config.session.idle_timeout, 30);
        assert_eq!(config.session.max_message_len, 1024);
        assert_eq!(config.client_log.dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            max_connections = 64

            [session]
            idle_timeout = 5
            max_message_len = 256

            [client_log]
            dir = "/var/log/linechat"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.session.idle_timeout, 5);
        assert_eq!(config.session.max_message_len, 256);
        assert_eq!(config.session.max_line_bytes, 64 * 1024);
        assert_eq!(config.client_log.dir, PathBuf::from("/var/log/linechat"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "linechat",
            "--port",
            "5000",
            "--idle-timeout",
            "10",
            "--log-dir",
            "/tmp/chat",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [session]
            idle_timeout = 5
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.listen, "127.0.0.1:5000");
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/chat"));
        assert_eq!(config.log_level, "trace");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("0.0.0.0:4000", 8080), "0.0.0.0:8080");
        assert_eq!(with_port("[::1]:4000", 8080), "[::1]:8080");
        assert_eq!(with_port("localhost", 8080), "localhost:8080");
        assert_eq!(with_port("localhost:4000", 8080), "localhost:8080");
    }

    #[test]
    fn test_with_port_bare_ipv6_host() {
        assert_eq!(with_port("::1", 8080), "[::1]:8080");
        assert_eq!(with_port("[::1]", 8080), "[::1]:8080");
        assert_eq!(with_port("::", 4000), "[::]:4000");
        assert_eq!(with_port("10.0.0.1", 4000), "10.0.0.1:4000");
    }

    #[test]
    fn test_config_default_matches_unconfigured_load() {
        let merged = Config::merge(CliArgs::parse_from(["linechat"]), TomlConfig::default());
        let default = Config::default();
        assert_eq!(merged.listen, default.listen);
        assert_eq!(merged.max_connections, default.max_connections);
        assert_eq!(merged.idle_timeout, default.idle_timeout);
        assert_eq!(merged.max_message_len, default.max_message_len);
        assert_eq!(merged.max_line_bytes, default.max_line_bytes);
        assert_eq!(merged.log_dir, default.log_dir);
        assert_eq!(merged.log_level, default.log_level);
    }

    #[test]
    fn test_validate_rejects_small_line_buffer() {
        let config = Config {
            max_line_bytes: 1024,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            idle_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(Config::default().validate().is_ok());
    }
}
