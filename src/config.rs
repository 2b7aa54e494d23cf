//! Configuration module
//!
//! CLI arguments with environment variable fallbacks, an optional TOML
//! config file, and the validated [`ForwardConfig`] handed to the core.

use crate::core::Protocol;
use crate::error::{FwdError, Result};
use crate::logger::LogLevel;

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bind address
pub const DEFAULT_FROM: &str = "127.0.0.1:8000";

/// Outbound connect timeout used when none (or zero) is configured
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default UDP read buffer; larger datagrams are truncated
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 512;

/// Default TCP listen backlog
pub const DEFAULT_TCP_BACKLOG: i32 = 1024;

/// Parse duration string (e.g., "3s", "500ms", "1m") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '3s', '500ms', '1m' or plain seconds",
            s
        )
    })
}

fn parse_log_level(s: &str) -> std::result::Result<LogLevel, String> {
    LogLevel::parse(s).ok_or_else(|| {
        format!(
            "Invalid log level '{}'. Use trace, debug, info, warn or error",
            s
        )
    })
}

/// CLI arguments for the forwarder
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fwd",
    version,
    about = "The little forwarder that could",
    override_usage = "fwd --from localhost:2222 --to 192.168.1.254:22"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Source HOST:PORT [default: 127.0.0.1:8000]
    #[arg(short = 'f', long = "from", env = "FWD_FROM")]
    pub from: Option<String>,

    /// Destination HOST:PORT
    #[arg(short = 't', long = "to", env = "FWD_TO")]
    pub to: Option<String>,

    /// Client address HOST:PORT used as the source of outbound connections
    #[arg(long = "cli_addr", visible_alias = "ca", env = "CLI_ADDR")]
    pub cli_addr: Option<String>,

    /// Outbound connect timeout ("3s" or plain seconds) [default: 3s]
    #[arg(long = "conn_timeout", visible_alias = "ct", env = "CONN_TIMEOUT", value_parser = parse_duration)]
    pub conn_timeout: Option<Duration>,

    /// Enable UDP forwarding (TCP by default)
    #[arg(short = 'u', long = "udp")]
    pub udp: bool,

    /// List local addresses
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// Build information
    #[arg(short = 'b', long = "build")]
    pub build: bool,

    /// TOML config file with [common] and [log] tables
    #[arg(short = 'c', long = "config-file", env = "FWD_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error [default: info]
    #[arg(long = "log-level", env = "FWD_LOG_LEVEL", value_parser = parse_log_level)]
    pub log_level: Option<LogLevel>,

    // ==================== Performance Tuning ====================
    /// UDP datagram buffer size in bytes
    #[arg(long, env = "FWD_UDP_BUFFER_SIZE", default_value_t = DEFAULT_UDP_BUFFER_SIZE, help_heading = "Performance")]
    pub udp_buffer_size: usize,

    /// Maximum concurrent TCP sessions (0 = unlimited)
    #[arg(long, env = "FWD_MAX_CONNECTIONS", default_value_t = 0, help_heading = "Performance")]
    pub max_connections: usize,

    /// Close a TCP session after this much inactivity (disabled by default)
    #[arg(long, env = "FWD_IDLE_TIMEOUT", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Option<Duration>,

    /// TCP listen backlog
    #[arg(long, env = "FWD_TCP_BACKLOG", default_value_t = DEFAULT_TCP_BACKLOG, help_heading = "Performance")]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY on both sides of a session
    #[arg(
        long,
        env = "FWD_TCP_NODELAY",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Load the config file named by `--config-file`, if any
    pub fn load_file_config(&self) -> Result<FileConfig> {
        match self.config_file {
            Some(ref path) => FileConfig::load(path),
            None => Ok(FileConfig::default()),
        }
    }

    /// Effective log level: CLI/env first, then the config file.
    ///
    /// An unknown level in the file is a configuration error.
    pub fn log_level(&self, file: &FileConfig) -> Result<Option<LogLevel>> {
        if self.log_level.is_some() {
            return Ok(self.log_level);
        }
        match non_empty(file.log.level.as_deref()) {
            Some(level) => parse_log_level(level).map(Some).map_err(FwdError::Config),
            None => Ok(None),
        }
    }

    /// Merge CLI values over file values.
    ///
    /// Returns `Ok(None)` when no destination was given anywhere; the caller
    /// shows usage in that case.
    pub fn forward_config(&self, file: &FileConfig) -> Result<Option<ForwardConfig>> {
        let to = match non_empty(self.to.as_deref()).or(non_empty(file.common.to_addr.as_deref())) {
            Some(to) => to.to_string(),
            None => return Ok(None),
        };

        let from = non_empty(self.from.as_deref())
            .or(non_empty(file.common.from_addr.as_deref()))
            .unwrap_or(DEFAULT_FROM)
            .to_string();

        let cli_addr = non_empty(self.cli_addr.as_deref())
            .or(non_empty(file.common.cli_addr.as_deref()))
            .map(str::to_string);

        let conn_timeout = self
            .conn_timeout
            .or(file.common.conn_timeout.map(Duration::from_secs))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_CONN_TIMEOUT);

        let config = ForwardConfig {
            protocol: if self.udp { Protocol::Udp } else { Protocol::Tcp },
            from,
            to,
            cli_addr,
            conn_timeout,
            udp_buffer_size: self.udp_buffer_size,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout.filter(|d| !d.is_zero()),
            tcp_backlog: self.tcp_backlog,
            tcp_nodelay: self.tcp_nodelay,
        };
        config.validate()?;
        Ok(Some(config))
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// `[common]` table of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommonSection {
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub cli_addr: Option<String>,
    /// Seconds
    pub conn_timeout: Option<u64>,
}

/// `[log]` table of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: Option<String>,
}

/// On-disk configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub common: CommonSection,
    pub log: LogSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FwdError::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FwdError::Config(format!("TOML parse error: {}", e)))
    }
}

/// Validated forwarding parameters consumed by the core
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub protocol: Protocol,
    /// Bind address, `host:port`
    pub from: String,
    /// Remote address, `host:port`
    pub to: String,
    /// Local address for outbound connections; `None` lets the OS choose
    pub cli_addr: Option<String>,
    pub conn_timeout: Duration,
    pub udp_buffer_size: usize,
    /// 0 = unlimited
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
}

impl ForwardConfig {
    /// TCP forwarding from `from` to `to` with default tuning
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from: from.into(),
            to: to.into(),
            cli_addr: None,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            max_connections: 0,
            idle_timeout: None,
            tcp_backlog: DEFAULT_TCP_BACKLOG,
            tcp_nodelay: true,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_cli_addr(mut self, cli_addr: impl Into<String>) -> Self {
        self.cli_addr = Some(cli_addr.into());
        self
    }

    pub fn with_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = timeout;
        self
    }

    /// Check every value before any socket is opened
    pub fn validate(&self) -> Result<()> {
        check_host_port("from", &self.from, true)?;
        check_host_port("to", &self.to, false)?;
        if let Some(ref cli_addr) = self.cli_addr {
            check_host_port("cli_addr", cli_addr, true)?;
        }
        if self.conn_timeout.is_zero() {
            return Err(FwdError::Config("conn_timeout must be greater than 0".into()));
        }
        if self.udp_buffer_size == 0 {
            return Err(FwdError::Config("udp_buffer_size must be greater than 0".into()));
        }
        if self.udp_buffer_size > 65535 {
            return Err(FwdError::Config("udp_buffer_size must not exceed 65535".into()));
        }
        if self.tcp_backlog <= 0 {
            return Err(FwdError::Config("tcp_backlog must be greater than 0".into()));
        }
        Ok(())
    }
}

/// `host:port` shape check. Bind addresses may leave the host empty
/// (`:8000`), meaning all interfaces.
fn check_host_port(name: &str, value: &str, allow_empty_host: bool) -> Result<()> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| FwdError::Config(format!("{} '{}' is not HOST:PORT", name, value)))?;
    if port.parse::<u16>().is_err() {
        return Err(FwdError::Config(format!(
            "{} '{}' has an invalid port",
            name, value
        )));
    }
    if host.is_empty() && !allow_empty_host {
        return Err(FwdError::Config(format!("{} '{}' has no host", name, value)));
    }
    Ok(())
}
