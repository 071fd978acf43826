//! Configuration management module for proxycore.
//!
//! This module loads, validates and saves the TOML configuration shared by
//! the session controller and the daemon.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// How the proxy core is brought up inside the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// The tunnel process starts the core itself
    #[default]
    Normal,
    /// The tunnel comes up bare; the core is started over the control channel
    Simple,
}

impl StartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMode::Normal => "normal",
            StartMode::Simple => "simple",
        }
    }
}

/// Which default address set the virtual interface is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressingProfile {
    /// 198.18.0.1/24 and fc00::1/64 with public resolvers
    #[default]
    Tunnel,
    /// 172.19.0.1/24 and fdfe:dcba:9876::1/128 with Cloudflare resolvers
    Client,
}

/// Defaults for each connection attempt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSection {
    /// Local listener port of the proxy core (default: 2080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local listener address of the proxy core (default: "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Interface MTU (default: 1500)
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    #[serde(default)]
    pub start_mode: StartMode,

    /// Name of the core the tunnel should run
    #[serde(default = "default_core_name")]
    pub core_name: String,

    /// File holding the opaque core configuration document
    #[serde(default)]
    pub core_config_path: Option<PathBuf>,

    /// Working directory handed to the core
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_port() -> u16 {
    2080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_mtu() -> u32 {
    1500
}

fn default_core_name() -> String {
    "xray".to_string()
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("proxycore"))
        .unwrap_or_else(|| PathBuf::from("/var/cache/proxycore"))
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            port: default_port(),
            bind_address: default_bind_address(),
            mtu: default_mtu(),
            start_mode: StartMode::default(),
            core_name: default_core_name(),
            core_config_path: None,
            cache_dir: default_cache_dir(),
        }
    }
}

/// Virtual interface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceSection {
    #[serde(default)]
    pub addressing: AddressingProfile,

    /// Session name shown by the platform (default: "proxycore-vpn")
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Application whose own traffic bypasses the tunnel
    #[serde(default)]
    pub application_id: Option<String>,
}

fn default_session_name() -> String {
    "proxycore-vpn".to_string()
}

impl Default for InterfaceSection {
    fn default() -> Self {
        InterfaceSection {
            addressing: AddressingProfile::default(),
            session_name: default_session_name(),
            application_id: None,
        }
    }
}

/// Control channel and reconciliation timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlSection {
    /// Control socket exposed by the tunnel process
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Round-trip bound for one control request, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Period of the background liveness check, 0 disables it
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// How long a prior tunnel may take to go down before a new start
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/proxycore/control.sock")
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_settle_timeout_ms() -> u64 {
    5_000
}

impl Default for ControlSection {
    fn default() -> Self {
        ControlSection {
            socket_path: default_socket_path(),
            timeout_ms: default_timeout_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            settle_timeout_ms: default_settle_timeout_ms(),
        }
    }
}

impl ControlSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Linux daemon settings.
///
/// Argument lists accept the placeholders `{config}`, `{fd}`, `{port}`,
/// `{address}` and `{cache_dir}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonSection {
    /// Where the provider profile is persisted
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Identifier recorded in the provider profile
    #[serde(default = "default_provider_bundle")]
    pub provider_bundle: String,

    #[serde(default = "default_bridge_binary")]
    pub bridge_binary: String,

    #[serde(default = "default_bridge_args")]
    pub bridge_args: Vec<String>,

    #[serde(default = "default_core_binary")]
    pub core_binary: String,

    #[serde(default = "default_core_args")]
    pub core_args: Vec<String>,

    /// Extra users allowed on the control socket
    #[serde(default)]
    pub allowed_uids: Vec<u32>,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/proxycore/profile.json")
}

fn default_provider_bundle() -> String {
    "proxycore.tunnel".to_string()
}

fn default_bridge_binary() -> String {
    "hev-socks5-tunnel".to_string()
}

fn default_bridge_args() -> Vec<String> {
    vec!["{config}".to_string()]
}

fn default_core_binary() -> String {
    "xray".to_string()
}

fn default_core_args() -> Vec<String> {
    vec!["run".to_string(), "-c".to_string(), "{config}".to_string()]
}

impl Default for DaemonSection {
    fn default() -> Self {
        DaemonSection {
            state_path: default_state_path(),
            provider_bundle: default_provider_bundle(),
            bridge_binary: default_bridge_binary(),
            bridge_args: default_bridge_args(),
            core_binary: default_core_binary(),
            core_args: default_core_args(),
            allowed_uids: Vec::new(),
        }
    }
}

/// Log sinks. The level lives at the top level as `log_level`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSection {
    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default)]
    pub file: bool,

    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            stdout: true,
            file: false,
            dir: default_log_dir(),
            json: false,
        }
    }
}

/// Main configuration structure for proxycore.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub interface: InterfaceSection,

    #[serde(default)]
    pub control: ControlSection,

    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            session: SessionSection::default(),
            interface: InterfaceSection::default(),
            control: ControlSection::default(),
            daemon: DaemonSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment takes precedence over the file
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if crate::logging::parse_level(&self.log_level).is_none() {
            return Err(ConfigError::invalid(
                "log_level",
                format!("unknown level '{}'", self.log_level),
            ));
        }

        if self.session.port == 0 {
            return Err(ConfigError::invalid("session.port", "must be greater than 0"));
        }

        if self.session.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::invalid(
                "session.bind_address",
                format!("'{}' is not an IP address", self.session.bind_address),
            ));
        }

        if !(576..=65535).contains(&self.session.mtu) {
            return Err(ConfigError::invalid(
                "session.mtu",
                "must be between 576 and 65535",
            ));
        }

        if self.session.start_mode == StartMode::Normal && self.session.core_name.trim().is_empty()
        {
            return Err(ConfigError::invalid(
                "session.core_name",
                "required when start_mode = \"normal\"",
            ));
        }

        if self.interface.session_name.trim().is_empty() {
            return Err(ConfigError::invalid("interface.session_name", "cannot be empty"));
        }

        if self.control.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("control.socket_path", "cannot be empty"));
        }

        if self.control.timeout_ms == 0 {
            return Err(ConfigError::invalid("control.timeout_ms", "must be greater than 0"));
        }

        if self.control.settle_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "control.settle_timeout_ms",
                "must be greater than 0",
            ));
        }

        if self.daemon.bridge_binary.trim().is_empty() {
            return Err(ConfigError::invalid("daemon.bridge_binary", "cannot be empty"));
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: PROXYCORE_)
    ///
    /// Recognised keys: PROXYCORE_LOG_LEVEL, PROXYCORE_SESSION_PORT,
    /// PROXYCORE_SESSION_BIND_ADDRESS, PROXYCORE_SESSION_MTU,
    /// PROXYCORE_SESSION_START_MODE, PROXYCORE_INTERFACE_ADDRESSING,
    /// PROXYCORE_CONTROL_SOCKET_PATH, PROXYCORE_CONTROL_TIMEOUT_MS.
    fn apply_env_overrides(&mut self) {
        use std::env;

        if let Ok(v) = env::var("PROXYCORE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(n) = env::var("PROXYCORE_SESSION_PORT").ok().and_then(|v| v.parse().ok()) {
            self.session.port = n;
        }
        if let Ok(v) = env::var("PROXYCORE_SESSION_BIND_ADDRESS") {
            self.session.bind_address = v;
        }
        if let Some(n) = env::var("PROXYCORE_SESSION_MTU").ok().and_then(|v| v.parse().ok()) {
            self.session.mtu = n;
        }
        if let Ok(v) = env::var("PROXYCORE_SESSION_START_MODE") {
            self.session.start_mode = match v.to_ascii_lowercase().as_str() {
                "simple" => StartMode::Simple,
                _ => StartMode::Normal,
            };
        }
        if let Ok(v) = env::var("PROXYCORE_INTERFACE_ADDRESSING") {
            self.interface.addressing = match v.to_ascii_lowercase().as_str() {
                "client" => AddressingProfile::Client,
                _ => AddressingProfile::Tunnel,
            };
        }
        if let Ok(v) = env::var("PROXYCORE_CONTROL_SOCKET_PATH") {
            if !v.is_empty() {
                self.control.socket_path = PathBuf::from(v);
            }
        }
        if let Some(n) = env::var("PROXYCORE_CONTROL_TIMEOUT_MS").ok().and_then(|v| v.parse().ok())
        {
            self.control.timeout_ms = n;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("proxycore").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }

    /// Read the core configuration document, empty when none is configured
    pub fn read_core_config(&self) -> Result<String, ConfigError> {
        match &self.session.core_config_path {
            Some(path) if !path.exists() => Err(ConfigError::FileNotFound(path.clone())),
            Some(path) => Ok(fs::read_to_string(path)?),
            None => Ok(String::new()),
        }
    }
}
