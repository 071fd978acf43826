//! Session configuration, launch options and the persisted provider profile.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use shared_utils::{AddressingProfile, Config, StartMode};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 2080;
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_MTU: u32 = 1500;

/// Immutable snapshot of one connection attempt.
///
/// Built through [`SessionConfig::builder`], which validates every field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    port: u16,
    bind_address: IpAddr,
    mtu: u32,
    core_name: String,
    core_config: String,
    cache_dir: PathBuf,
    start_mode: StartMode,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Build from the `[session]` section, reading the core config document.
    pub fn from_config(config: &Config) -> SessionResult<Self> {
        let core_config = config
            .read_core_config()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        SessionConfig::builder()
            .port(config.session.port)
            .bind_address(&config.session.bind_address)
            .mtu(config.session.mtu)
            .core_name(&config.session.core_name)
            .core_config(core_config)
            .cache_dir(&config.session.cache_dir)
            .start_mode(config.session.start_mode)
            .build()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn core_name(&self) -> &str {
        &self.core_name
    }

    pub fn core_config(&self) -> &str {
        &self.core_config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn start_mode(&self) -> StartMode {
        self.start_mode
    }

    /// Options handed to the platform when the tunnel is started.
    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            start_mode: self.start_mode,
            core_name: self.core_name.clone(),
            port: self.port,
            address: self.bind_address.to_string(),
            mtu: self.mtu,
            config: self.core_config.clone(),
            cache_dir: self.cache_dir.to_string_lossy().into_owned(),
        }
    }

    /// The subset persisted inside the provider profile.
    pub fn provider_configuration(&self) -> ProviderConfiguration {
        ProviderConfiguration {
            address: self.bind_address.to_string(),
            port: self.port,
            mtu: self.mtu,
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    port: u16,
    bind_address: String,
    mtu: u32,
    core_name: String,
    core_config: String,
    cache_dir: PathBuf,
    start_mode: StartMode,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: DEFAULT_ADDRESS.to_string(),
            mtu: DEFAULT_MTU,
            core_name: String::new(),
            core_config: String::new(),
            cache_dir: std::env::temp_dir().join("proxycore"),
            start_mode: StartMode::Normal,
        }
    }
}

impl SessionConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn core_name(mut self, name: impl Into<String>) -> Self {
        self.core_name = name.into();
        self
    }

    pub fn core_config(mut self, document: impl Into<String>) -> Self {
        self.core_config = document.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn start_mode(mut self, mode: StartMode) -> Self {
        self.start_mode = mode;
        self
    }

    pub fn build(self) -> SessionResult<SessionConfig> {
        if self.port == 0 {
            return Err(SessionError::InvalidConfig("port must be non-zero".into()));
        }

        let bind_address: IpAddr = self.bind_address.parse().map_err(|_| {
            SessionError::InvalidConfig(format!(
                "bind address '{}' is not an IP address",
                self.bind_address
            ))
        })?;

        if !(576..=65535).contains(&self.mtu) {
            return Err(SessionError::InvalidConfig(format!(
                "mtu {} outside 576..=65535",
                self.mtu
            )));
        }

        if self.start_mode == StartMode::Normal && self.core_name.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "core name is required in normal start mode".into(),
            ));
        }

        Ok(SessionConfig {
            port: self.port,
            bind_address,
            mtu: self.mtu,
            core_name: self.core_name,
            core_config: self.core_config,
            cache_dir: self.cache_dir,
            start_mode: self.start_mode,
        })
    }
}

/// Launch options passed to the platform with a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub start_mode: StartMode,
    pub core_name: String,
    pub port: u16,
    pub address: String,
    pub mtu: u32,
    pub config: String,
    pub cache_dir: String,
}

/// Listener settings persisted in the provider profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfiguration {
    pub address: String,
    pub port: u16,
    pub mtu: u32,
}

impl Default for ProviderConfiguration {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            mtu: DEFAULT_MTU,
        }
    }
}

impl ProviderConfiguration {
    /// Provider-side resolution: defaults, then the persisted record, then
    /// whatever the launch options carry.
    pub fn resolve(profile: Option<&ProviderProfile>, options: Option<&StartOptions>) -> Self {
        let mut resolved = profile
            .and_then(ProviderProfile::configuration)
            .unwrap_or_default();

        if let Some(options) = options {
            resolved.port = options.port;
            resolved.mtu = options.mtu;
            if !options.address.is_empty() {
                resolved.address = options.address.clone();
            }
        }

        resolved
    }
}

/// Identity of the controlling application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    /// Shown by the platform as the VPN's name
    pub display_name: String,
    /// Identifier of the tunnel provider
    pub provider_bundle: String,
    /// Application whose own traffic bypasses the tunnel
    pub application_id: Option<String>,
}

impl AppIdentity {
    pub fn from_config(config: &Config) -> Self {
        Self {
            display_name: config.interface.session_name.clone(),
            provider_bundle: config.daemon.provider_bundle.clone(),
            application_id: config.interface.application_id.clone(),
        }
    }
}

/// Persisted tunnel descriptor record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub description: String,
    pub provider_bundle: String,
    pub server_address: String,
    /// JSON text of a [`ProviderConfiguration`]
    pub provider_configuration: String,
    pub exclude_local_networks: bool,
    pub enabled: bool,
    pub on_demand: bool,
}

impl ProviderProfile {
    /// A fresh profile carrying the default listener settings.
    pub fn new(app: &AppIdentity) -> SessionResult<Self> {
        let mut profile = Self {
            description: app.display_name.clone(),
            provider_bundle: app.provider_bundle.clone(),
            server_address: DEFAULT_ADDRESS.to_string(),
            provider_configuration: String::new(),
            exclude_local_networks: true,
            enabled: true,
            on_demand: false,
        };
        profile.configure(&ProviderConfiguration::default())?;
        Ok(profile)
    }

    /// Serialize listener settings into the record and enable it.
    pub fn configure(&mut self, config: &ProviderConfiguration) -> SessionResult<()> {
        self.provider_configuration = serde_json::to_string(config)
            .map_err(|e| SessionError::MessageEncodingFailed(e.to_string()))?;
        self.server_address = config.address.clone();
        self.exclude_local_networks = true;
        self.enabled = true;
        self.on_demand = false;
        Ok(())
    }

    /// The persisted listener settings, if the record holds valid ones.
    pub fn configuration(&self) -> Option<ProviderConfiguration> {
        serde_json::from_str(&self.provider_configuration).ok()
    }
}

/// Controller tuning that does not change between connection attempts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub session_name: String,
    pub addressing: AddressingProfile,
    /// Bound on one control channel round trip
    pub control_timeout: Duration,
    /// Period of the background liveness reconcile
    pub probe_interval: Option<Duration>,
    /// How long a prior tunnel may take to go down before a new start
    pub settle_timeout: Duration,
    pub settle_poll: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_name: "proxycore-vpn".to_string(),
            addressing: AddressingProfile::default(),
            control_timeout: Duration::from_secs(3),
            probe_interval: Some(Duration::from_secs(30)),
            settle_timeout: Duration::from_secs(5),
            settle_poll: Duration::from_millis(100),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_name: config.interface.session_name.clone(),
            addressing: config.interface.addressing,
            control_timeout: config.control.timeout(),
            probe_interval: config.control.probe_interval(),
            settle_timeout: config.control.settle_timeout(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppIdentity {
        AppIdentity {
            display_name: "proxycore".into(),
            provider_bundle: "proxycore.tunnel".into(),
            application_id: None,
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = SessionConfig::builder().core_name("xray").build().unwrap();
        assert_eq!(config.port(), 2080);
        assert_eq!(config.bind_address().to_string(), "127.0.0.1");
        assert_eq!(config.mtu(), 1500);
        assert_eq!(config.start_mode(), StartMode::Normal);
    }

    #[test]
    fn test_builder_validation() {
        let missing_core = SessionConfig::builder().build();
        assert!(matches!(missing_core, Err(SessionError::InvalidConfig(_))));

        let simple = SessionConfig::builder().start_mode(StartMode::Simple).build();
        assert!(simple.is_ok());

        let bad_address = SessionConfig::builder()
            .core_name("xray")
            .bind_address("localhost")
            .build();
        assert!(matches!(bad_address, Err(SessionError::InvalidConfig(_))));

        let bad_mtu = SessionConfig::builder().core_name("xray").mtu(70_000).build();
        assert!(matches!(bad_mtu, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_start_options_wire_names() {
        let config = SessionConfig::builder()
            .core_name("xray")
            .core_config("{}")
            .cache_dir("/tmp/core")
            .build()
            .unwrap();

        let json = serde_json::to_value(config.start_options()).unwrap();
        assert_eq!(json["startMode"], "normal");
        assert_eq!(json["coreName"], "xray");
        assert_eq!(json["port"], 2080);
        assert_eq!(json["address"], "127.0.0.1");
        assert_eq!(json["cacheDir"], "/tmp/core");
    }

    #[test]
    fn test_profile_configuration() {
        let mut profile = ProviderProfile::new(&app()).unwrap();
        assert!(profile.exclude_local_networks);
        assert!(profile.enabled);
        assert!(!profile.on_demand);
        assert_eq!(profile.configuration(), Some(ProviderConfiguration::default()));

        profile
            .configure(&ProviderConfiguration {
                address: "127.0.0.2".into(),
                port: 7890,
                mtu: 1400,
            })
            .unwrap();
        assert_eq!(profile.server_address, "127.0.0.2");
        assert_eq!(profile.configuration().map(|c| c.port), Some(7890));
    }

    #[test]
    fn test_resolution_precedence() {
        // Nothing persisted and no options: built-in defaults
        assert_eq!(
            ProviderConfiguration::resolve(None, None),
            ProviderConfiguration::default()
        );

        let mut profile = ProviderProfile::new(&app()).unwrap();
        profile
            .configure(&ProviderConfiguration {
                address: "127.0.0.2".into(),
                port: 7890,
                mtu: 1400,
            })
            .unwrap();
        let persisted = ProviderConfiguration::resolve(Some(&profile), None);
        assert_eq!(persisted.port, 7890);
        assert_eq!(persisted.address, "127.0.0.2");

        let options = SessionConfig::builder()
            .core_name("xray")
            .port(1080)
            .build()
            .unwrap()
            .start_options();
        let launched = ProviderConfiguration::resolve(Some(&profile), Some(&options));
        assert_eq!(launched.port, 1080);
        assert_eq!(launched.address, "127.0.0.1");
        assert_eq!(launched.mtu, 1500);

        // A corrupt record falls back to defaults
        profile.provider_configuration = "{".into();
        assert_eq!(
            ProviderConfiguration::resolve(Some(&profile), None),
            ProviderConfiguration::default()
        );
    }
}
