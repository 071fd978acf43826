//! VPN session lifecycle controller for proxycore.
//!
//! [`SessionController`] turns `start`/`stop` requests into a consistent
//! sequence of consent negotiation, interface establishment and tunnel
//! launch over a [`Platform`], and reports one canonical connection status.

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod interface;
pub mod machine;
pub mod permission;
pub mod platform;
pub mod reconcile;
pub mod types;

pub use bridge::BridgeConfig;
pub use config::{
    AppIdentity, ProviderConfiguration, ProviderProfile, SessionConfig, SessionConfigBuilder,
    SessionSettings, StartOptions,
};
pub use control::ControlChannelClient;
pub use error::{SessionError, SessionResult};
pub use interface::{DescriptorOwner, GuardPhase, InterfaceGuard, InterfaceInfo};
pub use machine::{EventSink, SessionController, SessionEvent, SessionSnapshot};
pub use permission::{ConsentOutcome, PermissionNegotiator};
pub use platform::{
    ConsentPlatform, InterfaceAllocator, InterfaceWrapper, Platform, PlatformError,
    PlatformResult, TunnelProvider,
};
pub use reconcile::StatusBus;
pub use types::{
    ConnectionStatus, InterfaceAddressing, InterfaceRequest, IpCidr, PermissionStatus,
    PlatformStatus, SessionState,
};
