//! Platform capabilities the controller is built on.
//!
//! Each trait stands in for one thing the operating system provides: the
//! consent prompt, the virtual interface allocator and the tunnel provider
//! that runs the proxy core. Production backends live in the daemon; tests
//! supply fakes.

use crate::config::{ProviderProfile, StartOptions};
use crate::types::{InterfaceRequest, PlatformStatus};
use async_trait::async_trait;
use proxycore_ipc::ProviderSession;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use thiserror::Error;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Error type for platform operations
#[derive(Error, Debug)]
pub enum PlatformError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The platform refused the request
    #[error("Rejected by platform: {0}")]
    Rejected(String),

    /// The platform cannot do this at all
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The platform did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// The platform's VPN consent mechanism.
#[async_trait]
pub trait ConsentPlatform: Send + Sync {
    /// Whether the user has already consented.
    async fn consent_granted(&self) -> bool;

    /// Show the consent prompt. The answer arrives later as a
    /// `SessionEvent::ConsentResult`.
    async fn launch_consent_flow(&self) -> PlatformResult<()>;
}

/// The platform's owning wrapper around an interface descriptor.
pub trait InterfaceWrapper: Send {
    /// The descriptor number, or a non-positive value once released.
    fn raw_fd(&self) -> RawFd;

    /// Give up close responsibility and hand the descriptor out.
    fn detach(&mut self) -> Option<OwnedFd>;

    /// Close the descriptor while still owned by the wrapper.
    fn close(&mut self) -> PlatformResult<()>;
}

/// Allocates virtual interfaces.
#[async_trait]
pub trait InterfaceAllocator: Send + Sync {
    /// Keep an application's own traffic off the interface.
    async fn exclude_application(&self, application_id: &str) -> PlatformResult<()>;

    async fn establish(&self, request: &InterfaceRequest) -> PlatformResult<Box<dyn InterfaceWrapper>>;
}

/// Hosts the tunnel process and its persisted profile.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn load_profile(&self) -> PlatformResult<Option<ProviderProfile>>;

    async fn save_profile(&self, profile: &ProviderProfile) -> PlatformResult<()>;

    async fn status(&self) -> PlatformStatus;

    /// Start the tunnel. The provider owns `tun` from here on.
    async fn start_tunnel(&self, options: &StartOptions, tun: OwnedFd) -> PlatformResult<()>;

    async fn stop_tunnel(&self) -> PlatformResult<()>;

    /// Control channel into the running tunnel, if one is established.
    fn session(&self) -> Option<Arc<dyn ProviderSession>>;
}

/// The set of capabilities a controller is built from.
#[derive(Clone)]
pub struct Platform {
    pub provider: Arc<dyn TunnelProvider>,
    pub allocator: Arc<dyn InterfaceAllocator>,
    pub consent: Arc<dyn ConsentPlatform>,
}
