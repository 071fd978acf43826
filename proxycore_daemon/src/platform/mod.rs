//! Linux backends for the session controller's platform capabilities.
//!
//! Consent is tied to running as root, interfaces are TUN devices set up
//! with `ip`, and the tunnel itself is a pair of child processes: the proxy
//! core and the tun-to-socks bridge that reads the interface.

pub mod core_host;
pub mod interface;
pub mod provider;

use async_trait::async_trait;
use proxycore_session::{ConsentPlatform, Platform, PlatformError, PlatformResult};
use shared_utils::Config;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error};

pub use core_host::CoreHost;
pub use interface::TunAllocator;
pub use provider::{ProcessTunnelProvider, RuntimeStatus};

/// Run a system command and return its stdout.
pub(crate) async fn run_command(cmd: &str, args: &[&str]) -> PlatformResult<String> {
    debug!("Running command: {} {:?}", cmd, args);

    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .map_err(|e| PlatformError::Other(format!("Failed to execute {}: {}", cmd, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Command failed: {} {} {}", cmd, output.status, stderr.trim());
        return Err(PlatformError::Rejected(format!(
            "{} {:?} failed with status {}: {}",
            cmd,
            args,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Consent means running with root privileges; there is nobody to prompt.
pub struct RootConsent;

#[async_trait]
impl ConsentPlatform for RootConsent {
    async fn consent_granted(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    async fn launch_consent_flow(&self) -> PlatformResult<()> {
        Err(PlatformError::Rejected(
            "managing the VPN requires root privileges".into(),
        ))
    }
}

/// Everything the daemon needs to drive one controller.
pub struct LinuxPlatform {
    pub platform: Platform,
    pub provider: Arc<ProcessTunnelProvider>,
}

impl LinuxPlatform {
    pub fn from_config(config: &Config) -> Self {
        let core = Arc::new(CoreHost::new(
            &config.daemon.core_binary,
            config.daemon.core_args.clone(),
        ));
        let provider = Arc::new(ProcessTunnelProvider::from_config(config, core));
        let allocator = Arc::new(TunAllocator::new());

        Self {
            platform: Platform {
                provider: provider.clone(),
                allocator,
                consent: Arc::new(RootConsent),
            },
            provider,
        }
    }
}
