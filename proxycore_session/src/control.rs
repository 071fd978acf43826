//! Request/response channel into the running tunnel.

use crate::error::{SessionError, SessionResult};
use crate::platform::TunnelProvider;
use proxycore_ipc::{response, ControlRequest, IpcError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Sends control commands to the tunnel's core.
///
/// The session is looked up on every call, so a client created before the
/// tunnel starts picks up the channel once it exists.
#[derive(Clone)]
pub struct ControlChannelClient {
    provider: Arc<dyn TunnelProvider>,
    timeout: Duration,
}

impl ControlChannelClient {
    pub fn new(provider: Arc<dyn TunnelProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request, surfacing why no response arrived.
    pub async fn try_send(&self, request: &ControlRequest) -> SessionResult<Option<String>> {
        let session = self.provider.session().ok_or(SessionError::InvalidSession)?;
        let payload = request.encode()?;

        debug!(command = request.command_name(), "Sending control request");
        let reply = match timeout(self.timeout, session.send_message(payload)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(IpcError::Timeout(_))) | Err(_) => {
                return Err(SessionError::ControlTimeout(self.timeout))
            }
            Ok(Err(e)) => return Err(e.into()),
        };

        Ok(reply.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Send a request. Any failure is logged and reported as no response.
    pub async fn send(&self, request: &ControlRequest) -> Option<String> {
        match self.try_send(request).await {
            Ok(reply) => reply,
            Err(SessionError::InvalidSession) => {
                debug!(
                    command = request.command_name(),
                    "No control session; request dropped"
                );
                None
            }
            Err(e) => {
                warn!(command = request.command_name(), "Control request failed: {}", e);
                None
            }
        }
    }

    pub async fn is_core_running(&self) -> bool {
        response::is_true(self.send(&ControlRequest::is_core_running()).await.as_deref())
    }

    /// Latency measurement for a comma separated list of URLs.
    pub async fn measure_ping(&self, urls: &str) -> Option<String> {
        self.send(&ControlRequest::measure_ping(urls)).await
    }

    pub async fn fetch_logs(&self) -> Option<String> {
        self.send(&ControlRequest::fetch_logs()).await
    }

    pub async fn clear_logs(&self) {
        self.send(&ControlRequest::clear_logs()).await;
    }

    pub async fn version(&self) -> Option<String> {
        self.send(&ControlRequest::get_version()).await
    }

    /// Start the core inside an already running tunnel. The reply is passed
    /// through untouched: `"true"` on success, otherwise the core's error text.
    pub async fn simple_start_core(&self, core_name: &str, config: &str, cache_dir: &str) -> Option<String> {
        self.send(&ControlRequest::simple_start_core(core_name, config, cache_dir))
            .await
    }

    pub async fn simple_stop_core(&self) -> bool {
        response::is_true(self.send(&ControlRequest::simple_stop_core()).await.as_deref())
    }
}
