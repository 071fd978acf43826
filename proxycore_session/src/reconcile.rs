//! Status reconciliation and notification.
//!
//! The platform's report, the control channel probe and the interface guard
//! are folded into one canonical [`ConnectionStatus`]. Observers receive it
//! through the [`StatusBus`], which never repeats a value back to back.

use crate::control::ControlChannelClient;
use crate::machine::Transitions;
use crate::permission::PermissionNegotiator;
use crate::platform::TunnelProvider;
use crate::types::{ConnectionStatus, PlatformStatus, SessionState};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Fan-out of canonical status values.
pub struct StatusBus {
    tx: broadcast::Sender<ConnectionStatus>,
    last: Mutex<Option<ConnectionStatus>>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    /// Publish `status` unless it equals the last published value.
    ///
    /// Returns whether anything was sent.
    pub fn publish(&self, status: ConnectionStatus) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == Some(status) {
            debug!(%status, "Status unchanged; not publishing");
            return false;
        }

        *last = Some(status);
        // Sent under the lock so subscribers see values in publish order
        let receivers = self.tx.send(status).unwrap_or(0);
        info!(%status, receivers, "Connection status changed");
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    pub fn last(&self) -> Option<ConnectionStatus> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Re-derives the canonical status and repairs drift between the session
/// state and what the platform actually has.
pub(crate) struct Reconciler {
    provider: Arc<dyn TunnelProvider>,
    control: ControlChannelClient,
    negotiator: Arc<PermissionNegotiator>,
    bus: Arc<StatusBus>,
}

impl Reconciler {
    pub(crate) fn new(
        provider: Arc<dyn TunnelProvider>,
        control: ControlChannelClient,
        negotiator: Arc<PermissionNegotiator>,
        bus: Arc<StatusBus>,
    ) -> Self {
        Self {
            provider,
            control,
            negotiator,
            bus,
        }
    }

    /// Must be called with the transition lock held.
    pub(crate) async fn reconcile(&self, transitions: &mut Transitions) -> ConnectionStatus {
        if transitions.state == SessionState::Running
            && !transitions.guard.is_actually_live(transitions.state)
        {
            warn!("Interface is gone while the session is running; cleaning up");
            transitions.guard.cleanup();
            transitions.set_state(SessionState::Idle);
            return self.settle(ConnectionStatus::Disconnected).await;
        }

        let platform = self.provider.status().await;
        let mut status = ConnectionStatus::from(platform);

        if platform == PlatformStatus::Disconnected {
            if self.control.is_core_running().await {
                debug!("Platform reports disconnected but the core answers; treating as connected");
                status = ConnectionStatus::Connected;
            } else if transitions.state == SessionState::Running {
                warn!("Tunnel went away without a stop request; cleaning up");
                transitions.guard.cleanup();
                transitions.set_state(SessionState::Idle);
            }
        }

        self.settle(status).await
    }

    /// The system withdrew the tunnel.
    pub(crate) async fn revoke(&self, transitions: &mut Transitions) {
        let was_running = transitions.state == SessionState::Running;
        info!(state = %transitions.state, "VPN revoked by the system");

        transitions.set_state(SessionState::Revoked);
        transitions.guard.cleanup();

        if was_running || self.provider.status().await.is_live() {
            if let Err(e) = self.provider.stop_tunnel().await {
                warn!("Failed to stop tunnel after revocation: {}", e);
            }
        }

        self.negotiator.recheck_consent().await;
        transitions.set_state(SessionState::Idle);
        self.bus.publish(ConnectionStatus::Disconnected);
    }

    async fn settle(&self, status: ConnectionStatus) -> ConnectionStatus {
        if status == ConnectionStatus::Disconnected {
            self.negotiator.recheck_consent().await;
        }
        self.bus.publish(status);
        status
    }
}
