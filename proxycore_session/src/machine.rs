//! The session state machine.
//!
//! Every transition runs under one async lock. A second `start` or `stop`
//! queues behind the one in flight and then acts on the settled state.
//! Platform events are fed through [`EventSink`] into a single loop that
//! takes the same lock; consent answers bypass the queue because the caller
//! waiting on them already holds it.

use crate::config::{AppIdentity, ProviderProfile, SessionConfig, SessionSettings};
use crate::control::ControlChannelClient;
use crate::error::{SessionError, SessionResult};
use crate::interface::{InterfaceGuard, InterfaceInfo};
use crate::permission::{ConsentOutcome, PermissionNegotiator};
use crate::platform::Platform;
use crate::reconcile::{Reconciler, StatusBus};
use crate::types::{
    ConnectionStatus, InterfaceAddressing, InterfaceRequest, PermissionStatus, SessionState,
};
use serde::Serialize;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Asynchronous input from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The user answered the consent prompt
    ConsentResult { granted: bool },
    /// The platform's tunnel status changed
    StatusChanged,
    /// The system withdrew the tunnel
    Revoked,
    /// The host came back to the foreground or woke from sleep
    Foreground,
}

/// Handle for delivering [`SessionEvent`]s from platform callbacks.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    negotiator: Arc<PermissionNegotiator>,
}

impl EventSink {
    pub fn submit(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConsentResult { granted } => {
                self.negotiator.on_consent_result(granted);
            }
            other => {
                if self.tx.send(other).is_err() {
                    debug!(event = ?other, "Session controller is gone; event dropped");
                }
            }
        }
    }
}

/// State guarded by the transition lock.
pub(crate) struct Transitions {
    pub(crate) state: SessionState,
    pub(crate) guard: InterfaceGuard,
    state_tx: watch::Sender<SessionState>,
}

impl Transitions {
    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Session state transition");
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub permission: PermissionStatus,
    pub interface: Option<InterfaceInfo>,
    pub last_status: Option<ConnectionStatus>,
}

struct Inner {
    platform: Platform,
    settings: SessionSettings,
    app: AppIdentity,
    transitions: Mutex<Transitions>,
    profile: Mutex<Option<ProviderProfile>>,
    negotiator: Arc<PermissionNegotiator>,
    control: ControlChannelClient,
    bus: Arc<StatusBus>,
    reconciler: Reconciler,
    state_rx: watch::Receiver<SessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

/// Drives one VPN session over a [`Platform`].
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub async fn new(platform: Platform, settings: SessionSettings, app: AppIdentity) -> Self {
        let negotiator = Arc::new(PermissionNegotiator::new(platform.consent.clone()).await);
        let control =
            ControlChannelClient::new(platform.provider.clone(), settings.control_timeout);
        let bus = Arc::new(StatusBus::new());
        let reconciler = Reconciler::new(
            platform.provider.clone(),
            control.clone(),
            negotiator.clone(),
            bus.clone(),
        );

        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transitions = Transitions {
            state: SessionState::Idle,
            guard: InterfaceGuard::new(platform.allocator.clone()),
            state_tx,
        };

        Self {
            inner: Arc::new(Inner {
                platform,
                settings,
                app,
                transitions: Mutex::new(transitions),
                profile: Mutex::new(None),
                negotiator,
                control,
                bus,
                reconciler,
                state_rx,
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
            }),
        }
    }

    async fn lock(&self) -> MutexGuard<'_, Transitions> {
        self.inner.transitions.lock().await
    }

    /// The cached provider profile, loading it from the provider on first use.
    async fn ensure_profile(&self, create: bool) -> SessionResult<ProviderProfile> {
        let mut cached = self.inner.profile.lock().await;
        if let Some(profile) = cached.as_ref() {
            return Ok(profile.clone());
        }

        let provider = &self.inner.platform.provider;
        let profile = match provider.load_profile().await? {
            Some(profile) => profile,
            None if create => {
                let profile = ProviderProfile::new(&self.inner.app)?;
                provider.save_profile(&profile).await?;
                info!(bundle = %profile.provider_bundle, "Created tunnel provider profile");
                profile
            }
            None => return Err(SessionError::ManagerNotInitialized),
        };

        *cached = Some(profile.clone());
        Ok(profile)
    }

    async fn reload_profile(&self) {
        match self.inner.platform.provider.load_profile().await {
            Ok(profile) => *self.inner.profile.lock().await = profile,
            Err(e) => warn!("Failed to reload tunnel provider profile: {}", e),
        }
    }

    /// Make sure a provider profile exists and VPN consent is settled.
    pub async fn prepare(&self) -> SessionResult<PermissionStatus> {
        self.ensure_profile(true).await?;
        let outcome = self.inner.negotiator.check_or_request().await?;
        debug!(?outcome, "Preparation finished");
        Ok(self.inner.negotiator.status())
    }

    /// Bring the VPN session up with `config`.
    pub async fn start(&self, config: &SessionConfig) -> SessionResult<()> {
        let attempt = Uuid::new_v4();
        let mut transitions = self.lock().await;

        if transitions.state.is_busy() {
            warn!(%attempt, state = %transitions.state, "Start rejected; session already active");
            return Err(SessionError::AlreadyRunning);
        }

        let mut profile = self.ensure_profile(false).await?;
        info!(%attempt, port = config.port(), mode = config.start_mode().as_str(), "Starting VPN session");

        transitions.set_state(SessionState::Negotiating);
        match self.inner.negotiator.check_or_request().await {
            Ok(ConsentOutcome::Granted) => {}
            Ok(outcome) => {
                info!(%attempt, ?outcome, "VPN consent not granted");
                transitions.set_state(SessionState::Idle);
                return Err(SessionError::PermissionDenied);
            }
            Err(e) => {
                transitions.set_state(SessionState::Idle);
                return Err(e);
            }
        }

        transitions.set_state(SessionState::Establishing);
        if let Err(e) = self.establish(&mut transitions, config, &mut profile).await {
            error!(%attempt, "VPN session start failed: {}", e);
            transitions.guard.cleanup();
            transitions.set_state(SessionState::Idle);
            return Err(e);
        }

        transitions.set_state(SessionState::Running);
        info!(%attempt, "VPN session running");
        self.inner.reconciler.reconcile(&mut transitions).await;
        Ok(())
    }

    async fn establish(
        &self,
        transitions: &mut Transitions,
        config: &SessionConfig,
        profile: &mut ProviderProfile,
    ) -> SessionResult<()> {
        let provider = &self.inner.platform.provider;

        profile.configure(&config.provider_configuration())?;
        provider.save_profile(profile).await?;
        *self.inner.profile.lock().await = Some(profile.clone());

        self.stop_prior_tunnel().await?;

        let settings = &self.inner.settings;
        let request = InterfaceRequest::new(
            settings.session_name.clone(),
            config.mtu(),
            InterfaceAddressing::for_profile(settings.addressing),
        );
        let tun = transitions
            .guard
            .establish(&request, self.inner.app.application_id.as_deref())
            .await?;

        provider.start_tunnel(&config.start_options(), tun).await?;
        Ok(())
    }

    /// Take down a tunnel left over from an earlier controller and wait,
    /// bounded, for the platform to report it gone.
    async fn stop_prior_tunnel(&self) -> SessionResult<()> {
        let provider = &self.inner.platform.provider;
        let status = provider.status().await;
        if !status.is_live() {
            return Ok(());
        }

        info!(status = status.as_str(), "Stopping previous tunnel before starting");
        provider.stop_tunnel().await?;

        let settle_timeout = self.inner.settings.settle_timeout;
        let deadline = Instant::now() + settle_timeout;
        loop {
            let status = provider.status().await;
            if status.is_settled() {
                debug!("Previous tunnel stopped");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SessionError::EstablishmentFailed(format!(
                    "previous tunnel still {} after {:?}",
                    status.as_str(),
                    settle_timeout
                )));
            }
            sleep(self.inner.settings.settle_poll).await;
        }
    }

    /// Take the session down. Stopping an inactive session is a no-op.
    pub async fn stop(&self) -> SessionResult<()> {
        let mut transitions = self.lock().await;

        if transitions.state != SessionState::Running {
            debug!(state = %transitions.state, "Stop requested with no running session");
            transitions.guard.cleanup();
            transitions.set_state(SessionState::Idle);
            return Ok(());
        }

        info!("Stopping VPN session");
        transitions.set_state(SessionState::Stopping);
        let result = self.inner.platform.provider.stop_tunnel().await;

        transitions.guard.cleanup();
        transitions.set_state(SessionState::Idle);
        self.inner.bus.publish(ConnectionStatus::Disconnected);

        if let Err(e) = &result {
            error!("Tunnel provider failed to stop: {}", e);
        }
        result.map_err(Into::into)
    }

    /// The platform's view of the tunnel in the canonical vocabulary.
    pub async fn query_status(&self) -> ConnectionStatus {
        if self.ensure_profile(false).await.is_err() {
            return ConnectionStatus::Disconnected;
        }
        ConnectionStatus::from(self.inner.platform.provider.status().await)
    }

    /// Release everything regardless of the current state.
    pub async fn cleanup(&self) {
        let mut transitions = self.lock().await;
        transitions.guard.cleanup();
        transitions.set_state(SessionState::Idle);
    }

    /// Re-derive and publish the canonical status now.
    pub async fn reconcile(&self) -> ConnectionStatus {
        let mut transitions = self.lock().await;
        self.inner.reconciler.reconcile(&mut transitions).await
    }

    /// Start the core inside an already running tunnel.
    pub async fn simple_start(&self, config: &SessionConfig) -> Option<String> {
        let cache_dir = config.cache_dir().to_string_lossy();
        let reply = self
            .inner
            .control
            .simple_start_core(config.core_name(), config.core_config(), &cache_dir)
            .await;
        info!(reply = ?reply, core = config.core_name(), "Simple core start");
        reply
    }

    pub async fn simple_stop(&self) -> bool {
        let stopped = self.inner.control.simple_stop_core().await;
        info!(stopped, "Simple core stop");
        stopped
    }

    pub fn control(&self) -> &ControlChannelClient {
        &self.inner.control
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    pub fn permission_status(&self) -> PermissionStatus {
        self.inner.negotiator.status()
    }

    /// Canonical status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.bus.subscribe()
    }

    pub fn last_status(&self) -> Option<ConnectionStatus> {
        self.inner.bus.last()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let transitions = self.lock().await;
        SessionSnapshot {
            state: transitions.state,
            permission: self.inner.negotiator.status(),
            interface: transitions.guard.info(),
            last_status: self.inner.bus.last(),
        }
    }

    pub fn event_sink(&self) -> EventSink {
        EventSink {
            tx: self.inner.events_tx.clone(),
            negotiator: self.inner.negotiator.clone(),
        }
    }

    /// Process one event inline.
    pub async fn handle_event(&self, event: SessionEvent) {
        debug!(?event, "Handling session event");
        match event {
            SessionEvent::ConsentResult { granted } => {
                self.inner.negotiator.on_consent_result(granted);
            }
            SessionEvent::StatusChanged => {
                self.reconcile().await;
            }
            SessionEvent::Foreground => {
                self.reload_profile().await;
                self.reconcile().await;
            }
            SessionEvent::Revoked => {
                let mut transitions = self.lock().await;
                self.inner.reconciler.revoke(&mut transitions).await;
            }
        }
    }

    /// Spawn the task that drains the event queue and runs the periodic
    /// liveness check. Returns `None` if the loop was already spawned.
    pub fn spawn_event_loop(&self) -> Option<JoinHandle<()>> {
        let mut rx = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut ticker = self.inner.settings.probe_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => Some(event),
                        None => break,
                    },
                    _ = next_tick(&mut ticker) => None,
                };

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let controller = SessionController { inner };
                match event {
                    Some(event) => controller.handle_event(event).await,
                    None => {
                        controller.reconcile().await;
                    }
                }
            }
            debug!("Session event loop stopped");
        }))
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
