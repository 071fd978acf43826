//! In-process fakes of the platform capabilities.
#![allow(dead_code)]

use async_trait::async_trait;
use proxycore_ipc::{ControlRequest, IpcResult, ProviderSession};
use proxycore_session::{
    AppIdentity, ConsentPlatform, InterfaceAllocator, InterfaceRequest, InterfaceWrapper, Platform,
    PlatformError, PlatformResult, PlatformStatus, ProviderProfile, SessionConfig,
    SessionController, SessionSettings, StartOptions, TunnelProvider,
};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const APPLICATION_ID: &str = "org.proxycore.app";

pub fn app() -> AppIdentity {
    AppIdentity {
        display_name: "proxycore-test".into(),
        provider_bundle: "proxycore.tunnel".into(),
        application_id: Some(APPLICATION_ID.into()),
    }
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        control_timeout: Duration::from_millis(200),
        probe_interval: None,
        settle_timeout: Duration::from_millis(200),
        settle_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig::builder()
        .core_name("xray")
        .core_config("{\"inbounds\":[]}")
        .cache_dir("/tmp/proxycore-test")
        .build()
        .unwrap()
}

/// Scripted control channel endpoint.
#[derive(Default)]
pub struct FakeSession {
    responses: Mutex<HashMap<String, String>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<ControlRequest>>,
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, command: &str, reply: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), reply.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<ControlRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderSession for FakeSession {
    async fn send_message(&self, payload: Vec<u8>) -> IpcResult<Option<Vec<u8>>> {
        let request = ControlRequest::decode(&payload)?;
        let reply = self
            .responses
            .lock()
            .unwrap()
            .get(request.command_name())
            .cloned();
        self.requests.lock().unwrap().push(request);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(reply.map(String::into_bytes))
    }
}

/// Tunnel provider that keeps everything in memory.
pub struct FakeProvider {
    status: Mutex<PlatformStatus>,
    profile: Mutex<Option<ProviderProfile>>,
    tunnel_fd: Mutex<Option<OwnedFd>>,
    started: Mutex<Vec<StartOptions>>,
    session: Mutex<Option<Arc<dyn ProviderSession>>>,
    pub saves: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    /// Leave the tunnel disconnecting after a stop request
    pub linger_on_stop: AtomicBool,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            status: Mutex::new(PlatformStatus::Disconnected),
            profile: Mutex::new(None),
            tunnel_fd: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            saves: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            linger_on_stop: AtomicBool::new(false),
        }
    }
}

impl FakeProvider {
    pub fn set_status(&self, status: PlatformStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn current_status(&self) -> PlatformStatus {
        *self.status.lock().unwrap()
    }

    pub fn seed_profile(&self) {
        *self.profile.lock().unwrap() = Some(ProviderProfile::new(&app()).unwrap());
    }

    pub fn clear_profile(&self) {
        *self.profile.lock().unwrap() = None;
    }

    pub fn profile(&self) -> Option<ProviderProfile> {
        self.profile.lock().unwrap().clone()
    }

    pub fn attach_session(&self, session: Arc<dyn ProviderSession>) {
        *self.session.lock().unwrap() = Some(session);
    }

    pub fn started(&self) -> Vec<StartOptions> {
        self.started.lock().unwrap().clone()
    }

    pub fn tunnel_fd(&self) -> Option<RawFd> {
        self.tunnel_fd.lock().unwrap().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// The tunnel dies on its own: descriptor closed, control channel gone.
    pub fn crash(&self) {
        self.tunnel_fd.lock().unwrap().take();
        self.session.lock().unwrap().take();
        self.set_status(PlatformStatus::Disconnected);
    }
}

#[async_trait]
impl TunnelProvider for FakeProvider {
    async fn load_profile(&self) -> PlatformResult<Option<ProviderProfile>> {
        Ok(self.profile())
    }

    async fn save_profile(&self, profile: &ProviderProfile) -> PlatformResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.profile.lock().unwrap() = Some(profile.clone());
        Ok(())
    }

    async fn status(&self) -> PlatformStatus {
        self.current_status()
    }

    async fn start_tunnel(&self, options: &StartOptions, tun: OwnedFd) -> PlatformResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PlatformError::Rejected("tunnel refused to start".into()));
        }
        self.started.lock().unwrap().push(options.clone());
        *self.tunnel_fd.lock().unwrap() = Some(tun);
        self.set_status(PlatformStatus::Connected);
        Ok(())
    }

    async fn stop_tunnel(&self) -> PlatformResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(PlatformError::Other("stop failed".into()));
        }
        self.tunnel_fd.lock().unwrap().take();
        if self.linger_on_stop.load(Ordering::SeqCst) {
            self.set_status(PlatformStatus::Disconnecting);
        } else {
            self.set_status(PlatformStatus::Disconnected);
        }
        Ok(())
    }

    fn session(&self) -> Option<Arc<dyn ProviderSession>> {
        self.session.lock().unwrap().clone()
    }
}

pub struct FakeWrapper {
    file: Option<File>,
    closes: Arc<AtomicUsize>,
}

impl InterfaceWrapper for FakeWrapper {
    fn raw_fd(&self) -> RawFd {
        self.file.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1)
    }

    fn detach(&mut self) -> Option<OwnedFd> {
        self.file.take().map(OwnedFd::from)
    }

    fn close(&mut self) -> PlatformResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.file = None;
        Ok(())
    }
}

/// Interface allocator handing out temporary files as descriptors.
#[derive(Default)]
pub struct FakeAllocator {
    last_request: Mutex<Option<InterfaceRequest>>,
    pub fail: AtomicBool,
    pub exclusion_fails: AtomicBool,
    pub exclusions: Mutex<Vec<String>>,
    pub established: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeAllocator {
    pub fn last_request(&self) -> Option<InterfaceRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl InterfaceAllocator for FakeAllocator {
    async fn exclude_application(&self, application_id: &str) -> PlatformResult<()> {
        self.exclusions.lock().unwrap().push(application_id.to_string());
        if self.exclusion_fails.load(Ordering::SeqCst) {
            return Err(PlatformError::Unsupported("per-app exclusion".into()));
        }
        Ok(())
    }

    async fn establish(&self, request: &InterfaceRequest) -> PlatformResult<Box<dyn InterfaceWrapper>> {
        *self.last_request.lock().unwrap() = Some(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlatformError::Rejected("interface refused".into()));
        }
        self.established.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeWrapper {
            file: Some(tempfile::tempfile()?),
            closes: self.closes.clone(),
        }))
    }
}

#[derive(Default)]
pub struct FakeConsent {
    pub granted: AtomicBool,
    pub refuse_prompt: AtomicBool,
    pub launches: AtomicUsize,
    pub launched: Notify,
}

#[async_trait]
impl ConsentPlatform for FakeConsent {
    async fn consent_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn launch_consent_flow(&self) -> PlatformResult<()> {
        if self.refuse_prompt.load(Ordering::SeqCst) {
            return Err(PlatformError::Unsupported("no prompt available".into()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched.notify_one();
        Ok(())
    }
}

pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub allocator: Arc<FakeAllocator>,
    pub consent: Arc<FakeConsent>,
    pub controller: SessionController,
}

impl Harness {
    pub fn platform(&self) -> Platform {
        Platform {
            provider: self.provider.clone(),
            allocator: self.allocator.clone(),
            consent: self.consent.clone(),
        }
    }

    /// Another controller over the same platform, as after an app restart.
    pub async fn second_controller(&self) -> SessionController {
        SessionController::new(self.platform(), settings(), app()).await
    }
}

pub struct HarnessBuilder {
    granted: bool,
    profile: bool,
    settings: SessionSettings,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            granted: true,
            profile: true,
            settings: settings(),
        }
    }
}

impl HarnessBuilder {
    pub fn consent_granted(mut self, granted: bool) -> Self {
        self.granted = granted;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.settings.probe_interval = Some(interval);
        self
    }

    pub async fn build(self) -> Harness {
        let provider = Arc::new(FakeProvider::default());
        if self.profile {
            provider.seed_profile();
        }
        let allocator = Arc::new(FakeAllocator::default());
        let consent = Arc::new(FakeConsent::default());
        consent.granted.store(self.granted, Ordering::SeqCst);

        let platform = Platform {
            provider: provider.clone(),
            allocator: allocator.clone(),
            consent: consent.clone(),
        };
        let controller = SessionController::new(platform, self.settings, app()).await;

        Harness {
            provider,
            allocator,
            consent,
            controller,
        }
    }
}

pub async fn harness() -> Harness {
    HarnessBuilder::default().build().await
}
