//! Tunnel provider backed by local child processes.
//!
//! Starting the tunnel writes the bridge configuration, optionally starts
//! the proxy core, binds the control socket the controller probes, and
//! spawns the bridge with the interface descriptor inherited. The current
//! status is mirrored into a small JSON file beside the profile so that other
//! invocations of the daemon can see a tunnel hosted by this process.

use crate::launch::{CommandLine, Placeholders};
use crate::platform::CoreHost;
use crate::profile_store::ProfileStore;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use proxycore_ipc::{AccessPolicy, CommandHandler, ControlServer, ProviderSession, UnixSocketSession};
use proxycore_session::{
    BridgeConfig, EventSink, InterfaceAddressing, PlatformError, PlatformResult, PlatformStatus,
    ProviderConfiguration, ProviderProfile, SessionEvent, StartOptions, TunnelProvider,
};
use serde::{Deserialize, Serialize};
use shared_utils::config::StartMode;
use shared_utils::Config;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STATUS_FILE: &str = "tunnel.status.json";
const BRIDGE_CONFIG_FILE: &str = "bridge.yml";

/// Environment variable carrying the interface descriptor to the bridge.
pub const TUN_FD_ENV: &str = "PROXYCORE_TUN_FD";

/// Tunnel status as persisted for other daemon invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub status: PlatformStatus,
    /// Process hosting the tunnel
    pub pid: Option<u32>,
}

impl RuntimeStatus {
    pub fn new(status: PlatformStatus) -> Self {
        Self {
            status,
            pid: Some(std::process::id()),
        }
    }

    /// Location of the status file for a given profile path.
    pub fn path_for(state_path: &Path) -> PathBuf {
        state_path.with_file_name(STATUS_FILE)
    }

    pub async fn read(path: &Path) -> Option<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(file = %path.display(), "failed to read tunnel status: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(file = %path.display(), "ignoring corrupt tunnel status: {e}");
                None
            }
        }
    }

    pub async fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_vec(self).map_err(io::Error::from)?;
        tokio::fs::write(path, serialized).await
    }

    /// The recorded status, unless the hosting process has died.
    pub fn effective(&self) -> PlatformStatus {
        match self.pid {
            Some(pid) if self.status.is_live() && !process_alive(pid) => PlatformStatus::Disconnected,
            _ => self.status,
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

struct Shared {
    status: Mutex<PlatformStatus>,
    sink: Mutex<Option<EventSink>>,
    status_path: PathBuf,
    serving: AtomicBool,
}

impl Shared {
    async fn set_status(&self, status: PlatformStatus) {
        *self.status.lock().await = status;
        if let Err(e) = RuntimeStatus::new(status).write(&self.status_path).await {
            warn!(file = %self.status_path.display(), "failed to record tunnel status: {e}");
        }
    }

    async fn notify(&self) {
        if let Some(sink) = self.sink.lock().await.as_ref() {
            sink.submit(SessionEvent::StatusChanged);
        }
    }
}

/// Everything a running tunnel holds besides the bridge process itself.
struct Resources {
    tun: OwnedFd,
    stop_server: oneshot::Sender<()>,
    server: JoinHandle<()>,
    core: Arc<CoreHost>,
}

impl Resources {
    async fn release(self) {
        let _ = self.stop_server.send(());
        if let Err(e) = self.server.await {
            error!("Control server task failed: {}", e);
        }
        self.core.stop_core().await;
        drop(self.tun);
    }
}

/// Handle on the task supervising one running tunnel. The task owns the
/// bridge and its [`Resources`] and releases them on either exit path.
struct Runtime {
    stop: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

pub struct ProcessTunnelProvider {
    store: ProfileStore,
    core: Arc<CoreHost>,
    addressing: InterfaceAddressing,
    socket_path: PathBuf,
    control_timeout: Duration,
    bridge_binary: String,
    bridge_args: Vec<String>,
    allowed_uids: Vec<u32>,
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

impl ProcessTunnelProvider {
    pub fn from_config(config: &Config, core: Arc<CoreHost>) -> Self {
        let shared = Shared {
            status: Mutex::new(PlatformStatus::Disconnected),
            sink: Mutex::new(None),
            status_path: RuntimeStatus::path_for(&config.daemon.state_path),
            serving: AtomicBool::new(false),
        };

        Self {
            store: ProfileStore::new(&config.daemon.state_path),
            core,
            addressing: InterfaceAddressing::for_profile(config.interface.addressing),
            socket_path: config.control.socket_path.clone(),
            control_timeout: config.control.timeout(),
            bridge_binary: config.daemon.bridge_binary.clone(),
            bridge_args: config.daemon.bridge_args.clone(),
            allowed_uids: config.daemon.allowed_uids.clone(),
            shared: Arc::new(shared),
            runtime: Mutex::new(None),
        }
    }

    /// Route unexpected tunnel exits to a controller.
    pub async fn set_event_sink(&self, sink: EventSink) {
        *self.shared.sink.lock().await = Some(sink);
    }

    pub fn status_path(&self) -> &Path {
        &self.shared.status_path
    }

    async fn launch(&self, options: &StartOptions, tun: OwnedFd) -> PlatformResult<Runtime> {
        let profile = self.store.load().await?;
        let resolved = ProviderConfiguration::resolve(profile.as_ref(), Some(options));

        let cache_dir = if options.cache_dir.is_empty() {
            std::env::temp_dir().join("proxycore")
        } else {
            PathBuf::from(&options.cache_dir)
        };
        tokio::fs::create_dir_all(&cache_dir).await?;

        let bridge_path = cache_dir.join(BRIDGE_CONFIG_FILE);
        let bridge_config = BridgeConfig::new(&resolved, &self.addressing);
        let document = bridge_config
            .render()
            .map_err(|e| PlatformError::Other(format!("Failed to render bridge configuration: {}", e)))?;
        tokio::fs::write(&bridge_path, document).await?;
        debug!(file = %bridge_path.display(), "Wrote bridge configuration");

        if options.start_mode == StartMode::Normal {
            self.core
                .start_core(&options.core_name, &options.config, &cache_dir)
                .await?;
        }

        let (stop_server, server) = match self.serve_control().await {
            Ok(pair) => pair,
            Err(e) => {
                self.core.stop_core().await;
                return Err(e);
            }
        };

        let placeholders = Placeholders::new()
            .config(&bridge_path)
            .fd(tun.as_raw_fd())
            .port(resolved.port)
            .address(&resolved.address)
            .cache_dir(&cache_dir);

        let child = match self.spawn_bridge(&tun, &placeholders) {
            Ok(child) => child,
            Err(e) => {
                let _ = stop_server.send(());
                let _ = server.await;
                self.core.stop_core().await;
                return Err(e);
            }
        };

        let resources = Resources {
            tun,
            stop_server,
            server,
            core: self.core.clone(),
        };
        Ok(self.supervise(child, resources))
    }

    async fn serve_control(&self) -> PlatformResult<(oneshot::Sender<()>, JoinHandle<()>)> {
        let policy = self
            .allowed_uids
            .iter()
            .fold(AccessPolicy::new(), |policy, uid| policy.allow_uid(*uid));

        let server = ControlServer::bind_with_policy(&self.socket_path, policy)
            .await
            .map_err(|e| PlatformError::Other(format!("Failed to bind control socket: {}", e)))?
            .with_io_timeout(self.control_timeout);

        let handler: Arc<dyn CommandHandler> = self.core.clone();
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        shared.serving.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(handler, rx).await {
                error!("Control server failed: {}", e);
            }
            shared.serving.store(false, Ordering::SeqCst);
        });
        Ok((tx, task))
    }

    fn spawn_bridge(&self, tun: &OwnedFd, placeholders: &Placeholders) -> PlatformResult<Child> {
        let line = CommandLine::build("bridge", &self.bridge_binary, &self.bridge_args, placeholders)
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;

        let fd = tun.as_raw_fd();
        let mut command = Command::new(&line.program);
        command
            .args(&line.args)
            .env(TUN_FD_ENV, fd.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // SAFETY: fcntl is async-signal-safe and touches only the inherited descriptor
        unsafe {
            command.pre_exec(move || {
                fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(drop)
                    .map_err(io::Error::from)
            });
        }

        let child = command
            .spawn()
            .map_err(|e| PlatformError::Other(format!("Failed to spawn {}: {}", line.program, e)))?;
        info!(pid = child.id(), fd, "Started tun bridge");
        Ok(child)
    }

    fn supervise(&self, mut child: Child, resources: Resources) -> Runtime {
        let (stop, rx) = oneshot::channel::<()>();
        let shared = self.shared.clone();

        let supervisor = tokio::spawn(async move {
            tokio::select! {
                exit = child.wait() => {
                    match exit {
                        Ok(status) => warn!("Tun bridge exited unexpectedly with {}", status),
                        Err(e) => error!("Failed to wait for tun bridge: {}", e),
                    }
                    resources.release().await;
                    shared.set_status(PlatformStatus::Disconnected).await;
                    shared.notify().await;
                }
                _ = rx => {
                    if let Err(e) = child.kill().await {
                        debug!("Tun bridge already gone: {}", e);
                    }
                    resources.release().await;
                }
            }
        });
        Runtime { stop, supervisor }
    }

    async fn teardown(&self, runtime: Runtime) {
        let _ = runtime.stop.send(());
        if let Err(e) = runtime.supervisor.await {
            error!("Tunnel supervisor failed: {}", e);
        }
    }

    /// Ask the process recorded in the status file to stop its tunnel.
    async fn stop_remote(&self) -> bool {
        let Some(recorded) = RuntimeStatus::read(&self.shared.status_path).await else {
            return false;
        };
        let Some(pid) = recorded.pid else {
            return false;
        };
        if pid == std::process::id() || !recorded.effective().is_live() {
            return false;
        }
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                info!(pid, "Asked tunnel host to stop");
                true
            }
            Err(e) => {
                warn!(pid, "Failed to signal tunnel host: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl TunnelProvider for ProcessTunnelProvider {
    async fn load_profile(&self) -> PlatformResult<Option<ProviderProfile>> {
        self.store.load().await
    }

    async fn save_profile(&self, profile: &ProviderProfile) -> PlatformResult<()> {
        self.store.save(profile).await
    }

    async fn status(&self) -> PlatformStatus {
        if self.runtime.lock().await.is_some() {
            return *self.shared.status.lock().await;
        }
        RuntimeStatus::read(&self.shared.status_path)
            .await
            .map(|recorded| recorded.effective())
            .unwrap_or(PlatformStatus::Disconnected)
    }

    async fn start_tunnel(&self, options: &StartOptions, tun: OwnedFd) -> PlatformResult<()> {
        let mut runtime = self.runtime.lock().await;
        if let Some(previous) = runtime.take() {
            warn!("Replacing a tunnel that was still running");
            self.teardown(previous).await;
        }

        info!(
            mode = options.start_mode.as_str(),
            core = %options.core_name,
            port = options.port,
            "Starting tunnel"
        );
        self.shared.set_status(PlatformStatus::Connecting).await;

        match self.launch(options, tun).await {
            Ok(started) => {
                *runtime = Some(started);
                self.shared.set_status(PlatformStatus::Connected).await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to start tunnel: {}", e);
                self.shared.set_status(PlatformStatus::Disconnected).await;
                Err(e)
            }
        }
    }

    async fn stop_tunnel(&self) -> PlatformResult<()> {
        let mut runtime = self.runtime.lock().await;
        match runtime.take() {
            Some(running) => {
                self.shared.set_status(PlatformStatus::Disconnecting).await;
                self.teardown(running).await;
                info!("Tunnel stopped");
            }
            None => {
                if self.stop_remote().await {
                    return Ok(());
                }
                debug!("No tunnel to stop");
            }
        }
        self.shared.set_status(PlatformStatus::Disconnected).await;
        Ok(())
    }

    fn session(&self) -> Option<Arc<dyn ProviderSession>> {
        if !self.shared.serving.load(Ordering::SeqCst) && !self.socket_path.exists() {
            return None;
        }
        Some(Arc::new(
            UnixSocketSession::new(&self.socket_path).with_io_timeout(self.control_timeout),
        ))
    }
}
