//! The proxy core process and the control commands it answers.

use super::run_command;
use crate::launch::{CommandLine, Placeholders};
use async_trait::async_trait;
use proxycore_ipc::{CommandHandler, ControlCommand, ControlRequest};
use proxycore_session::{PlatformError, PlatformResult};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_FILE: &str = "core.log";

#[derive(Default)]
struct CoreState {
    child: Option<Child>,
    log_path: Option<PathBuf>,
}

/// Supervises the proxy core child process.
pub struct CoreHost {
    binary: String,
    args: Vec<String>,
    state: Mutex<CoreState>,
}

impl CoreHost {
    pub fn new(binary: &str, args: Vec<String>) -> Self {
        Self {
            binary: binary.to_string(),
            args,
            state: Mutex::new(CoreState::default()),
        }
    }

    /// Write `config` into `cache_dir` and launch the core on it, replacing
    /// any core already running.
    pub async fn start_core(&self, core_name: &str, config: &str, cache_dir: &Path) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            debug!("Replacing running core");
            terminate(&mut child).await;
        }

        tokio::fs::create_dir_all(cache_dir).await?;
        let name = if core_name.is_empty() { "core" } else { core_name };
        let config_path = cache_dir.join(format!("{name}.json"));
        tokio::fs::write(&config_path, config).await?;

        let log_path = cache_dir.join(LOG_FILE);
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let placeholders = Placeholders::new().config(&config_path).cache_dir(cache_dir);
        let line = CommandLine::build("core", &self.binary, &self.args, &placeholders)
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;

        let child = Command::new(&line.program)
            .args(&line.args)
            .current_dir(cache_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlatformError::Other(format!("Failed to spawn {}: {}", line.program, e)))?;

        info!(core = name, pid = child.id(), "Started proxy core");
        state.child = Some(child);
        state.log_path = Some(log_path);
        Ok(())
    }

    /// Returns whether a core was running.
    pub async fn stop_core(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.child.take() {
            Some(mut child) => {
                terminate(&mut child).await;
                info!("Stopped proxy core");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        let exited = match state.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => false,
            Some(Ok(Some(status))) => {
                warn!("Proxy core exited with {}", status);
                true
            }
            Some(Err(e)) => {
                error!("Failed to poll proxy core: {}", e);
                true
            }
            None => return false,
        };

        if exited {
            state.child = None;
        }
        !exited
    }

    pub async fn version(&self) -> Option<String> {
        match run_command(&self.binary, &["version"]).await {
            Ok(output) => output.lines().next().map(|line| line.trim().to_string()),
            Err(e) => {
                warn!("Could not read core version: {}", e);
                None
            }
        }
    }

    pub async fn fetch_logs(&self) -> String {
        let Some(path) = self.state.lock().await.log_path.clone() else {
            return String::new();
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!("No core log at {}: {}", path.display(), e);
                String::new()
            }
        }
    }

    pub async fn clear_logs(&self) -> bool {
        let Some(path) = self.state.lock().await.log_path.clone() else {
            return true;
        };
        let truncated = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_len(0));
        match truncated {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to clear core log: {}", e);
                false
            }
        }
    }

    /// Connect latency in milliseconds for each comma separated URL, -1 where
    /// the host could not be reached.
    pub async fn measure_ping(&self, urls: &str) -> String {
        let mut report = BTreeMap::new();
        for url in urls.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            report.insert(url.to_string(), ping(url).await);
        }
        serde_json::to_string(&report).unwrap_or_default()
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Core already gone: {}", e);
    }
}

/// `host:port` for a URL, defaulting the port from the scheme. A bare
/// `host[:port]` is read as https.
pub(crate) fn ping_target(url: &str) -> Option<String> {
    let parsed = if url.contains("://") {
        Url::parse(url)
    } else {
        Url::parse(&format!("https://{url}"))
    };
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Cannot ping {}: {}", url, e);
            return None;
        }
    };

    let host = parsed.host_str().filter(|host| !host.is_empty())?;
    let port = parsed.port_or_known_default().unwrap_or(443);
    Some(format!("{host}:{port}"))
}

async fn ping(url: &str) -> i64 {
    let Some(target) = ping_target(url) else {
        return -1;
    };

    let started = Instant::now();
    match timeout(PING_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(_)) => started.elapsed().as_millis() as i64,
        Ok(Err(e)) => {
            debug!("Ping to {} failed: {}", target, e);
            -1
        }
        Err(_) => -1,
    }
}

fn flag(value: bool) -> Option<String> {
    Some(value.to_string())
}

#[async_trait]
impl CommandHandler for CoreHost {
    async fn handle(&self, command: ControlCommand, request: &ControlRequest) -> Option<String> {
        match command {
            ControlCommand::IsCoreRunning => flag(self.is_running().await),
            ControlCommand::MeasurePing => {
                Some(self.measure_ping(request.field("urls").unwrap_or_default()).await)
            }
            ControlCommand::FetchLogs => Some(self.fetch_logs().await),
            ControlCommand::ClearLogs => flag(self.clear_logs().await),
            ControlCommand::GetVersion => self.version().await,
            ControlCommand::SimpleStartCore => {
                let core_name = request.field("coreName").unwrap_or_default();
                let Some(config) = request.field("config") else {
                    warn!("SIMPLE_START_CORE without a config");
                    return Some("ERROR_CORE: missing config".to_string());
                };
                let cache_dir = match request.field("cacheDir") {
                    Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                    _ => std::env::temp_dir().join("proxycore"),
                };

                match self.start_core(core_name, config, &cache_dir).await {
                    Ok(()) => flag(true),
                    Err(e) => {
                        error!("Failed to start core: {}", e);
                        Some(format!("ERROR_CORE: {e}"))
                    }
                }
            }
            ControlCommand::SimpleStopCore => flag(self.stop_core().await),
        }
    }
}
