//! Tunnel-side control listener
//!
//! The tunnel process binds a [`ControlServer`] and hands it a
//! [`CommandHandler`]. Each accepted connection carries one request. Requests
//! that cannot be decoded, lack a command, or name a command the handler does
//! not know are answered with no response.

use crate::messages::{ControlCommand, ControlRequest};
use crate::transport::{read_frame, write_frame, IpcError, IpcResult, DEFAULT_IO_TIMEOUT};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Dispatch target for decoded control requests.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: ControlCommand, request: &ControlRequest) -> Option<String>;
}

/// Which peers may talk to the control socket.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allowed_uids: HashSet<u32>,
    allow_root: bool,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        let mut allowed_uids = HashSet::new();
        allowed_uids.insert(nix::unistd::getuid().as_raw());

        // The controlling user when launched through sudo
        if let Ok(uid) = std::env::var("SUDO_UID") {
            if let Ok(uid) = uid.parse::<u32>() {
                allowed_uids.insert(uid);
            }
        }

        Self {
            allowed_uids,
            allow_root: true,
        }
    }
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a specific UID
    pub fn allow_uid(mut self, uid: u32) -> Self {
        self.allowed_uids.insert(uid);
        self
    }

    /// Set whether root is always allowed
    pub fn allow_root(mut self, allow: bool) -> Self {
        self.allow_root = allow;
        self
    }

    pub fn is_allowed(&self, uid: u32) -> bool {
        (self.allow_root && uid == 0) || self.allowed_uids.contains(&uid)
    }
}

#[cfg(target_os = "linux")]
fn peer_uid(stream: &UnixStream) -> io::Result<u32> {
    use std::os::unix::io::AsRawFd;

    nix::sys::socket::getsockopt(stream.as_raw_fd(), nix::sys::socket::sockopt::PeerCredentials)
        .map(|creds| creds.uid())
        .map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn peer_uid(stream: &UnixStream) -> io::Result<u32> {
    stream.peer_cred().map(|cred| cred.uid())
}

/// Unix domain socket listener serving control requests.
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    policy: AccessPolicy,
    io_timeout: Duration,
}

impl ControlServer {
    /// Bind with the default access policy
    pub async fn bind<P: AsRef<Path>>(path: P) -> IpcResult<Self> {
        Self::bind_with_policy(path, AccessPolicy::default()).await
    }

    pub async fn bind_with_policy<P: AsRef<Path>>(path: P, policy: AccessPolicy) -> IpcResult<Self> {
        let path = path.as_ref();

        // A stale socket from a previous run would make bind fail
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(path)?.permissions();
            permissions.set_mode(0o660);
            std::fs::set_permissions(path, permissions)?;
        }

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
            policy,
            io_timeout: DEFAULT_IO_TIMEOUT,
        })
    }

    /// Override the per-operation I/O timeout
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn serve(
        self,
        handler: Arc<dyn CommandHandler>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> IpcResult<()> {
        info!("Control server listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("Failed to accept control connection: {}", e);
                            continue;
                        }
                    };

                    let handler = Arc::clone(&handler);
                    let policy = self.policy.clone();
                    let io_timeout = self.io_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler, &policy, io_timeout).await {
                            warn!("Control connection ended with error: {}", e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Control server shutting down");
                    break;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Could not remove control socket: {}", e);
        }

        Ok(())
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    handler: Arc<dyn CommandHandler>,
    policy: &AccessPolicy,
    io_timeout: Duration,
) -> IpcResult<()> {
    let uid = peer_uid(&stream).map_err(|e| {
        IpcError::Authentication(format!("Failed to get peer credentials: {}", e))
    })?;

    if !policy.is_allowed(uid) {
        return Err(IpcError::Authentication(format!(
            "Connection from unauthorized user: UID={}",
            uid
        )));
    }

    let reply = match read_frame(&mut stream, io_timeout).await? {
        Some(payload) => dispatch(&payload, handler.as_ref()).await,
        None => None,
    };

    write_frame(&mut stream, reply.as_deref().map(str::as_bytes), io_timeout).await
}

async fn dispatch(payload: &[u8], handler: &dyn CommandHandler) -> Option<String> {
    let request = match ControlRequest::decode(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping undecodable control request: {}", e);
            return None;
        }
    };

    match request.command() {
        Some(command) => {
            debug!("Dispatching control command {}", command);
            handler.handle(command, &request).await
        }
        None => {
            warn!("Unknown control command: {}", request.command_name());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_policy() {
        let policy = AccessPolicy::new().allow_root(false).allow_uid(4242);
        assert!(policy.is_allowed(4242));
        assert!(!policy.is_allowed(u32::MAX - 1));
        assert!(policy.is_allowed(nix::unistd::getuid().as_raw()));

        let policy = AccessPolicy::new().allow_root(true);
        assert!(policy.is_allowed(0));
    }
}
