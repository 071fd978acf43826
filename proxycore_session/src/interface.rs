//! Virtual interface lifecycle.
//!
//! The guard holds at most one interface at a time and tracks who is
//! responsible for closing its descriptor. Once the descriptor has been
//! detached and handed to the tunnel provider, cleanup must not close it a
//! second time.

use crate::error::{SessionError, SessionResult};
use crate::platform::{InterfaceAllocator, InterfaceWrapper};
use crate::types::{InterfaceRequest, SessionState};
use nix::fcntl::{fcntl, FcntlArg};
use serde::Serialize;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Who closes the interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorOwner {
    /// Still owned by the platform wrapper held here
    Local,
    /// Detached and handed to the tunnel provider
    Transferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Absent,
    Establishing,
    Active,
    Closing,
}

/// The live interface.
struct InterfaceHandle {
    descriptor: RawFd,
    owner: DescriptorOwner,
    created_at: SystemTime,
    wrapper: Box<dyn InterfaceWrapper>,
}

/// Read-only view of the live interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub descriptor: RawFd,
    pub owner: DescriptorOwner,
    pub created_at: SystemTime,
}

impl InterfaceInfo {
    pub fn is_detached(&self) -> bool {
        self.owner == DescriptorOwner::Transferred
    }
}

/// Whether `fd` currently names an open descriptor in this process.
///
/// Only the number is checked. Once the provider closes the interface, the
/// kernel may hand the same number to an unrelated open, and a reused number
/// reads as open. Callers treat a `true` here as "not known dead"; the
/// platform status and the `IS_CORE_RUNNING` check in reconciliation cover
/// the rest.
fn descriptor_is_open(fd: RawFd) -> bool {
    fd > 0 && fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Owns the virtual interface for one controller.
pub struct InterfaceGuard {
    allocator: Arc<dyn InterfaceAllocator>,
    handle: Option<InterfaceHandle>,
    phase: GuardPhase,
}

impl InterfaceGuard {
    pub fn new(allocator: Arc<dyn InterfaceAllocator>) -> Self {
        Self {
            allocator,
            handle: None,
            phase: GuardPhase::Absent,
        }
    }

    pub fn phase(&self) -> GuardPhase {
        self.phase
    }

    pub fn info(&self) -> Option<InterfaceInfo> {
        self.handle.as_ref().map(|handle| InterfaceInfo {
            descriptor: handle.descriptor,
            owner: handle.owner,
            created_at: handle.created_at,
        })
    }

    pub fn is_detached(&self) -> bool {
        self.info().is_some_and(|info| info.is_detached())
    }

    /// Bring up a fresh interface and detach its descriptor.
    ///
    /// Any interface already held is cleaned up first. On success the
    /// returned descriptor carries close responsibility to the caller.
    pub async fn establish(
        &mut self,
        request: &InterfaceRequest,
        excluded_application: Option<&str>,
    ) -> SessionResult<OwnedFd> {
        if self.handle.is_some() {
            info!("Replacing existing interface before establishing a new one");
            self.cleanup();
        }

        self.phase = GuardPhase::Establishing;

        if let Some(application_id) = excluded_application {
            if let Err(e) = self.allocator.exclude_application(application_id).await {
                warn!(application_id, "Could not exclude application from tunnel: {}", e);
            }
        }

        let wrapper = match self.allocator.establish(request).await {
            Ok(wrapper) => wrapper,
            Err(e) => {
                self.phase = GuardPhase::Absent;
                return Err(SessionError::EstablishmentFailed(e.to_string()));
            }
        };

        let descriptor = wrapper.raw_fd();
        self.handle = Some(InterfaceHandle {
            descriptor,
            owner: DescriptorOwner::Local,
            created_at: SystemTime::now(),
            wrapper,
        });

        if descriptor <= 0 {
            self.cleanup();
            return Err(SessionError::EstablishmentFailed(format!(
                "platform returned invalid descriptor {}",
                descriptor
            )));
        }

        let detached = self.handle.as_mut().and_then(|handle| handle.wrapper.detach());
        let Some(fd) = detached else {
            self.cleanup();
            return Err(SessionError::EstablishmentFailed(
                "interface descriptor could not be detached".into(),
            ));
        };

        if let Some(handle) = self.handle.as_mut() {
            handle.owner = DescriptorOwner::Transferred;
            handle.descriptor = fd.as_raw_fd();
        }
        self.phase = GuardPhase::Active;

        info!(
            session = %request.session_name,
            fd = fd.as_raw_fd(),
            mtu = request.mtu,
            ipv4 = %request.ipv4,
            ipv6 = %request.ipv6,
            "Interface established"
        );
        Ok(fd)
    }

    /// Release the interface. Safe to call in any phase, any number of times.
    pub fn cleanup(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            self.phase = GuardPhase::Absent;
            return;
        };

        self.phase = GuardPhase::Closing;
        match handle.owner {
            DescriptorOwner::Local => {
                if let Err(e) = handle.wrapper.close() {
                    error!(fd = handle.descriptor, "Failed to close interface: {}", e);
                } else {
                    debug!(fd = handle.descriptor, "Closed interface descriptor");
                }
            }
            DescriptorOwner::Transferred => {
                debug!(
                    fd = handle.descriptor,
                    "Descriptor belongs to the tunnel provider; not closing"
                );
            }
        }

        self.phase = GuardPhase::Absent;
    }

    /// Whether the session really has a working interface. A closed
    /// descriptor is caught, but not one whose number was since reused (see
    /// [`descriptor_is_open`]).
    pub fn is_actually_live(&self, state: SessionState) -> bool {
        state == SessionState::Running
            && self
                .handle
                .as_ref()
                .is_some_and(|handle| descriptor_is_open(handle.descriptor))
    }
}

impl Drop for InterfaceGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
