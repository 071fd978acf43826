//! Error types for the session controller.

use crate::platform::PlatformError;
use proxycore_ipc::IpcError;
use std::time::Duration;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Error types surfaced by the session controller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The user declined, or could not be asked for, VPN consent
    #[error("VPN permission denied")]
    PermissionDenied,

    /// A consent request is already waiting on the user
    #[error("A VPN permission request is already in progress")]
    NegotiationInProgress,

    /// No tunnel provider profile has been persisted yet
    #[error("Tunnel provider profile is not initialized")]
    ManagerNotInitialized,

    /// No control channel session is established with the tunnel
    #[error("No control channel session is established")]
    InvalidSession,

    /// A session is already running or in transition
    #[error("A VPN session is already running")]
    AlreadyRunning,

    /// The virtual interface could not be brought up
    #[error("Failed to establish interface: {0}")]
    EstablishmentFailed(String),

    /// A message or configuration record could not be encoded
    #[error("Failed to encode message: {0}")]
    MessageEncodingFailed(String),

    /// Session configuration rejected at construction
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The tunnel did not answer a control request in time
    #[error("Control request timed out after {0:?}")]
    ControlTimeout(Duration),

    /// Control channel transport error
    #[error("Control channel error: {0}")]
    Control(IpcError),

    /// Platform capability error
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl From<IpcError> for SessionError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Encoding(e) => SessionError::MessageEncodingFailed(e.to_string()),
            other => SessionError::Control(other),
        }
    }
}
