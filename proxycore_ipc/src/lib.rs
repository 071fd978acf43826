//! proxycore control channel protocol
//!
//! This crate defines the narrow textual protocol spoken between the session
//! controller and the tunnel process that hosts the proxy core: the command
//! vocabulary, the flat string-map request encoding, the transport trait the
//! controller talks through, a Unix domain socket client, and the tunnel-side
//! listener that dispatches commands to a handler.

pub mod messages;
pub mod server;
pub mod transport;

/// Re-export common types for convenience
pub use messages::{response, ControlCommand, ControlRequest};
pub use server::{AccessPolicy, CommandHandler, ControlServer};
pub use transport::{IpcError, IpcResult, ProviderSession, UnixSocketSession};
