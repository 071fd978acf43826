//! Shared utilities for proxycore components.
//!
//! Configuration loading and logging initialisation used by both the session
//! library and the daemon.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{AddressingProfile, Config, ConfigError, StartMode};
