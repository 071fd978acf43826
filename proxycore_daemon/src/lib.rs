//! proxycore daemon
//!
//! Linux backends for the session controller: a TUN interface allocator, a
//! tunnel provider that runs the proxy core and the tun-to-socks bridge as
//! child processes, JSON persistence of the provider profile, and the signal
//! sources that feed session events.

pub mod launch;
pub mod platform;
pub mod profile_store;
pub mod wake_monitor;

pub use platform::{LinuxPlatform, ProcessTunnelProvider, TunAllocator};
pub use profile_store::ProfileStore;
