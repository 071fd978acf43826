//! Type definitions shared across the session controller.

use serde::{Deserialize, Serialize};
use shared_utils::AddressingProfile;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Lifecycle state of the VPN session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session and no interface
    Idle,
    /// Waiting on VPN consent
    Negotiating,
    /// Interface and tunnel being brought up
    Establishing,
    /// Tunnel up, interface handle held
    Running,
    /// Teardown requested
    Stopping,
    /// The system withdrew the tunnel; cleanup in progress
    Revoked,
}

impl SessionState {
    /// States in which a new start must be refused.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Running | SessionState::Establishing | SessionState::Stopping
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Establishing => "establishing",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// Cached result of the VPN consent flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Pending,
    Granted,
    Denied,
}

/// Tunnel status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformStatus {
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
}

impl PlatformStatus {
    /// A tunnel exists or is on its way up.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PlatformStatus::Connected | PlatformStatus::Connecting | PlatformStatus::Reasserting
        )
    }

    /// Nothing left for a new tunnel to collide with.
    pub fn is_settled(&self) -> bool {
        matches!(self, PlatformStatus::Disconnected | PlatformStatus::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformStatus::Invalid => "invalid",
            PlatformStatus::Disconnected => "disconnected",
            PlatformStatus::Connecting => "connecting",
            PlatformStatus::Connected => "connected",
            PlatformStatus::Reasserting => "reasserting",
            PlatformStatus::Disconnecting => "disconnecting",
        }
    }

    /// Parse a platform status name; anything unrecognised is `Invalid`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "disconnected" => PlatformStatus::Disconnected,
            "connecting" => PlatformStatus::Connecting,
            "connected" => PlatformStatus::Connected,
            "reasserting" => PlatformStatus::Reasserting,
            "disconnecting" => PlatformStatus::Disconnecting,
            _ => PlatformStatus::Invalid,
        }
    }
}

/// Canonical status delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Disconnecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Disconnecting => "disconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == ConnectionStatus::Connected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PlatformStatus> for ConnectionStatus {
    fn from(status: PlatformStatus) -> Self {
        match status {
            PlatformStatus::Connected => ConnectionStatus::Connected,
            PlatformStatus::Connecting | PlatformStatus::Reasserting => ConnectionStatus::Connecting,
            PlatformStatus::Disconnecting => ConnectionStatus::Disconnecting,
            PlatformStatus::Disconnected | PlatformStatus::Invalid => {
                ConnectionStatus::Disconnected
            }
        }
    }
}

/// An address with its prefix length, e.g. `198.18.0.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    /// Returns `None` when the prefix is longer than the address family allows.
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    const fn v4(addr: Ipv4Addr, prefix: u8) -> Self {
        Self {
            addr: IpAddr::V4(addr),
            prefix,
        }
    }

    const fn v6(addr: Ipv6Addr, prefix: u8) -> Self {
        Self {
            addr: IpAddr::V6(addr),
            prefix,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// A `/0` route covering the whole address family.
    pub fn is_default_route(&self) -> bool {
        self.prefix == 0
    }

    /// Dotted netmask for IPv4 prefixes.
    pub fn ipv4_netmask(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(_) => {
                let bits = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                Some(Ipv4Addr::from(bits))
            }
            IpAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid CIDR {}: missing prefix length", s))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("Invalid IP address {}: {}", addr, e))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("Invalid prefix length {}: {}", prefix, e))?;

        IpCidr::new(addr, prefix).ok_or_else(|| format!("Invalid prefix length: {}", prefix))
    }
}

/// Address, resolver and route set given to the virtual interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddressing {
    pub ipv4: IpCidr,
    pub ipv6: IpCidr,
    pub dns: Vec<IpAddr>,
}

impl InterfaceAddressing {
    pub fn for_profile(profile: AddressingProfile) -> Self {
        match profile {
            AddressingProfile::Tunnel => Self {
                ipv4: IpCidr::v4(Ipv4Addr::new(198, 18, 0, 1), 24),
                ipv6: IpCidr::v6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 1), 64),
                dns: vec![
                    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                ],
            },
            AddressingProfile::Client => Self {
                ipv4: IpCidr::v4(Ipv4Addr::new(172, 19, 0, 1), 24),
                ipv6: IpCidr::v6(Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 1), 128),
                dns: vec![
                    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                    IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
                    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
                    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1001)),
                ],
            },
        }
    }
}

/// What the guard asks the platform for when bringing the interface up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub session_name: String,
    pub mtu: u32,
    pub ipv4: IpCidr,
    pub ipv6: IpCidr,
    pub dns: Vec<IpAddr>,
    pub routes: Vec<IpCidr>,
}

impl InterfaceRequest {
    /// A request routing both address families through the interface.
    pub fn new(session_name: impl Into<String>, mtu: u32, addressing: InterfaceAddressing) -> Self {
        Self {
            session_name: session_name.into(),
            mtu,
            ipv4: addressing.ipv4,
            ipv6: addressing.ipv6,
            dns: addressing.dns,
            routes: vec![
                IpCidr::v4(Ipv4Addr::UNSPECIFIED, 0),
                IpCidr::v6(Ipv6Addr::UNSPECIFIED, 0),
            ],
        }
    }
}
