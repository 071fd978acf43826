//! Configuration for the tun-to-socks bridge that feeds the interface into
//! the core's local SOCKS listener.

use crate::config::ProviderConfiguration;
use crate::error::{SessionError, SessionResult};
use crate::types::InterfaceAddressing;
use serde::Serialize;
use std::net::IpAddr;

pub const TASK_STACK_SIZE: u32 = 20480;
pub const TCP_BUFFER_SIZE: u32 = 4096;
pub const CONNECT_TIMEOUT_MS: u32 = 5000;
pub const READ_WRITE_TIMEOUT_MS: u32 = 60000;
pub const LOG_LEVEL: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSection {
    pub mtu: u32,
    pub ipv4: IpAddr,
    pub ipv6: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Socks5Section {
    pub port: u16,
    pub address: String,
    pub udp: String,
    pub pipeline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiscSection {
    pub task_stack_size: u32,
    pub tcp_buffer_size: u32,
    pub connect_timeout: u32,
    pub read_write_timeout: u32,
    pub log_file: String,
    pub log_level: String,
}

impl Default for MiscSection {
    fn default() -> Self {
        Self {
            task_stack_size: TASK_STACK_SIZE,
            tcp_buffer_size: TCP_BUFFER_SIZE,
            connect_timeout: CONNECT_TIMEOUT_MS,
            read_write_timeout: READ_WRITE_TIMEOUT_MS,
            log_file: "stderr".to_string(),
            log_level: LOG_LEVEL.to_string(),
        }
    }
}

/// The bridge's YAML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeConfig {
    pub tunnel: TunnelSection,
    pub socks5: Socks5Section,
    pub misc: MiscSection,
}

impl BridgeConfig {
    pub fn new(provider: &ProviderConfiguration, addressing: &InterfaceAddressing) -> Self {
        Self {
            tunnel: TunnelSection {
                mtu: provider.mtu,
                ipv4: addressing.ipv4.addr(),
                ipv6: addressing.ipv6.addr(),
            },
            socks5: Socks5Section {
                port: provider.port,
                address: provider.address.clone(),
                udp: "udp".to_string(),
                pipeline: true,
            },
            misc: MiscSection::default(),
        }
    }

    pub fn render(&self) -> SessionResult<String> {
        serde_yaml::to_string(self).map_err(|e| SessionError::MessageEncodingFailed(e.to_string()))
    }
}
