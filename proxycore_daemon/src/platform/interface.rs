//! TUN interface allocation.

use super::run_command;
use async_trait::async_trait;
use nix::unistd::User;
use proxycore_session::{
    InterfaceAllocator, InterfaceRequest, InterfaceWrapper, IpCidr, PlatformError, PlatformResult,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::{debug, info, warn};
use tun::{Configuration, Device, Layer};

/// Priority of the rule that keeps excluded traffic on the main table.
const EXCLUSION_RULE_PRIORITY: &str = "100";

/// Owns the descriptor of one TUN device until it is detached.
pub struct TunWrapper {
    name: String,
    fd: Option<OwnedFd>,
}

impl TunWrapper {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl InterfaceWrapper for TunWrapper {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1)
    }

    fn detach(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    fn close(&mut self) -> PlatformResult<()> {
        if let Some(fd) = self.fd.take() {
            debug!(interface = %self.name, fd = fd.as_raw_fd(), "Closing TUN device");
        }
        Ok(())
    }
}

/// Split `/0` routes into two halves so they win over the existing default
/// route without replacing it.
pub fn split_default_route(route: &IpCidr) -> Vec<IpCidr> {
    if !route.is_default_route() {
        return vec![*route];
    }

    let halves = if route.is_ipv4() {
        [
            IpCidr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1),
            IpCidr::new(IpAddr::V4(Ipv4Addr::new(128, 0, 0, 0)), 1),
        ]
    } else {
        [
            IpCidr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 1),
            IpCidr::new(IpAddr::V6(Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0)), 1),
        ]
    };
    halves.into_iter().flatten().collect()
}

/// Resolve an application identifier to the uid whose traffic is excluded.
fn resolve_uid(application_id: &str) -> PlatformResult<u32> {
    if let Ok(uid) = application_id.parse::<u32>() {
        return Ok(uid);
    }

    match User::from_name(application_id) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(PlatformError::Rejected(format!(
            "no user named {}",
            application_id
        ))),
        Err(e) => Err(PlatformError::Other(format!(
            "failed to look up user {}: {}",
            application_id, e
        ))),
    }
}

#[derive(Default)]
pub struct TunAllocator;

impl TunAllocator {
    pub fn new() -> Self {
        Self
    }

    async fn add_routes(&self, name: &str, request: &InterfaceRequest) -> PlatformResult<()> {
        for route in &request.routes {
            for destination in split_default_route(route) {
                let destination = destination.to_string();
                if route.is_ipv4() {
                    run_command("ip", &["route", "replace", &destination, "dev", name]).await?;
                } else if let Err(e) =
                    run_command("ip", &["-6", "route", "replace", &destination, "dev", name]).await
                {
                    warn!(interface = name, "IPv6 route {} not installed: {}", destination, e);
                }
            }
        }
        Ok(())
    }

    async fn configure_dns(&self, name: &str, request: &InterfaceRequest) {
        if request.dns.is_empty() {
            return;
        }

        let servers: Vec<String> = request.dns.iter().map(ToString::to_string).collect();
        let mut args = vec!["dns", name];
        args.extend(servers.iter().map(String::as_str));

        match run_command("resolvectl", &args).await {
            Ok(_) => {
                if let Err(e) = run_command("resolvectl", &["domain", name, "~."]).await {
                    warn!(interface = name, "Failed to route DNS queries to interface: {}", e);
                }
                info!(interface = name, ?servers, "Configured DNS servers");
            }
            Err(e) => warn!(interface = name, "DNS not configured: {}", e),
        }
    }
}

#[async_trait]
impl InterfaceAllocator for TunAllocator {
    async fn exclude_application(&self, application_id: &str) -> PlatformResult<()> {
        let uid = resolve_uid(application_id)?;
        let range = format!("{uid}-{uid}");

        for family in ["-4", "-6"] {
            // Drop a rule left from an earlier session before adding it again
            let _ = run_command(
                "ip",
                &[family, "rule", "del", "uidrange", &range, "lookup", "main", "priority", EXCLUSION_RULE_PRIORITY],
            )
            .await;
            run_command(
                "ip",
                &[family, "rule", "add", "uidrange", &range, "lookup", "main", "priority", EXCLUSION_RULE_PRIORITY],
            )
            .await?;
        }

        info!(application_id, uid, "Excluded application traffic from the tunnel");
        Ok(())
    }

    async fn establish(&self, request: &InterfaceRequest) -> PlatformResult<Box<dyn InterfaceWrapper>> {
        info!(
            "Creating TUN interface {} ({}, {}, mtu {})",
            request.session_name, request.ipv4, request.ipv6, request.mtu
        );

        let IpAddr::V4(address) = request.ipv4.addr() else {
            return Err(PlatformError::Rejected(format!(
                "interface IPv4 address {} is not IPv4",
                request.ipv4
            )));
        };
        let netmask = request.ipv4.ipv4_netmask().unwrap_or(Ipv4Addr::BROADCAST);

        let mut config = Configuration::default();
        config.name(&request.session_name);
        config.address(address);
        config.netmask(netmask);
        config.mtu(request.mtu as i32);
        config.layer(Layer::L3);
        config.up();
        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create(&config)
            .map_err(|e| PlatformError::Rejected(format!("Failed to create TUN device: {}", e)))?;
        let name = device.name().to_string();

        // SAFETY: the device is alive for the duration of the borrow
        let fd = unsafe { BorrowedFd::borrow_raw(device.as_raw_fd()) }.try_clone_to_owned()?;
        // The interface lives as long as any descriptor for it stays open
        drop(device);
        debug!(interface = %name, fd = fd.as_raw_fd(), "TUN device created");

        let ipv6 = request.ipv6.to_string();
        if let Err(e) = run_command("ip", &["-6", "addr", "add", &ipv6, "dev", &name]).await {
            warn!(interface = %name, "IPv6 address not assigned: {}", e);
        }

        self.add_routes(&name, request).await?;
        self.configure_dns(&name, request).await;

        Ok(Box::new(TunWrapper { name, fd: Some(fd) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes_are_split() {
        let v4: Vec<String> = split_default_route(&"0.0.0.0/0".parse().unwrap())
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(v4, vec!["0.0.0.0/1", "128.0.0.0/1"]);

        let v6: Vec<String> = split_default_route(&"::/0".parse().unwrap())
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(v6, vec!["::/1", "8000::/1"]);
    }

    #[test]
    fn test_specific_route_kept() {
        let route: IpCidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(split_default_route(&route), vec![route]);
    }

    #[test]
    fn test_numeric_application_id() {
        assert_eq!(resolve_uid("1000").unwrap(), 1000);
        assert_eq!(resolve_uid("root").unwrap(), 0);
    }

    #[test]
    fn test_wrapper_detach() {
        let file = tempfile::tempfile().unwrap();
        let mut wrapper = TunWrapper {
            name: "proxycore-vpn".into(),
            fd: Some(OwnedFd::from(file)),
        };

        assert!(wrapper.raw_fd() > 0);
        assert!(wrapper.detach().is_some());
        assert_eq!(wrapper.raw_fd(), -1);
        assert!(wrapper.close().is_ok());
        assert_eq!(wrapper.name(), "proxycore-vpn");
    }
}
