//! mDNS-SD lookup of the coordinator.
//!
//! The coordinator advertises `_syncam-coord._tcp.local.` so an agent
//! without `COORDINATOR_URL` can build the websocket URL from the first
//! answer.  Agents advertise `_syncam-agent._tcp.local.` (port 0) purely
//! so they show up in service browsers.  Instances are numbered
//! `<prefix>-NN`, taking the lowest number nobody else answers with.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

/// Scan before picking an instance number.
const NUMBERING_SCAN: Duration = Duration::from_secs(2);

/// Websocket path of the coordinator channel.
const CHANNEL_PATH: &str = "/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Coordinator,
    Agent,
}

impl ServiceRole {
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::Coordinator => "_syncam-coord._tcp.local.",
            Self::Agent => "_syncam-agent._tcp.local.",
        }
    }

    /// Instance names are `<prefix>-NN`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Agent => "agent",
        }
    }
}

/// A resolved service instance.
#[derive(Debug, Clone)]
pub struct Peer {
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl Peer {
    /// Routable IPv4 first; loopback and IPv6 only as a fallback.
    fn best_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4() && !a.is_loopback())
            .or_else(|| self.addresses.iter().find(|a| a.is_ipv4()))
            .or_else(|| self.addresses.first())
            .copied()
    }

    pub fn ws_url(&self) -> Option<String> {
        let host = match self.best_address()? {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        Some(format!("ws://{host}:{}{CHANNEL_PATH}", self.port))
    }
}

/// Keeps our own advertisement alive.
pub struct DiscoveryHandle {
    daemon: ServiceDaemon,
    fullname: String,
}

impl DiscoveryHandle {
    /// Every instance of `role` answering within `timeout`, except us.
    pub fn discover_peers(&self, role: ServiceRole, timeout: Duration) -> Vec<Peer> {
        let mut peers = Vec::new();
        let browsed = browse(&self.daemon, role, timeout, |fullname, peer| {
            if fullname == self.fullname {
                return;
            }
            debug!("mDNS: {} at {:?}:{}", peer.instance_name, peer.addresses, peer.port);
            peers.push(peer);
        });
        if let Err(e) = browsed {
            warn!("mDNS browse for {} failed: {e:#}", role.service_type());
        }
        peers
    }

    /// Websocket URL of the lowest-numbered coordinator on the network.
    pub fn find_coordinator(&self, timeout: Duration) -> Option<String> {
        let mut peers = self.discover_peers(ServiceRole::Coordinator, timeout);
        peers.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        peers.iter().find_map(Peer::ws_url)
    }

    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// Feed every resolved instance of `role` (full name, peer) to
/// `on_resolved` until `timeout`.
fn browse(
    daemon: &ServiceDaemon,
    role: ServiceRole,
    timeout: Duration,
    mut on_resolved: impl FnMut(&str, Peer),
) -> Result<()> {
    let receiver = daemon
        .browse(role.service_type())
        .context("Cannot browse mDNS")?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let fullname = info.get_fullname();
                let peer = Peer {
                    instance_name: instance_of(fullname).to_string(),
                    addresses: info.get_addresses().iter().map(|a| a.to_ip_addr()).collect(),
                    port: info.get_port(),
                };
                on_resolved(fullname, peer);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = daemon.stop_browse(role.service_type());
    Ok(())
}

/// Advertise this node as `role` on `port`.
pub fn register(role: ServiceRole, port: u16) -> Result<DiscoveryHandle> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;

    let mut taken = BTreeSet::new();
    browse(&daemon, role, NUMBERING_SCAN, |fullname, _| {
        if let Some(n) = instance_number(fullname, role.prefix()) {
            taken.insert(n);
        }
    })?;
    let instance_name = format!("{}-{:02}", role.prefix(), lowest_free(&taken));

    let service = ServiceInfo::new(
        role.service_type(),
        &instance_name,
        &format!("{instance_name}.local."),
        "",
        port,
        None,
    )
    .context("Cannot build mDNS service info")?
    .enable_addr_auto();
    let fullname = service.get_fullname().to_string();

    daemon
        .register(service)
        .context("Cannot register mDNS service")?;
    info!("mDNS: advertising {instance_name} ({}, port {port})", role.service_type());

    Ok(DiscoveryHandle { daemon, fullname })
}

/// `agent-07._syncam-agent._tcp.local.` → `agent-07`
fn instance_of(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

/// Number of a `<prefix>-NN` instance, `None` for foreign names.
fn instance_number(fullname: &str, prefix: &str) -> Option<u32> {
    instance_of(fullname)
        .strip_prefix(prefix)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

fn lowest_free(taken: &BTreeSet<u32>) -> u32 {
    (1..).find(|n| !taken.contains(n)).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn peer(addresses: Vec<IpAddr>) -> Peer {
        Peer {
            instance_name: "coordinator-01".into(),
            addresses,
            port: 8090,
        }
    }

    #[test]
    fn test_instance_numbering() {
        assert_eq!(
            instance_number("coordinator-03._syncam-coord._tcp.local.", "coordinator"),
            Some(3)
        );
        assert_eq!(instance_number("agent-01._syncam-agent._tcp.local.", "coordinator"), None);
        assert_eq!(instance_number("agent-x._syncam-agent._tcp.local.", "agent"), None);
        assert_eq!(instance_of("agent-07._syncam-agent._tcp.local."), "agent-07");

        assert_eq!(lowest_free(&BTreeSet::new()), 1);
        assert_eq!(lowest_free(&[1, 2, 4].into()), 3);
    }

    #[test]
    fn test_ws_url_address_preference() {
        let lan = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);

        assert_eq!(
            peer(vec![v6, lo, lan]).ws_url().as_deref(),
            Some("ws://10.0.0.5:8090/ws")
        );
        assert_eq!(peer(vec![v6, lo]).ws_url().as_deref(), Some("ws://127.0.0.1:8090/ws"));
        assert_eq!(peer(vec![v6]).ws_url().as_deref(), Some("ws://[::1]:8090/ws"));
        assert!(peer(vec![]).ws_url().is_none());
    }
}
