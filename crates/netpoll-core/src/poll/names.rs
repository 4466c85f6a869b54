// ── Node name resolution ──
//
// Reverse DNS first, then what the node says about itself. Lookups go
// through a `NameResolver` so tests never touch the system resolver.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use dns_lookup::{lookup_addr, lookup_host};
use netpoll_transport::SnmpTransport;
use tracing::{debug, info, warn};

use super::session::{AgentLease, open_snmp};
use super::Engine;
use crate::model::{Node, Protocol};

const SYS_NAME: &str = ".1.3.6.1.2.1.1.5.0";
const AGENT_HOSTNAME: &str = "System.Hostname";

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Host name for an address; `None` when there is none.
    async fn reverse(&self, ip: IpAddr) -> Option<String>;

    /// First address a host name resolves to.
    async fn forward(&self, name: &str) -> Option<IpAddr>;
}

/// System resolver, run on the blocking pool with a timeout.
#[derive(Debug, Clone, Copy)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl NameResolver for DnsResolver {
    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        let lookup = tokio::task::spawn_blocking(move || lookup_addr(&ip).ok());
        match tokio::time::timeout(self.timeout, lookup).await {
            // A resolver echoing the address back has no name for it.
            Ok(Ok(Some(name))) if name != ip.to_string() => Some(name),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(%ip, error = %e, "reverse lookup task failed");
                None
            }
            Err(_) => {
                debug!(%ip, "reverse lookup timed out");
                None
            }
        }
    }

    async fn forward(&self, name: &str) -> Option<IpAddr> {
        let host = name.to_owned();
        let lookup = tokio::task::spawn_blocking(move || lookup_host(&host).ok());
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Some(addrs))) => addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied(),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(host = name, error = %e, "forward lookup task failed");
                None
            }
            Err(_) => {
                debug!(host = name, "forward lookup timed out");
                None
            }
        }
    }
}

/// Cut a resolved name down to its host part unless full names are
/// wanted. Literal addresses are left alone.
pub fn short_name(name: &str, use_fqdn: bool) -> String {
    let name = name.trim().trim_end_matches('.');
    if use_fqdn || name.parse::<IpAddr>().is_ok() {
        return name.to_owned();
    }
    name.split('.').next().unwrap_or(name).to_owned()
}

async fn from_dns(engine: &Engine, primary: IpAddr, interfaces: &[IpAddr]) -> Option<String> {
    if let Some(name) = engine.resolver.reverse(primary).await {
        return Some(name);
    }
    for &ip in interfaces.iter().filter(|&&ip| ip != primary && !ip.is_loopback()) {
        if let Some(name) = engine.resolver.reverse(ip).await {
            return Some(name);
        }
    }
    None
}

async fn from_node(engine: &Engine, node: &Node) -> Option<String> {
    let (agent, snmp) = node.read(|d| {
        (
            d.protocol_enabled(Protocol::Agent),
            d.protocol_enabled(Protocol::Snmp),
        )
    });
    if agent && engine.transports.agent.is_some() {
        if let Ok(mut lease) = AgentLease::acquire(engine, node).await {
            match lease.get_parameter(AGENT_HOSTNAME).await {
                Ok(name) if !name.trim().is_empty() => return Some(name.trim().to_owned()),
                Ok(_) => {}
                Err(e) => debug!(node_id = node.id(), error = %e, "agent host name unavailable"),
            }
        }
    }
    if snmp {
        if let Some(transport) = open_snmp(engine, node, None) {
            return sys_name(transport.as_ref()).await;
        }
    }
    None
}

async fn sys_name(transport: &dyn SnmpTransport) -> Option<String> {
    let name = transport.get(SYS_NAME).await.ok()?.as_text();
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

/// Apply the naming policy of the configuration poll.
///
/// A node named after one of its own interface addresses is renamed
/// from DNS or, failing that, from what its agent or SNMP report. With
/// DNS sync enabled, every node follows its reverse DNS entry. Returns
/// `true` if the name changed.
pub(crate) async fn resolve_name(engine: &Engine, node: &Node) -> bool {
    let settings = &engine.config.names;
    let (current, primary, interfaces) = node.read(|d| {
        let interfaces: Vec<IpAddr> = d.interfaces.iter().filter_map(|i| i.ip()).collect();
        (d.name.clone(), d.primary_ip, interfaces)
    });

    let named_by_own_ip = current
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip == primary || interfaces.contains(&ip));

    let resolved = if named_by_own_ip && settings.resolve_by_ip {
        match from_dns(engine, primary, &interfaces).await {
            Some(name) => Some(name),
            None => from_node(engine, node).await,
        }
    } else if settings.sync_with_dns {
        from_dns(engine, primary, &interfaces).await
    } else {
        return false;
    };

    let Some(resolved) = resolved else {
        debug!(node_id = node.id(), "unable to resolve node name");
        return false;
    };
    let name = short_name(&resolved, settings.use_fqdn);
    if name.is_empty() || name == current {
        return false;
    }
    info!(node_id = node.id(), old = %current, new = %name, "node name resolved");
    node.update(|d| d.name = name);
    true
}
