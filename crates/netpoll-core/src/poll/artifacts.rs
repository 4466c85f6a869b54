// ── Cached node artifacts ──
//
// Routing table, ARP cache, layer-2 neighbors and the agent parameter
// catalog. Each read returns the cached snapshot while it is fresh and
// refetches it otherwise; a failed refetch leaves the old one in place.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::{IpNetwork, ipv4_mask_to_prefix};
use netpoll_transport::snmp::oid_suffix;
use netpoll_transport::{
    ArpEntry, LinkNeighbor, MacAddress, ParameterInfo, RouteEntry, SnmpTransport, SnmpValue,
};
use tracing::debug;

use super::session::{AgentLease, open_snmp};
use super::Engine;
use crate::error::CoreError;
use crate::model::{Node, Protocol};

const IP_ROUTE_IF_INDEX: &str = ".1.3.6.1.2.1.4.21.1.2";
const IP_ROUTE_NEXT_HOP: &str = ".1.3.6.1.2.1.4.21.1.7";
const IP_ROUTE_TYPE: &str = ".1.3.6.1.2.1.4.21.1.8";
const IP_ROUTE_MASK: &str = ".1.3.6.1.2.1.4.21.1.11";
const IP_NET_TO_MEDIA_PHYS: &str = ".1.3.6.1.2.1.4.22.1.2";
const LLDP_REM_SYS_NAME: &str = ".1.3.6.1.0.8802.1.1.2.1.4.1.1.9";

fn unavailable(node: &Node, what: &str) -> CoreError {
    CoreError::CommFailure {
        node_id: node.id(),
        reason: format!("no transport could provide the {what}"),
    }
}

async fn walk_indexed(transport: &dyn SnmpTransport, root: &str) -> Result<Vec<(String, SnmpValue)>, CoreError> {
    let rows = transport
        .walk(root)
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    Ok(rows
        .into_iter()
        .filter_map(|(oid, value)| oid_suffix(&oid, root).map(|idx| (idx, value)))
        .collect())
}

fn as_ipv4(value: &SnmpValue) -> Option<Ipv4Addr> {
    match value {
        SnmpValue::IpAddress(ip) => Some(*ip),
        _ => None,
    }
}

fn as_u32(value: &SnmpValue) -> u32 {
    value.as_i64().and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

/// ipRouteTable, indexed by destination address.
async fn snmp_routes(transport: &dyn SnmpTransport) -> Result<Vec<RouteEntry>, CoreError> {
    let masks = walk_indexed(transport, IP_ROUTE_MASK).await?;
    let hops = walk_indexed(transport, IP_ROUTE_NEXT_HOP).await?;
    let ifs = walk_indexed(transport, IP_ROUTE_IF_INDEX).await?;
    let types = walk_indexed(transport, IP_ROUTE_TYPE).await?;

    let find = |rows: &[(String, SnmpValue)], idx: &str| rows.iter().find(|(i, _)| i == idx).map(|(_, v)| v.clone());
    let mut routes = Vec::new();
    for (idx, mask) in &masks {
        let Ok(destination) = idx.parse::<Ipv4Addr>() else { continue };
        let prefix = as_ipv4(mask).and_then(|m| ipv4_mask_to_prefix(m).ok()).unwrap_or(32);
        let Ok(network) = IpNetwork::new(IpAddr::V4(destination), prefix) else { continue };
        let next_hop = find(&hops, idx).as_ref().and_then(as_ipv4).unwrap_or(Ipv4Addr::UNSPECIFIED);
        routes.push(RouteEntry {
            destination: network,
            next_hop: IpAddr::V4(next_hop),
            if_index: find(&ifs, idx).as_ref().map_or(0, as_u32),
            route_type: find(&types, idx).as_ref().map_or(0, as_u32),
        });
    }
    Ok(routes)
}

/// ipNetToMediaTable, indexed by `ifIndex.a.b.c.d`.
async fn snmp_arp(transport: &dyn SnmpTransport) -> Result<Vec<ArpEntry>, CoreError> {
    Ok(walk_indexed(transport, IP_NET_TO_MEDIA_PHYS)
        .await?
        .into_iter()
        .filter_map(|(idx, value)| {
            let (if_index, address) = idx.split_once('.')?;
            Some(ArpEntry {
                address: address.parse().ok()?,
                mac: value.as_bytes().and_then(MacAddress::from_bytes)?,
                if_index: if_index.parse().ok()?,
            })
        })
        .collect())
}

/// lldpRemSysName, indexed by `timeMark.localPort.remIndex`.
async fn snmp_neighbors(transport: &dyn SnmpTransport) -> Result<Vec<LinkNeighbor>, CoreError> {
    Ok(walk_indexed(transport, LLDP_REM_SYS_NAME)
        .await?
        .into_iter()
        .filter_map(|(idx, value)| {
            let local_port = idx.split('.').nth(1)?.parse().ok()?;
            Some(LinkNeighbor {
                local_port,
                remote_system: value.as_text(),
            })
        })
        .collect())
}

async fn fetch_routes(engine: &Engine, node: &Node) -> Result<Vec<RouteEntry>, CoreError> {
    if node.read(|d| d.protocol_enabled(Protocol::Agent)) && engine.transports.agent.is_some() {
        if let Ok(mut lease) = AgentLease::acquire(engine, node).await {
            match lease.routing_table().await {
                Ok(routes) => return Ok(routes),
                Err(e) => debug!(node_id = node.id(), error = %e, "agent routing table unavailable"),
            }
        }
    }
    if node.read(|d| d.protocol_enabled(Protocol::Snmp)) {
        if let Some(transport) = open_snmp(engine, node, None) {
            return snmp_routes(transport.as_ref()).await;
        }
    }
    Err(unavailable(node, "routing table"))
}

async fn fetch_arp(engine: &Engine, node: &Node) -> Result<Vec<ArpEntry>, CoreError> {
    if node.read(|d| d.protocol_enabled(Protocol::Agent)) && engine.transports.agent.is_some() {
        if let Ok(mut lease) = AgentLease::acquire(engine, node).await {
            match lease.arp_cache().await {
                Ok(entries) => return Ok(entries),
                Err(e) => debug!(node_id = node.id(), error = %e, "agent ARP cache unavailable"),
            }
        }
    }
    if node.read(|d| d.protocol_enabled(Protocol::Snmp)) {
        if let Some(transport) = open_snmp(engine, node, None) {
            return snmp_arp(transport.as_ref()).await;
        }
    }
    Err(unavailable(node, "ARP cache"))
}

async fn fetch_neighbors(engine: &Engine, node: &Node) -> Result<Vec<LinkNeighbor>, CoreError> {
    if node.read(|d| d.protocol_enabled(Protocol::Snmp)) {
        if let Some(transport) = open_snmp(engine, node, None) {
            return snmp_neighbors(transport.as_ref()).await;
        }
    }
    Err(unavailable(node, "neighbor table"))
}

pub(crate) async fn fetch_parameters(engine: &Engine, node: &Node) -> Result<Vec<ParameterInfo>, CoreError> {
    if engine.transports.agent.is_none() || !node.read(|d| d.protocol_enabled(Protocol::Agent)) {
        return Err(unavailable(node, "parameter catalog"));
    }
    let mut lease = AgentLease::acquire(engine, node)
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    lease
        .supported_parameters()
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))
}

pub(crate) async fn routing_table(engine: &Engine, node: &Node) -> Result<Arc<Vec<RouteEntry>>, CoreError> {
    node.routing_table
        .get_or_refresh(engine.now(), fetch_routes(engine, node))
        .await
}

pub(crate) async fn arp_cache(engine: &Engine, node: &Node) -> Result<Arc<Vec<ArpEntry>>, CoreError> {
    node.arp_cache.get_or_refresh(engine.now(), fetch_arp(engine, node)).await
}

pub(crate) async fn topology(engine: &Engine, node: &Node) -> Result<Arc<Vec<LinkNeighbor>>, CoreError> {
    node.topology
        .get_or_refresh(engine.now(), fetch_neighbors(engine, node))
        .await
}

pub(crate) async fn parameters(engine: &Engine, node: &Node) -> Result<Arc<Vec<ParameterInfo>>, CoreError> {
    node.parameters
        .get_or_refresh(engine.now(), fetch_parameters(engine, node))
        .await
}
