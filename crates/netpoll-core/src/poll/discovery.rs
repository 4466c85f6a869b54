// ── Interface discovery ──
//
// Sources are tried in priority order (local host, native agent, SNMP)
// and the first one that produces rows wins.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::{IpNetwork, ipv4_mask_to_prefix};
use netpoll_transport::snmp::oid_suffix;
use netpoll_transport::{IFTYPE_OTHER, InterfaceInfo, MacAddress, SnmpError, SnmpTransport, SnmpValue};
use strum::Display;
use tracing::debug;

use super::session::{AgentLease, open_snmp};
use super::Engine;
use crate::model::{Node, NodeFlags, Protocol};

const IF_INDEX: &str = ".1.3.6.1.2.1.2.2.1.1";
const IF_DESCR: &str = ".1.3.6.1.2.1.2.2.1.2";
const IF_TYPE: &str = ".1.3.6.1.2.1.2.2.1.3";
const IF_PHYS_ADDRESS: &str = ".1.3.6.1.2.1.2.2.1.6";
const IP_AD_ENT_IF_INDEX: &str = ".1.3.6.1.2.1.4.20.1.2";
const IP_AD_ENT_NET_MASK: &str = ".1.3.6.1.2.1.4.20.1.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Source {
    Local,
    Agent,
    Snmp,
}

/// Interface rows from the first source that answers, or `None` when
/// every source failed.
pub(crate) async fn discover(engine: &Engine, node: &Node) -> Option<(Source, Vec<InterfaceInfo>)> {
    let (local_mgmt, agent, snmp) = node.read(|d| {
        (
            d.flags.contains(NodeFlags::IS_LOCAL_MGMT),
            d.protocol_enabled(Protocol::Agent),
            d.protocol_enabled(Protocol::Snmp),
        )
    });

    if local_mgmt {
        if let Some(rows) = from_local(engine).await {
            return Some((Source::Local, rows));
        }
    }
    if agent && engine.transports.agent.is_some() {
        if let Some(rows) = from_agent(engine, node).await {
            return Some((Source::Agent, rows));
        }
    }
    if snmp {
        if let Some(transport) = open_snmp(engine, node, None) {
            match from_snmp(transport.as_ref()).await {
                Ok(rows) if !rows.is_empty() => return Some((Source::Snmp, rows)),
                Ok(_) => debug!(node_id = node.id(), "SNMP interface table is empty"),
                Err(e) => debug!(node_id = node.id(), error = %e, "SNMP interface walk failed"),
            }
        }
    }
    None
}

async fn from_local(engine: &Engine) -> Option<Vec<InterfaceInfo>> {
    let source = Arc::clone(engine.transports.local.as_ref()?);
    match tokio::task::spawn_blocking(move || source.interface_list()).await {
        Ok(Ok(rows)) if !rows.is_empty() => Some(rows),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!(error = %e, "local interface enumeration failed");
            None
        }
        Err(e) => {
            debug!(error = %e, "local interface task failed");
            None
        }
    }
}

async fn from_agent(engine: &Engine, node: &Node) -> Option<Vec<InterfaceInfo>> {
    let mut lease = AgentLease::acquire(engine, node).await.ok()?;
    match lease.interface_list().await {
        Ok(rows) if !rows.is_empty() => Some(rows),
        Ok(_) => None,
        Err(e) => {
            debug!(node_id = node.id(), error = %e, "agent interface list failed");
            None
        }
    }
}

#[derive(Debug, Default)]
struct IfRow {
    name: String,
    if_type: u32,
    mac: Option<MacAddress>,
}

async fn column(
    transport: &dyn SnmpTransport,
    root: &str,
) -> Result<Vec<(String, SnmpValue)>, SnmpError> {
    let rows = transport.walk(root).await?;
    Ok(rows
        .into_iter()
        .filter_map(|(oid, value)| oid_suffix(&oid, root).map(|idx| (idx, value)))
        .collect())
}

fn index_of(suffix: &str) -> Option<u32> {
    suffix.parse().ok()
}

/// Walk ifTable and ipAddrTable into one row per (interface, address).
pub(crate) async fn from_snmp(transport: &dyn SnmpTransport) -> Result<Vec<InterfaceInfo>, SnmpError> {
    let mut table: BTreeMap<u32, IfRow> = BTreeMap::new();
    for (suffix, value) in column(transport, IF_INDEX).await? {
        if let Some(index) = value.as_i64().and_then(|v| u32::try_from(v).ok()).or_else(|| index_of(&suffix)) {
            table.entry(index).or_default();
        }
    }
    for (suffix, value) in column(transport, IF_DESCR).await? {
        if let Some(row) = index_of(&suffix).and_then(|i| table.get_mut(&i)) {
            row.name = value.as_text();
        }
    }
    for (suffix, value) in column(transport, IF_TYPE).await? {
        if let Some(row) = index_of(&suffix).and_then(|i| table.get_mut(&i)) {
            row.if_type = value
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(IFTYPE_OTHER);
        }
    }
    for (suffix, value) in column(transport, IF_PHYS_ADDRESS).await? {
        if let Some(row) = index_of(&suffix).and_then(|i| table.get_mut(&i)) {
            row.mac = value
                .as_bytes()
                .and_then(MacAddress::from_bytes)
                .filter(|m| !m.is_zero());
        }
    }

    // ipAddrTable is indexed by the address itself.
    let mut addresses: BTreeMap<u32, Vec<IpNetwork>> = BTreeMap::new();
    let masks: BTreeMap<String, u8> = column(transport, IP_AD_ENT_NET_MASK)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(suffix, value)| match value {
            SnmpValue::IpAddress(mask) => ipv4_mask_to_prefix(mask).ok().map(|p| (suffix, p)),
            _ => None,
        })
        .collect();
    for (suffix, value) in column(transport, IP_AD_ENT_IF_INDEX).await.unwrap_or_default() {
        let Ok(ip) = suffix.parse::<IpAddr>() else {
            continue;
        };
        let Some(index) = value.as_i64().and_then(|v| u32::try_from(v).ok()) else {
            continue;
        };
        let prefix = masks.get(&suffix).copied().unwrap_or(0);
        if let Ok(net) = IpNetwork::new(ip, prefix) {
            addresses.entry(index).or_default().push(net);
        }
    }

    let mut rows = Vec::new();
    for (index, row) in table {
        let name = if row.name.is_empty() {
            index.to_string()
        } else {
            row.name
        };
        match addresses.remove(&index) {
            Some(nets) => rows.extend(nets.into_iter().map(|net| InterfaceInfo {
                index,
                name: name.clone(),
                if_type: row.if_type,
                mac: row.mac.clone(),
                address: Some(net),
            })),
            None => rows.push(InterfaceInfo {
                index,
                name,
                if_type: row.if_type,
                mac: row.mac,
                address: None,
            }),
        }
    }
    Ok(rows)
}
