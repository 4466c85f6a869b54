// ── Node aggregate ──
//
// A node carries three independent locks:
//
// - the data lock (`std::sync::RwLock`) guards flags, parameters and
//   the child lists; it is only ever held for short synchronous
//   sections and never across an `.await`;
// - the poller lock (`tokio::sync::Mutex<()>`) serializes whole poll
//   cycles for this node;
// - the agent lock guards the reusable agent connection so a slow RPC
//   does not block readers of node fields.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use netpoll_transport::{
    AgentAuth, AgentSession, ArpEntry, LinkNeighbor, ParameterInfo, RouteEntry, SnmpVersion,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, Notify};

use super::cached::CacheSlot;
use super::flags::{DynamicFlags, NodeFlags, Protocol};
use super::interface::Interface;
use super::node_type::NodeType;
use super::service::NetworkService;
use super::status::ObjectStatus;

#[derive(Debug, Clone)]
pub struct SnmpSettings {
    pub version: SnmpVersion,
    pub port: u16,
    pub community: SecretString,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub port: u16,
    pub auth: AgentAuth,
    pub secret: SecretString,
}

/// Start of the current failure streak, per protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureTimes {
    snmp: Option<DateTime<Utc>>,
    agent: Option<DateTime<Utc>>,
    checkpoint: Option<DateTime<Utc>>,
}

impl FailureTimes {
    pub fn get(&self, protocol: Protocol) -> Option<DateTime<Utc>> {
        match protocol {
            Protocol::Snmp => self.snmp,
            Protocol::Agent => self.agent,
            Protocol::CheckPointSnmp => self.checkpoint,
        }
    }

    pub fn set(&mut self, protocol: Protocol, at: Option<DateTime<Utc>>) {
        let slot = match protocol {
            Protocol::Snmp => &mut self.snmp,
            Protocol::Agent => &mut self.agent,
            Protocol::CheckPointSnmp => &mut self.checkpoint,
        };
        *slot = at;
    }
}

/// Everything guarded by the node's data lock.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub name: String,
    pub primary_ip: IpAddr,
    /// Host name the primary address was resolved from, if any.
    pub primary_name: String,
    pub zone_id: u32,
    pub flags: NodeFlags,
    pub dynamic: DynamicFlags,
    pub node_type: NodeType,
    pub snmp: SnmpSettings,
    pub agent: AgentSettings,
    /// Node whose agent tunnels our agent connection.
    pub proxy_node: Option<u32>,
    /// Node whose agent tunnels our SNMP traffic.
    pub snmp_proxy_node: Option<u32>,
    /// Node that runs service checks for us.
    pub poller_node: Option<u32>,
    pub snmp_object_id: String,
    pub sys_description: String,
    pub sys_name: String,
    pub platform_name: String,
    pub agent_version: String,
    pub failures: FailureTimes,
    pub interfaces: Vec<Interface>,
    pub services: Vec<NetworkService>,
    pub subnets: BTreeSet<u32>,
    pub templates: BTreeSet<u32>,
    pub cluster: Option<u32>,
    pub status: ObjectStatus,
    pub managed: bool,
    pub custom_attributes: BTreeMap<String, String>,
    pub boot_time: Option<DateTime<Utc>>,
    pub last_status_poll: Option<DateTime<Utc>>,
    pub last_config_poll: Option<DateTime<Utc>>,
    pub down_since: Option<DateTime<Utc>>,
}

impl NodeData {
    pub fn is_unreachable(&self) -> bool {
        self.dynamic.contains(DynamicFlags::UNREACHABLE)
    }

    /// Protocol is supported and not administratively switched off.
    pub fn protocol_enabled(&self, protocol: Protocol) -> bool {
        self.flags.contains(protocol.capability()) && !self.flags.intersects(protocol.disabled_by())
    }

    pub fn interface_by_ip(&self, ip: IpAddr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.ip() == Some(ip))
    }

    /// Status of every pollable child, for the compound roll-up.
    pub fn child_statuses(&self) -> Vec<ObjectStatus> {
        self.interfaces
            .iter()
            .filter(|i| i.is_pollable())
            .map(|i| i.status)
            .chain(self.services.iter().filter(|s| s.managed).map(|s| s.status))
            .collect()
    }
}

// ── Persisted form ──────────────────────────────────────────────────

/// Flat node record exchanged with the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u32,
    pub name: String,
    pub primary_ip: IpAddr,
    #[serde(default)]
    pub primary_name: String,
    #[serde(default)]
    pub zone_id: u32,
    #[serde(default = "NodeFlags::empty")]
    pub flags: NodeFlags,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub snmp_version: SnmpVersion,
    #[serde(default = "default_snmp_port")]
    pub snmp_port: u16,
    #[serde(default)]
    pub snmp_community: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default)]
    pub agent_auth: AgentAuth,
    #[serde(default)]
    pub agent_secret: String,
    #[serde(default)]
    pub proxy_node: Option<u32>,
    #[serde(default)]
    pub snmp_proxy_node: Option<u32>,
    #[serde(default)]
    pub poller_node: Option<u32>,
    #[serde(default)]
    pub snmp_object_id: String,
    #[serde(default)]
    pub sys_description: String,
    #[serde(default)]
    pub sys_name: String,
    #[serde(default)]
    pub platform_name: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub services: Vec<NetworkService>,
    /// Parent subnet ids; each must exist when the node is loaded.
    #[serde(default)]
    pub subnets: Vec<u32>,
    /// Names of bound system templates.
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub cluster: Option<u32>,
    #[serde(default)]
    pub status: ObjectStatus,
    #[serde(default = "default_managed")]
    pub managed: bool,
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub boot_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_config_poll: Option<DateTime<Utc>>,
}

fn default_snmp_port() -> u16 {
    161
}

fn default_agent_port() -> u16 {
    4700
}

fn default_managed() -> bool {
    true
}

impl NodeRecord {
    /// A freshly provisioned node with protocol defaults.
    pub fn new(id: u32, name: impl Into<String>, primary_ip: IpAddr) -> Self {
        Self {
            id,
            name: name.into(),
            primary_ip,
            primary_name: String::new(),
            zone_id: 0,
            flags: NodeFlags::empty(),
            node_type: NodeType::Generic,
            snmp_version: SnmpVersion::default(),
            snmp_port: default_snmp_port(),
            snmp_community: String::new(),
            agent_port: default_agent_port(),
            agent_auth: AgentAuth::default(),
            agent_secret: String::new(),
            proxy_node: None,
            snmp_proxy_node: None,
            poller_node: None,
            snmp_object_id: String::new(),
            sys_description: String::new(),
            sys_name: String::new(),
            platform_name: String::new(),
            agent_version: String::new(),
            interfaces: Vec::new(),
            services: Vec::new(),
            subnets: Vec::new(),
            templates: Vec::new(),
            cluster: None,
            status: ObjectStatus::Unknown,
            managed: true,
            custom_attributes: BTreeMap::new(),
            boot_time: None,
            last_config_poll: None,
        }
    }
}

// ── Node ────────────────────────────────────────────────────────────

pub struct Node {
    id: u32,
    data: RwLock<NodeData>,
    poll_lock: Mutex<()>,
    agent: Mutex<Option<Box<dyn AgentSession>>>,
    idle: Notify,
    pub routing_table: CacheSlot<Vec<RouteEntry>>,
    pub arp_cache: CacheSlot<Vec<ArpEntry>>,
    pub topology: CacheSlot<Vec<LinkNeighbor>>,
    pub parameters: CacheSlot<Vec<ParameterInfo>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.read(|d| {
            f.debug_struct("Node")
                .field("id", &self.id)
                .field("name", &d.name)
                .field("primary_ip", &d.primary_ip)
                .field("flags", &d.flags)
                .field("dynamic", &d.dynamic)
                .finish_non_exhaustive()
        })
    }
}

impl Node {
    /// Build the in-memory node. Parent links in `record.subnets` and
    /// template names are resolved by the registry, not here.
    pub fn from_record(record: &NodeRecord, cache_ttl: Duration) -> Self {
        let data = NodeData {
            name: record.name.clone(),
            primary_ip: record.primary_ip,
            primary_name: record.primary_name.clone(),
            zone_id: record.zone_id,
            flags: record.flags,
            dynamic: DynamicFlags::empty(),
            node_type: record.node_type,
            snmp: SnmpSettings {
                version: record.snmp_version,
                port: record.snmp_port,
                community: SecretString::from(record.snmp_community.clone()),
            },
            agent: AgentSettings {
                port: record.agent_port,
                auth: record.agent_auth,
                secret: SecretString::from(record.agent_secret.clone()),
            },
            proxy_node: record.proxy_node,
            snmp_proxy_node: record.snmp_proxy_node,
            poller_node: record.poller_node,
            snmp_object_id: record.snmp_object_id.clone(),
            sys_description: record.sys_description.clone(),
            sys_name: record.sys_name.clone(),
            platform_name: record.platform_name.clone(),
            agent_version: record.agent_version.clone(),
            failures: FailureTimes::default(),
            interfaces: record.interfaces.clone(),
            services: record.services.clone(),
            subnets: record.subnets.iter().copied().collect(),
            templates: BTreeSet::new(),
            cluster: record.cluster,
            status: record.status,
            managed: record.managed,
            custom_attributes: record.custom_attributes.clone(),
            boot_time: record.boot_time,
            last_status_poll: None,
            last_config_poll: record.last_config_poll,
            down_since: None,
        };

        Self {
            id: record.id,
            data: RwLock::new(data),
            poll_lock: Mutex::new(()),
            agent: Mutex::new(None),
            idle: Notify::new(),
            routing_table: CacheSlot::new(cache_ttl),
            arp_cache: CacheSlot::new(cache_ttl),
            topology: CacheSlot::new(cache_ttl),
            parameters: CacheSlot::new(cache_ttl),
        }
    }

    /// Snapshot for the persistence collaborator.
    pub fn to_record(&self, template_names: impl Fn(u32) -> Option<String>) -> NodeRecord {
        self.read(|d| NodeRecord {
            id: self.id,
            name: d.name.clone(),
            primary_ip: d.primary_ip,
            primary_name: d.primary_name.clone(),
            zone_id: d.zone_id,
            flags: d.flags,
            node_type: d.node_type,
            snmp_version: d.snmp.version,
            snmp_port: d.snmp.port,
            snmp_community: d.snmp.community.expose_secret().to_owned(),
            agent_port: d.agent.port,
            agent_auth: d.agent.auth,
            agent_secret: d.agent.secret.expose_secret().to_owned(),
            proxy_node: d.proxy_node,
            snmp_proxy_node: d.snmp_proxy_node,
            poller_node: d.poller_node,
            snmp_object_id: d.snmp_object_id.clone(),
            sys_description: d.sys_description.clone(),
            sys_name: d.sys_name.clone(),
            platform_name: d.platform_name.clone(),
            agent_version: d.agent_version.clone(),
            interfaces: d.interfaces.clone(),
            services: d.services.clone(),
            subnets: d.subnets.iter().copied().collect(),
            templates: d.templates.iter().filter_map(|&id| template_names(id)).collect(),
            cluster: d.cluster,
            status: d.status,
            managed: d.managed,
            custom_attributes: d.custom_attributes.clone(),
            boot_time: d.boot_time,
            last_config_poll: d.last_config_poll,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    // ── Data lock ────────────────────────────────────────────────────

    pub fn read<R>(&self, f: impl FnOnce(&NodeData) -> R) -> R {
        f(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut NodeData) -> R) -> R {
        f(&mut self.data.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn name(&self) -> String {
        self.read(|d| d.name.clone())
    }

    pub fn primary_ip(&self) -> IpAddr {
        self.read(|d| d.primary_ip)
    }

    pub fn flags(&self) -> NodeFlags {
        self.read(|d| d.flags)
    }

    pub fn dynamic(&self) -> DynamicFlags {
        self.read(|d| d.dynamic)
    }

    pub fn status(&self) -> ObjectStatus {
        self.read(|d| d.status)
    }

    pub fn is_unreachable(&self) -> bool {
        self.read(NodeData::is_unreachable)
    }

    pub fn set_dynamic(&self, flags: DynamicFlags) {
        self.update(|d| d.dynamic.insert(flags));
    }

    pub fn clear_dynamic(&self, flags: DynamicFlags) {
        self.update(|d| d.dynamic.remove(flags));
    }

    /// Ask the next configuration poll to re-detect everything.
    pub fn request_recheck(&self) {
        self.set_dynamic(DynamicFlags::RECHECK_CAPABILITIES);
    }

    // ── Poller lock ──────────────────────────────────────────────────

    pub(crate) async fn lock_poller(&self) -> MutexGuard<'_, ()> {
        self.poll_lock.lock().await
    }

    // ── Agent connection ─────────────────────────────────────────────

    pub(crate) async fn agent_slot(&self) -> MutexGuard<'_, Option<Box<dyn AgentSession>>> {
        self.agent.lock().await
    }

    /// Close and forget the cached agent connection.
    pub async fn drop_agent_connection(&self) {
        let session = self.agent.lock().await.take();
        if let Some(session) = session {
            session.disconnect().await;
        }
    }

    // ── Queue bookkeeping ────────────────────────────────────────────

    /// Clear a queued-for-poll flag and wake anyone waiting for the
    /// node to go idle.
    pub(crate) fn finish_queued(&self, flag: DynamicFlags) {
        self.clear_dynamic(flag);
        self.idle.notify_waiters();
    }

    /// Wait until no poll is queued or running for this node.
    pub(crate) async fn wait_idle(&self, recheck: Duration) {
        loop {
            let notified = self.idle.notified();
            if !self.dynamic().intersects(DynamicFlags::QUEUED) {
                return;
            }
            let _ = tokio::time::timeout(recheck, notified).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        let mut record = NodeRecord::new(7, "core-sw", "10.0.0.9".parse().unwrap());
        record.flags = NodeFlags::IS_SNMP | NodeFlags::IS_BRIDGE;
        record.snmp_community = "private".into();
        record.subnets = vec![3];
        record.custom_attributes.insert("snmp.testoid".into(), ".1.3.6.1.2.1.1.5.0".into());
        record
    }

    #[test]
    fn record_round_trips_through_node() {
        let original = record();
        let node = Node::from_record(&original, Duration::from_secs(300));
        assert_eq!(node.to_record(|_| None), original);
    }

    #[test]
    fn dynamic_flags_start_clear() {
        let node = Node::from_record(&record(), Duration::from_secs(300));
        assert!(node.dynamic().is_empty());
        node.set_dynamic(DynamicFlags::SNMP_UNREACHABLE);
        assert!(node.dynamic().contains(DynamicFlags::SNMP_UNREACHABLE));
    }

    #[test]
    fn protocol_enabled_respects_admin_override() {
        let node = Node::from_record(&record(), Duration::from_secs(300));
        assert!(node.read(|d| d.protocol_enabled(Protocol::Snmp)));
        node.update(|d| d.flags.insert(NodeFlags::DISABLE_SNMP));
        assert!(!node.read(|d| d.protocol_enabled(Protocol::Snmp)));
        assert!(!node.read(|d| d.protocol_enabled(Protocol::Agent)));
    }

    #[tokio::test]
    async fn wait_idle_returns_once_queue_flags_clear() {
        let node = std::sync::Arc::new(Node::from_record(&record(), Duration::from_secs(300)));
        node.set_dynamic(DynamicFlags::QUEUED_FOR_STATUS_POLL);

        let waiter = {
            let node = std::sync::Arc::clone(&node);
            tokio::spawn(async move { node.wait_idle(Duration::from_millis(10)).await })
        };
        tokio::task::yield_now().await;
        node.finish_queued(DynamicFlags::QUEUED_FOR_STATUS_POLL);
        waiter.await.unwrap();
    }
}
