// ── Runtime poller configuration ──
//
// These types describe *how* the engine polls. They never touch disk;
// `netpoll-config` builds a `PollerConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::model::{NodeFlags, NodeType};
use crate::model::status::StatusAlgorithm;

/// What to do with a capability whose expiration window has elapsed
/// while the whole node is marked unreachable.
///
/// During an outage every protocol is failing at once, so demoting on
/// elapsed time alone would strip capabilities from every node behind
/// a broken link. `SuppressWhileUnreachable` keeps the capability until
/// the node is reachable again and the protocol is still failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemotionPolicy {
    #[default]
    SuppressWhileUnreachable,
    /// Demote on elapsed time regardless of node state.
    Always,
}

impl DemotionPolicy {
    pub fn allows(self, node_unreachable: bool) -> bool {
        match self {
            Self::SuppressWhileUnreachable => !node_unreachable,
            Self::Always => true,
        }
    }
}

/// Name resolution settings for the configuration poll.
#[derive(Debug, Clone)]
pub struct NameSettings {
    /// Replace a node name that is a literal IP of its own interfaces.
    pub resolve_by_ip: bool,
    /// Always sync the node name with reverse DNS.
    pub sync_with_dns: bool,
    /// Keep the domain part of resolved names.
    pub use_fqdn: bool,
    /// Re-resolve the primary host name on every status poll.
    pub resolve_address_each_poll: bool,
    pub dns_timeout: Duration,
}

impl Default for NameSettings {
    fn default() -> Self {
        Self {
            resolve_by_ip: true,
            sync_with_dns: false,
            use_fqdn: false,
            resolve_address_each_poll: false,
            dns_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnmpDefaults {
    pub port: u16,
    /// Tried in order after the node's own community during negotiation.
    pub communities: Vec<SecretString>,
    pub timeout: Duration,
    pub retries: u32,
    pub checkpoint_port: u16,
    pub enable_checkpoint: bool,
    /// OID fetched by the status probe unless a node overrides it.
    pub test_oid: String,
}

impl Default for SnmpDefaults {
    fn default() -> Self {
        Self {
            port: 161,
            communities: vec![SecretString::from("public".to_owned())],
            timeout: Duration::from_millis(1500),
            retries: 1,
            checkpoint_port: 260,
            enable_checkpoint: true,
            test_oid: ".1.3.6.1.2.1.1.2.0".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentDefaults {
    pub port: u16,
    /// Retried once when the node's own secret is rejected.
    pub default_secret: SecretString,
    pub timeout: Duration,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            port: 4700,
            default_secret: SecretString::from("netxms".to_owned()),
            timeout: Duration::from_secs(5),
        }
    }
}

/// A sysObjectID prefix mapped to a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidTypeRule {
    pub prefix: String,
    pub node_type: NodeType,
    pub flags: NodeFlags,
}

/// Everything the engine needs to schedule and run polls.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub status_interval: Duration,
    pub configuration_interval: Duration,
    /// How often the scheduler looks for nodes due for a poll.
    pub scheduler_tick: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Continuous failure time before a capability is demoted.
    pub capability_expiration: Duration,
    pub demotion_policy: DemotionPolicy,
    /// Lifetime of cached routing tables, ARP caches, and parameter lists.
    pub cache_ttl: Duration,
    pub status_algorithm: StatusAlgorithm,
    /// Node that runs service checks for nodes without their own poller.
    pub management_node: Option<u32>,
    pub names: NameSettings,
    pub snmp: SnmpDefaults,
    pub agent: AgentDefaults,
    /// Extra sysObjectID rules, consulted before the built-in table.
    pub oid_types: Vec<OidTypeRule>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(60),
            configuration_interval: Duration::from_secs(3600),
            scheduler_tick: Duration::from_secs(5),
            workers: 10,
            queue_capacity: 250,
            capability_expiration: Duration::from_secs(604_800),
            demotion_policy: DemotionPolicy::default(),
            cache_ttl: Duration::from_secs(300),
            status_algorithm: StatusAlgorithm::default(),
            management_node: None,
            names: NameSettings::default(),
            snmp: SnmpDefaults::default(),
            agent: AgentDefaults::default(),
            oid_types: Vec::new(),
        }
    }
}
