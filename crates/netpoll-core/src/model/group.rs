// ── Clusters and templates ──
//
// Objects that group nodes. Both are looked up through the registry
// by id; neither owns the nodes it lists.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

use ipnetwork::IpNetwork;

/// Template a node joins while it has a native agent.
pub const SYSTEM_AGENT_TEMPLATE: &str = "System/Agent";

/// Template a node joins while it speaks SNMP.
pub const SYSTEM_SNMP_TEMPLATE: &str = "System/SNMP";

/// A failover cluster. Addresses inside its sync networks belong to
/// the interconnect and never bind to subnets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: u32,
    pub name: String,
    pub sync_networks: Vec<IpNetwork>,
    pub members: BTreeSet<u32>,
}

impl Cluster {
    pub fn is_sync_address(&self, ip: IpAddr) -> bool {
        self.sync_networks.iter().any(|net| net.contains(ip))
    }
}

#[derive(Debug)]
pub struct Template {
    pub id: u32,
    pub name: String,
    nodes: RwLock<BTreeSet<u32>>,
}

impl Template {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes: RwLock::new(BTreeSet::new()),
        }
    }

    /// Returns `true` if the node was not bound yet.
    pub fn bind(&self, node_id: u32) -> bool {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id)
    }

    /// Returns `true` if the node was bound.
    pub fn unbind(&self, node_id: u32) -> bool {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node_id)
    }

    pub fn is_bound(&self, node_id: u32) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&node_id)
    }
}

/// Request to drop collection items a template left behind on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciCleanup {
    pub template_id: u32,
    pub node_id: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sync_address_detection() {
        let cluster = Cluster {
            id: 5,
            name: "fw-pair".into(),
            sync_networks: vec!["192.168.255.0/30".parse().unwrap()],
            members: BTreeSet::from([1, 2]),
        };
        assert!(cluster.is_sync_address("192.168.255.1".parse().unwrap()));
        assert!(!cluster.is_sync_address("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn template_binding_reports_changes() {
        let template = Template::new(1, SYSTEM_SNMP_TEMPLATE);
        assert!(template.bind(7));
        assert!(!template.bind(7));
        assert!(template.unbind(7));
        assert!(!template.is_bound(7));
    }
}
