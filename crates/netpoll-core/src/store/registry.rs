// ── Object registry ──
//
// Every shared object is reachable by numeric id. Relationships
// between objects are id sets on either side, resolved here on use,
// so a deleted object simply stops resolving.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ipnetwork::IpNetwork;
use tokio::sync::watch;
use tracing::debug;

use super::collection::ObjectCollection;
use crate::error::CoreError;
use crate::model::subnet::{host_bits, network_of, overlaps};
use crate::model::{Cluster, DciCleanup, Node, Subnet, Template};

fn node_key(zone_id: u32, ip: IpAddr) -> String {
    format!("{zone_id}:{ip}")
}

fn subnet_key(zone_id: u32, network: IpNetwork) -> String {
    format!("{zone_id}:{network}")
}

pub struct Registry {
    next_id: AtomicU32,
    nodes: ObjectCollection<Node>,
    subnets: ObjectCollection<Subnet>,
    templates: ObjectCollection<Template>,
    clusters: ObjectCollection<Cluster>,
    dci_cleanup: Mutex<Vec<DciCleanup>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            nodes: ObjectCollection::new(),
            subnets: ObjectCollection::new(),
            templates: ObjectCollection::new(),
            clusters: ObjectCollection::new(),
            dci_cleanup: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a fresh object id.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure ids loaded from storage are never handed out again.
    pub fn reserve_id(&self, id: u32) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::Relaxed);
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub fn node(&self, id: u32) -> Option<Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.snapshot()
    }

    pub fn subscribe_nodes(&self) -> watch::Receiver<Arc<Vec<Arc<Node>>>> {
        self.nodes.subscribe()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_by_address(&self, zone_id: u32, ip: IpAddr) -> Option<Arc<Node>> {
        self.nodes.get_by_key(&node_key(zone_id, ip))
    }

    /// Register a node. Two nodes may not share a primary address
    /// within one zone.
    pub fn insert_node(&self, node: Arc<Node>) -> Result<(), CoreError> {
        let (zone_id, ip) = node.read(|d| (d.zone_id, d.primary_ip));
        let key = node_key(zone_id, ip);
        if let Some(existing) = self.nodes.id_for_key(&key) {
            if existing != node.id() {
                return Err(CoreError::DuplicateAddress {
                    address: ip.to_string(),
                    existing,
                });
            }
        }
        self.reserve_id(node.id());
        self.nodes.insert(node.id(), Some(key), node);
        Ok(())
    }

    pub fn remove_node(&self, id: u32) -> Option<Arc<Node>> {
        self.nodes.remove(id)
    }

    /// Re-index a node after its primary address changed.
    pub fn rekey_node(&self, id: u32, zone_id: u32, ip: IpAddr) -> Result<(), CoreError> {
        let key = node_key(zone_id, ip);
        if let Some(existing) = self.nodes.id_for_key(&key) {
            if existing != id {
                return Err(CoreError::DuplicateAddress {
                    address: ip.to_string(),
                    existing,
                });
            }
        }
        self.nodes.rekey(id, key);
        Ok(())
    }

    // ── Subnets ──────────────────────────────────────────────────────

    pub fn subnet(&self, id: u32) -> Option<Arc<Subnet>> {
        self.subnets.get(id)
    }

    pub fn subnets(&self) -> Arc<Vec<Arc<Subnet>>> {
        self.subnets.snapshot()
    }

    pub fn insert_subnet(&self, subnet: Arc<Subnet>) {
        let key = subnet_key(subnet.zone_id, subnet.network());
        self.reserve_id(subnet.id);
        self.subnets.insert(subnet.id, Some(key), subnet);
    }

    pub fn remove_subnet(&self, id: u32) -> Option<Arc<Subnet>> {
        self.subnets.remove(id)
    }

    /// Most specific subnet in the zone containing `ip`.
    pub fn find_subnet_for(&self, zone_id: u32, ip: IpAddr) -> Option<Arc<Subnet>> {
        self.subnets
            .snapshot()
            .iter()
            .filter(|s| s.zone_id == zone_id && s.contains(ip))
            .max_by_key(|s| s.network().prefix())
            .cloned()
    }

    fn overlapping(&self, zone_id: u32, network: IpNetwork) -> bool {
        self.subnets
            .snapshot()
            .iter()
            .any(|s| s.zone_id == zone_id && overlaps(s.network(), network))
    }

    /// Create and register a subnet for `address`.
    ///
    /// An inferred mask is narrowed until it no longer overlaps an
    /// existing subnet. Returns `None` when fewer than two host bits
    /// would remain.
    pub fn create_subnet(&self, zone_id: u32, address: IpNetwork, synthetic: bool) -> Option<Arc<Subnet>> {
        let mut network = network_of(address.ip(), address.prefix())?;
        if synthetic {
            while self.overlapping(zone_id, network) {
                if host_bits(network) <= 2 {
                    return None;
                }
                network = network_of(network.ip(), network.prefix() + 1)?;
            }
        }
        if host_bits(network) < 2 {
            return None;
        }

        let subnet = Arc::new(Subnet::new(self.allocate_id(), zone_id, network, synthetic));
        debug!(subnet_id = subnet.id, %network, synthetic, "created subnet");
        self.insert_subnet(Arc::clone(&subnet));
        Some(subnet)
    }

    /// Apply a mask correction and re-index the subnet.
    pub fn correct_subnet_mask(&self, subnet: &Subnet, network: IpNetwork) {
        subnet.set_correct_mask(network);
        self.subnets.rekey(subnet.id, subnet_key(subnet.zone_id, network));
    }

    // ── Templates ────────────────────────────────────────────────────

    pub fn template(&self, id: u32) -> Option<Arc<Template>> {
        self.templates.get(id)
    }

    /// Look up a template by name, creating it on first use.
    pub fn system_template(&self, name: &str) -> Arc<Template> {
        if let Some(template) = self.templates.get_by_key(name) {
            return template;
        }
        let template = Arc::new(Template::new(self.allocate_id(), name));
        self.templates
            .insert(template.id, Some(name.to_owned()), Arc::clone(&template));
        template
    }

    pub fn queue_dci_cleanup(&self, request: DciCleanup) {
        self.dci_cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    /// Hand pending cleanup requests to the collection subsystem.
    pub fn drain_dci_cleanup(&self) -> Vec<DciCleanup> {
        std::mem::take(&mut *self.dci_cleanup.lock().unwrap_or_else(PoisonError::into_inner))
    }

    // ── Clusters ─────────────────────────────────────────────────────

    pub fn cluster(&self, id: u32) -> Option<Arc<Cluster>> {
        self.clusters.get(id)
    }

    pub fn insert_cluster(&self, cluster: Cluster) {
        self.reserve_id(cluster.id);
        self.clusters.insert(cluster.id, None, Arc::new(cluster));
    }
}
