// ── Subnet ──
//
// Subnets are shared between nodes, so they live in the registry and
// nodes refer to them by id. Membership is kept on both sides: the
// subnet lists node ids, the node lists subnet ids.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Mask assumed when discovery reports an address without one.
pub fn synthetic_prefix(ip: IpAddr) -> u8 {
    if ip.is_ipv4() { 24 } else { 64 }
}

/// Host bits left by a prefix.
pub fn host_bits(network: IpNetwork) -> u8 {
    let width = if network.is_ipv4() { 32 } else { 128 };
    width - network.prefix()
}

/// The network containing `ip` at `prefix`, with host bits cleared.
pub fn network_of(ip: IpAddr, prefix: u8) -> Option<IpNetwork> {
    let net = IpNetwork::new(ip, prefix).ok()?;
    IpNetwork::new(net.network(), prefix).ok()
}

/// `true` if either network contains the other's base address.
pub fn overlaps(a: IpNetwork, b: IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetData {
    pub network: IpNetwork,
    pub synthetic_mask: bool,
    pub nodes: BTreeSet<u32>,
}

#[derive(Debug)]
pub struct Subnet {
    pub id: u32,
    pub zone_id: u32,
    data: RwLock<SubnetData>,
}

/// Persisted form of a subnet. Membership is rebuilt from node records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub id: u32,
    pub zone_id: u32,
    pub network: IpNetwork,
    #[serde(default)]
    pub synthetic_mask: bool,
}

impl Subnet {
    pub fn new(id: u32, zone_id: u32, network: IpNetwork, synthetic_mask: bool) -> Self {
        Self {
            id,
            zone_id,
            data: RwLock::new(SubnetData {
                network,
                synthetic_mask,
                nodes: BTreeSet::new(),
            }),
        }
    }

    pub fn from_record(record: &SubnetRecord) -> Self {
        Self::new(record.id, record.zone_id, record.network, record.synthetic_mask)
    }

    pub fn to_record(&self) -> SubnetRecord {
        self.read(|d| SubnetRecord {
            id: self.id,
            zone_id: self.zone_id,
            network: d.network,
            synthetic_mask: d.synthetic_mask,
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&SubnetData) -> R) -> R {
        f(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SubnetData) -> R) -> R {
        f(&mut self.data.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn network(&self) -> IpNetwork {
        self.read(|d| d.network)
    }

    pub fn is_synthetic(&self) -> bool {
        self.read(|d| d.synthetic_mask)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.read(|d| d.network.contains(ip))
    }

    pub fn add_node(&self, node_id: u32) -> bool {
        self.update(|d| d.nodes.insert(node_id))
    }

    pub fn remove_node(&self, node_id: u32) -> bool {
        self.update(|d| d.nodes.remove(&node_id))
    }

    pub fn has_node(&self, node_id: u32) -> bool {
        self.read(|d| d.nodes.contains(&node_id))
    }

    pub fn is_empty(&self) -> bool {
        self.read(|d| d.nodes.is_empty())
    }

    /// Replace an inferred mask with one a real interface reported.
    pub fn set_correct_mask(&self, network: IpNetwork) {
        self.update(|d| {
            d.network = network;
            d.synthetic_mask = false;
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn network_of_clears_host_bits() {
        let net = network_of("10.1.2.3".parse().unwrap(), 24).unwrap();
        assert_eq!(net.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn host_bits_for_both_families() {
        assert_eq!(host_bits("10.0.0.0/30".parse().unwrap()), 2);
        assert_eq!(host_bits("fe80::/64".parse().unwrap()), 64);
    }

    #[test]
    fn overlap_is_symmetric() {
        let wide: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let narrow: IpNetwork = "10.0.0.128/25".parse().unwrap();
        assert!(overlaps(wide, narrow));
        assert!(overlaps(narrow, wide));
        assert!(!overlaps(narrow, "10.0.1.0/24".parse().unwrap()));
    }

    #[test]
    fn correcting_mask_clears_synthetic_marker() {
        let subnet = Subnet::new(1, 0, "10.0.0.0/24".parse().unwrap(), true);
        subnet.set_correct_mask("10.0.0.0/22".parse().unwrap());
        assert!(!subnet.is_synthetic());
        assert_eq!(subnet.network().prefix(), 22);
    }
}
