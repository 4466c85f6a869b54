// ── Subnet binding ──
//
// Finding or creating the subnet an address belongs to, and the audit
// that brings a node's parent subnets back in line with its surviving
// interfaces.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use super::Engine;
use crate::model::subnet::{host_bits, network_of, synthetic_prefix};
use crate::model::{EventCode, Interface, Node, Subnet};

/// Addresses that never bind to a subnet.
pub(crate) fn is_bindable(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => !v6.is_unicast_link_local(),
    }
}

/// Result of resolving the subnet for one address.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub subnet: Arc<Subnet>,
    /// Prefix the interface should carry; adopted from the subnet when
    /// the interface mask was inferred.
    pub prefix: u8,
    /// Subnet prefix, when it disagrees with a real interface mask.
    pub mismatch: Option<u8>,
}

/// Find or create the subnet for `address` and add the node to it.
///
/// A synthetic subnet mask is replaced by the interface mask when the
/// latter is real. Returns `None` for addresses that do not bind, or
/// when no subnet can be created for them.
pub(crate) async fn bind_address(
    engine: &Engine,
    node_id: u32,
    zone_id: u32,
    address: IpNetwork,
    synthetic_mask: bool,
) -> Option<Binding> {
    let ip = address.ip();
    if !is_bindable(ip) {
        return None;
    }

    let mut dirty = false;
    let mut prefix = address.prefix();
    let mut mismatch = None;

    let subnet = if let Some(subnet) = engine.registry.find_subnet_for(zone_id, ip) {
        let network = subnet.network();
        if synthetic_mask {
            prefix = network.prefix();
        } else if network.prefix() != address.prefix() {
            if subnet.is_synthetic() {
                if let Some(correct) = network_of(ip, address.prefix()) {
                    info!(subnet_id = subnet.id, old = %network, new = %correct, "correcting inferred subnet mask");
                    engine.registry.correct_subnet_mask(&subnet, correct);
                    dirty = true;
                }
            } else if host_bits(address) > 0 {
                mismatch = Some(network.prefix());
            }
        }
        subnet
    } else {
        let subnet = engine.registry.create_subnet(zone_id, address, synthetic_mask)?;
        prefix = subnet.network().prefix();
        dirty = true;
        subnet
    };

    subnet.add_node(node_id);
    if dirty {
        engine.persist_subnet(&subnet).await;
    }
    Some(Binding {
        subnet,
        prefix,
        mismatch,
    })
}

/// Post INCORRECT_NETMASK for an interface bound into a subnet with a
/// different mask.
pub(crate) fn report_mismatch(engine: &Engine, node_id: u32, iface: &Interface, subnet_prefix: u8) {
    warn!(
        node_id,
        if_index = iface.if_index,
        interface_prefix = iface.prefix(),
        subnet_prefix,
        "interface mask differs from its subnet"
    );
    engine.post(
        engine
            .event(EventCode::IncorrectNetmask, node_id)
            .arg("interfaceIndex", iface.if_index)
            .arg("interfaceName", &iface.name)
            .arg("actualMask", iface.prefix())
            .arg("correctMask", subnet_prefix),
    );
}

/// Record a binding on the node side. Returns `true` if anything changed.
pub(crate) fn attach(node: &Node, interface_id: u32, binding: &Binding) -> bool {
    node.update(|d| {
        let mut changed = d.subnets.insert(binding.subnet.id);
        if let Some(iface) = d.interfaces.iter_mut().find(|i| i.id == interface_id) {
            if iface.subnet_id != Some(binding.subnet.id) {
                iface.subnet_id = Some(binding.subnet.id);
                changed = true;
            }
            if let Some(address) = iface.address {
                if address.prefix() != binding.prefix {
                    if let Ok(adjusted) = IpNetwork::new(address.ip(), binding.prefix) {
                        iface.address = Some(adjusted);
                        changed = true;
                    }
                }
            }
        }
        changed
    })
}

/// Bring the node's parent subnets in line with its interfaces.
///
/// Every bindable interface address gets a subnet and a link to it,
/// the primary address gets an inferred subnet when none covers it, and
/// parent subnets covering neither the primary address nor any
/// interface address are dropped. Returns `true` if anything changed.
pub(crate) async fn audit(engine: &Engine, node: &Node) -> bool {
    let node_id = node.id();
    let (zone_id, primary, interfaces) = node.read(|d| {
        let interfaces: Vec<Interface> = d
            .interfaces
            .iter()
            .filter(|i| i.address.is_some() && !i.cluster_sync && !i.is_nat_adapter())
            .cloned()
            .collect();
        (d.zone_id, d.primary_ip, interfaces)
    });

    let mut changed = false;

    for iface in &interfaces {
        let Some(address) = iface.address else { continue };
        let Some(binding) = bind_address(engine, node_id, zone_id, address, iface.synthetic_mask).await else {
            continue;
        };
        let newly_bound = iface.subnet_id != Some(binding.subnet.id);
        if attach(node, iface.id, &binding) {
            debug!(node_id, subnet_id = binding.subnet.id, if_index = iface.if_index, "restored subnet link");
            changed = true;
        }
        if newly_bound {
            if let Some(subnet_prefix) = binding.mismatch {
                report_mismatch(engine, node_id, iface, subnet_prefix);
            }
        }
    }

    if is_bindable(primary) {
        let in_parent = node
            .read(|d| d.subnets.clone())
            .into_iter()
            .filter_map(|id| engine.registry.subnet(id))
            .any(|s| s.contains(primary));
        if !in_parent {
            let inferred = IpNetwork::new(primary, synthetic_prefix(primary)).ok();
            if let Some(address) = inferred {
                if let Some(binding) = bind_address(engine, node_id, zone_id, address, true).await {
                    info!(node_id, subnet_id = binding.subnet.id, "bound primary address to subnet");
                    node.update(|d| d.subnets.insert(binding.subnet.id));
                    changed = true;
                }
            }
        }
    }

    let parents = node.read(|d| d.subnets.clone());
    for subnet_id in parents {
        let keep = engine.registry.subnet(subnet_id).is_some_and(|s| {
            s.contains(primary) || interfaces.iter().filter_map(Interface::ip).any(|ip| s.contains(ip))
        });
        if !keep {
            info!(node_id, subnet_id, "node no longer belongs to subnet, unlinking");
            node.update(|d| {
                d.subnets.remove(&subnet_id);
                for iface in &mut d.interfaces {
                    if iface.subnet_id == Some(subnet_id) {
                        iface.subnet_id = None;
                    }
                }
            });
            engine.unbind_subnet(node_id, subnet_id).await;
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_addresses_do_not_bind() {
        assert!(!is_bindable(IpAddr::from([127, 0, 0, 1])));
        assert!(!is_bindable(IpAddr::from([0, 0, 0, 0])));
        assert!(!is_bindable(IpAddr::from([169, 254, 1, 1])));
        assert!(!is_bindable(IpAddr::from([224, 0, 0, 5])));
        assert!(is_bindable(IpAddr::from([10, 0, 0, 1])));
    }
}
