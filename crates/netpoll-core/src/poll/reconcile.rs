// ── Interface reconciliation ──
//
// `plan` diffs the node's interfaces against a discovered list without
// touching anything; `reconcile` carries the plan out, binding new
// interfaces to subnets and posting the interface events.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use netpoll_transport::{IFTYPE_NAT_ADAPTER, IFTYPE_OTHER, InterfaceInfo};
use tracing::{debug, info};

use super::subnets::{attach, bind_address, report_mismatch};
use super::Engine;
use crate::model::subnet::synthetic_prefix;
use crate::model::{Cluster, EventCode, Interface, Node, NodeFlags};

/// Name given to the NAT pseudo-interface.
pub const NAT_ADAPTER_NAME: &str = "nat_adapter";

/// Name of the interface created from the primary address when
/// discovery yields nothing.
pub const UNKNOWN_INTERFACE_NAME: &str = "unknown";

/// Mutations needed to make the interface list match a discovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Interfaces with no matching discovered row.
    pub delete: Vec<u32>,
    /// Matched interfaces whose name or hardware address changed.
    pub update: Vec<(u32, InterfaceInfo)>,
    /// Rows with no matching interface.
    pub create: Vec<InterfaceInfo>,
    /// NAT pseudo-interfaces that are no longer wanted.
    pub remove_nat: Vec<u32>,
    pub create_nat: bool,
    /// The primary address is missing from the discovery.
    pub behind_nat: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty()
            && self.update.is_empty()
            && self.create.is_empty()
            && self.remove_nat.is_empty()
            && !self.create_nat
    }
}

fn same_row(a: &InterfaceInfo, b: &InterfaceInfo) -> bool {
    a.index == b.index && a.address == b.address
}

/// Work out what reconciling `existing` against `discovered` would do.
///
/// NAT pseudo-interfaces are never matched against rows; they are kept
/// exactly while the primary address is missing from the discovery.
pub fn plan(existing: &[Interface], discovered: &[InterfaceInfo], primary: IpAddr) -> Plan {
    let mut rows: Vec<&InterfaceInfo> = Vec::with_capacity(discovered.len());
    for row in discovered {
        if !rows.iter().any(|r| same_row(r, row)) {
            rows.push(row);
        }
    }

    let (nat, real): (Vec<&Interface>, Vec<&Interface>) =
        existing.iter().partition(|i| i.is_nat_adapter());

    let mut plan = Plan::default();
    for iface in &real {
        match rows.iter().find(|row| iface.matches(row)) {
            None => plan.delete.push(iface.id),
            Some(row) => {
                if iface.name != row.name || iface.mac != row.mac {
                    plan.update.push((iface.id, (*row).clone()));
                }
            }
        }
    }
    plan.create = rows
        .iter()
        .filter(|row| !real.iter().any(|iface| iface.matches(row)))
        .map(|row| (*row).clone())
        .collect();

    let wants_nat = !primary.is_unspecified()
        && !primary.is_loopback()
        && !rows.iter().any(|row| row.ip() == Some(primary));
    let mut kept = false;
    for iface in nat {
        if wants_nat && !kept && iface.ip() == Some(primary) {
            kept = true;
        } else {
            plan.remove_nat.push(iface.id);
        }
    }
    plan.create_nat = wants_nat && !kept;
    plan.behind_nat = wants_nat;
    plan
}

fn host_network(ip: IpAddr) -> Option<IpNetwork> {
    let width = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, width).ok()
}

fn cluster_of(engine: &Engine, node: &Node) -> Option<Arc<Cluster>> {
    node.read(|d| d.cluster).and_then(|id| engine.registry.cluster(id))
}

/// Make BEHIND_NAT match `behind_nat`. Returns `true` on a change.
fn set_behind_nat(node: &Node, behind_nat: bool) -> bool {
    let node_id = node.id();
    let changed = node.update(|d| {
        let was = d.flags.contains(NodeFlags::BEHIND_NAT);
        d.flags.set(NodeFlags::BEHIND_NAT, behind_nat);
        was != behind_nat
    });
    if changed && behind_nat {
        info!(node_id, primary = %node.primary_ip(), "primary address not on any interface, node is behind NAT");
    } else if changed {
        info!(node_id, "primary address found on a real interface, node is no longer behind NAT");
    }
    changed
}

/// Remove interfaces and release subnets none of the remaining
/// interfaces use. Returns the number removed.
async fn remove_interfaces(engine: &Engine, node: &Node, ids: &BTreeSet<u32>) -> usize {
    if ids.is_empty() {
        return 0;
    }
    let node_id = node.id();
    let (removed, orphaned) = node.update(|d| {
        let (removed, kept): (Vec<Interface>, Vec<Interface>) =
            std::mem::take(&mut d.interfaces).into_iter().partition(|i| ids.contains(&i.id));
        d.interfaces = kept;

        let mut orphaned = Vec::new();
        for subnet_id in removed.iter().filter_map(|i| i.subnet_id) {
            let still_used = d.interfaces.iter().any(|i| i.subnet_id == Some(subnet_id));
            if !still_used && !orphaned.contains(&subnet_id) {
                orphaned.push(subnet_id);
            }
        }
        (removed, orphaned)
    });

    for iface in &removed {
        info!(node_id, if_index = iface.if_index, name = %iface.name, "interface deleted");
        engine.post(
            engine
                .event(EventCode::InterfaceDeleted, node_id)
                .arg("interfaceIndex", iface.if_index)
                .arg("interfaceName", &iface.name)
                .arg("ipAddress", iface.ip().map(|ip| ip.to_string()).unwrap_or_default())
                .arg("netMask", iface.prefix()),
        );
    }

    let primary = node.primary_ip();
    for subnet_id in orphaned {
        let covers_primary = engine
            .registry
            .subnet(subnet_id)
            .is_some_and(|s| s.contains(primary));
        if covers_primary {
            continue;
        }
        debug!(node_id, subnet_id, "last interface in subnet removed, unlinking");
        node.update(|d| d.subnets.remove(&subnet_id));
        engine.unbind_subnet(node_id, subnet_id).await;
    }
    removed.len()
}

/// Create one interface from a discovered row and bind it to its subnet.
async fn create_interface(engine: &Engine, node: &Node, row: &InterfaceInfo, cluster: Option<&Cluster>) {
    let node_id = node.id();
    let zone_id = node.read(|d| d.zone_id);

    let mut iface = Interface::from_discovered(engine.registry.allocate_id(), row);
    if let Some(address) = row.address {
        let ip = address.ip();
        if address.prefix() == 0 {
            iface.address = IpNetwork::new(ip, synthetic_prefix(ip)).ok();
            iface.synthetic_mask = true;
        }
        iface.cluster_sync = cluster.is_some_and(|c| c.is_sync_address(ip));
    }
    let interface_id = iface.id;
    let bindable = if iface.cluster_sync || iface.is_nat_adapter() {
        None
    } else {
        iface.address
    };
    let synthetic_mask = iface.synthetic_mask;
    node.update(|d| d.interfaces.push(iface));

    let mut mismatch = None;
    if let Some(address) = bindable {
        if let Some(binding) = bind_address(engine, node_id, zone_id, address, synthetic_mask).await {
            attach(node, interface_id, &binding);
            mismatch = binding.mismatch;
        }
    }

    let Some(created) = node.read(|d| d.interfaces.iter().find(|i| i.id == interface_id).cloned()) else {
        return;
    };
    info!(node_id, if_index = created.if_index, name = %created.name, address = ?created.address, "interface added");
    engine.post(
        engine
            .event(EventCode::InterfaceAdded, node_id)
            .arg("interfaceIndex", created.if_index)
            .arg("interfaceName", &created.name)
            .arg("ipAddress", created.ip().map(|ip| ip.to_string()).unwrap_or_default())
            .arg("netMask", created.prefix()),
    );
    if let Some(subnet_prefix) = mismatch {
        report_mismatch(engine, node_id, &created, subnet_prefix);
    }
}

/// Bring the node's interfaces in line with `discovered`.
/// Returns `true` if anything changed.
pub(crate) async fn reconcile(engine: &Engine, node: &Node, discovered: &[InterfaceInfo]) -> bool {
    let node_id = node.id();
    let (existing, primary) = node.read(|d| (d.interfaces.clone(), d.primary_ip));
    let plan = plan(&existing, discovered, primary);
    let flag_changed = set_behind_nat(node, plan.behind_nat);
    if plan.is_empty() {
        debug!(node_id, "interfaces unchanged");
        return flag_changed;
    }
    debug!(
        node_id,
        delete = plan.delete.len(),
        update = plan.update.len(),
        create = plan.create.len(),
        "reconciling interfaces"
    );

    let doomed: BTreeSet<u32> = plan.delete.iter().chain(&plan.remove_nat).copied().collect();
    remove_interfaces(engine, node, &doomed).await;

    for (id, row) in &plan.update {
        let changed_mac = node.update(|d| {
            let iface = d.interfaces.iter_mut().find(|i| i.id == *id)?;
            iface.name.clone_from(&row.name);
            if iface.mac == row.mac {
                return None;
            }
            let old = std::mem::replace(&mut iface.mac, row.mac.clone());
            Some((iface.if_index, iface.name.clone(), old))
        });
        if let Some((if_index, name, old)) = changed_mac {
            info!(node_id, if_index, "hardware address changed");
            engine.post(
                engine
                    .event(EventCode::MacAddrChanged, node_id)
                    .arg("interfaceIndex", if_index)
                    .arg("interfaceName", name)
                    .arg("oldMacAddr", old.map(|m| m.to_string()).unwrap_or_default())
                    .arg("newMacAddr", row.mac.as_ref().map(ToString::to_string).unwrap_or_default()),
            );
        }
    }

    let cluster = cluster_of(engine, node);
    for row in &plan.create {
        create_interface(engine, node, row, cluster.as_deref()).await;
    }

    if plan.create_nat {
        let adapter = InterfaceInfo {
            index: 0,
            name: NAT_ADAPTER_NAME.to_owned(),
            if_type: IFTYPE_NAT_ADAPTER,
            mac: None,
            address: host_network(primary),
        };
        create_interface(engine, node, &adapter, None).await;
    }
    true
}

/// Handle a configuration poll where no discovery source answered.
///
/// A capability recheck drops every interface, the NAT adapter with
/// them; afterwards, a node left without interfaces gets one built from
/// its primary address.
pub(crate) async fn reconcile_without_discovery(engine: &Engine, node: &Node, recheck: bool) -> bool {
    let mut changed = false;
    if recheck {
        let all: BTreeSet<u32> = node.read(|d| d.interfaces.iter().map(|i| i.id).collect());
        changed |= remove_interfaces(engine, node, &all).await > 0;
        changed |= set_behind_nat(node, false);
    }

    let (empty, primary) = node.read(|d| (d.interfaces.is_empty(), d.primary_ip));
    if empty && !primary.is_unspecified() && !primary.is_multicast() {
        let row = InterfaceInfo {
            index: 1,
            name: UNKNOWN_INTERFACE_NAME.to_owned(),
            if_type: IFTYPE_OTHER,
            mac: None,
            address: IpNetwork::new(primary, 0).ok(),
        };
        let cluster = cluster_of(engine, node);
        create_interface(engine, node, &row, cluster.as_deref()).await;
        changed = true;
    }
    changed
}
