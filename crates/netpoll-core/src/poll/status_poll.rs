// ── Status poll ──
//
// Probe, poll children, decide reachability, flush the cycle's events,
// then roll up the compound status. The poller lock is held for the
// whole cycle.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use super::children::poll_children;
use super::probe::{self, reachable_over};
use super::session::{AgentLease, open_snmp};
use super::Engine;
use crate::events::DeferredEvents;
use crate::model::{DynamicFlags, EventCode, Node, ObjectStatus, Protocol, compound_status};

const SYS_UP_TIME: &str = ".1.3.6.1.2.1.1.3.0";
const AGENT_UPTIME: &str = "System.Uptime";

/// Why a node stopped or resumed answering, carried on NODE_UP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
enum RecoveryReason {
    ChildResponded,
    ProtocolResponded,
    PathRestored,
}

/// Node that runs service checks for `node`: its own poller node, else
/// the management node. `None` means the node checks itself.
fn delegate_of(engine: &Engine, node: &Node) -> Option<Arc<Node>> {
    let id = node.read(|d| d.poller_node).or(engine.config.management_node)?;
    let delegate = engine.registry.node(id);
    if delegate.is_none() {
        debug!(node_id = node.id(), delegate_id = id, "delegate poller node not found");
    }
    delegate
}

/// An unreachable node the given node is polled through.
fn broken_path(engine: &Engine, node: &Node) -> Option<u32> {
    let via = node.read(|d| [d.proxy_node, d.snmp_proxy_node, d.poller_node]);
    via.into_iter()
        .flatten()
        .filter(|&id| id != node.id())
        .find(|&id| engine.registry.node(id).is_some_and(|n| n.is_unreachable()))
}

/// Children and protocols all failing. A node without children only
/// counts once a configuration poll had the chance to find some.
fn looks_down(node: &Node) -> bool {
    let children_down = node.read(|d| {
        let statuses = d.child_statuses();
        if statuses.is_empty() {
            d.dynamic.contains(DynamicFlags::CONFIG_POLL_PASSED)
        } else {
            statuses.iter().all(|s| s.counts_as_down())
        }
    });
    children_down && probe::all_protocols_down(node)
}

fn reset_critical_children(node: &Node) {
    node.update(|d| {
        for iface in &mut d.interfaces {
            if iface.status == ObjectStatus::Critical {
                iface.status = ObjectStatus::Unknown;
            }
        }
        for service in &mut d.services {
            if service.status == ObjectStatus::Critical {
                service.status = ObjectStatus::Unknown;
            }
        }
    });
}

/// Fold the cycle's findings into the UNREACHABLE flag, posting
/// NODE_DOWN, NODE_UNREACHABLE or NODE_UP on a transition only.
fn update_reachability(engine: &Engine, node: &Node, deferred: &mut DeferredEvents) -> bool {
    let node_id = node.id();
    let now = engine.now();
    let dynamic = node.dynamic();
    let was_unreachable = dynamic.contains(DynamicFlags::UNREACHABLE);
    let had_path_problem = dynamic.contains(DynamicFlags::NETWORK_PATH_PROBLEM);

    if looks_down(node) {
        if let Some(via) = broken_path(engine, node) {
            reset_critical_children(node);
            deferred.discard();
            if !had_path_problem {
                info!(node_id, via, "node unreachable because of a network path problem");
                node.update(|d| {
                    d.dynamic.insert(DynamicFlags::UNREACHABLE | DynamicFlags::NETWORK_PATH_PROBLEM);
                    d.down_since.get_or_insert(now);
                });
                engine.post(
                    engine
                        .event(EventCode::NodeUnreachable, node_id)
                        .arg("rootCauseNodeId", via),
                );
                return true;
            }
            return false;
        }
        if !was_unreachable || had_path_problem {
            info!(node_id, "node is down");
            node.update(|d| {
                d.dynamic.insert(DynamicFlags::UNREACHABLE);
                d.dynamic.remove(DynamicFlags::NETWORK_PATH_PROBLEM);
                d.down_since.get_or_insert(now);
            });
            deferred.push(engine.event(EventCode::NodeDown, node_id));
            return true;
        }
        return false;
    }

    if was_unreachable {
        let reason = if had_path_problem {
            RecoveryReason::PathRestored
        } else if probe::all_protocols_down(node) {
            RecoveryReason::ChildResponded
        } else {
            RecoveryReason::ProtocolResponded
        };
        let down_since = node.update(|d| {
            d.dynamic.remove(DynamicFlags::UNREACHABLE | DynamicFlags::NETWORK_PATH_PROBLEM);
            d.down_since.take()
        });
        info!(node_id, %reason, "node is up");
        let mut event = engine.event(EventCode::NodeUp, node_id).arg("reason", reason);
        if let Some(since) = down_since {
            event = event.arg("downtimeSeconds", (now - since).num_seconds());
        }
        deferred.push(event);
        return true;
    }
    false
}

/// Uptime in whole seconds as reported by an agent. Zero, negative and
/// out-of-range values are rejected.
pub(crate) fn agent_uptime(raw: &str) -> Option<TimeDelta> {
    let seconds = raw.trim().parse::<i64>().ok().filter(|&s| s > 0)?;
    TimeDelta::try_seconds(seconds)
}

/// Uptime from sysUpTime hundredths of a second.
pub(crate) fn snmp_uptime(ticks: i64) -> Option<TimeDelta> {
    if ticks <= 0 {
        return None;
    }
    TimeDelta::try_milliseconds(ticks.checked_mul(10)?)
}

async fn read_uptime(engine: &Engine, node: &Node) -> Option<TimeDelta> {
    if engine.transports.agent.is_some() && reachable_over(node, Protocol::Agent) {
        if let Ok(mut lease) = AgentLease::acquire(engine, node).await {
            if let Ok(value) = lease.get_parameter(AGENT_UPTIME).await {
                match agent_uptime(&value) {
                    Some(uptime) => return Some(uptime),
                    None => debug!(node_id = node.id(), value = %value, "ignoring agent uptime"),
                }
            }
        }
    }
    if reachable_over(node, Protocol::Snmp) {
        let transport = open_snmp(engine, node, None)?;
        let ticks = transport.get(SYS_UP_TIME).await.ok()?.as_i64()?;
        let uptime = snmp_uptime(ticks);
        if uptime.is_none() {
            debug!(node_id = node.id(), ticks, "ignoring SNMP uptime");
        }
        return uptime;
    }
    None
}

/// Boot time estimated from reported uptime; cleared while down.
async fn refresh_boot_time(engine: &Engine, node: &Node, now: DateTime<Utc>) {
    if node.is_unreachable() {
        node.update(|d| d.boot_time = None);
        return;
    }
    if let Some(uptime) = read_uptime(engine, node).await {
        if let Some(boot) = now.checked_sub_signed(uptime) {
            node.update(|d| d.boot_time = Some(boot));
        }
    }
}

/// Roll up the compound status and announce a change.
pub(crate) fn update_status(engine: &Engine, node: &Node) -> bool {
    let algorithm = engine.config.status_algorithm;
    let (old, new) = node.update(|d| {
        let old = d.status;
        d.status = compound_status(algorithm, &d.child_statuses(), d.managed, d.is_unreachable());
        (old, d.status)
    });
    if old == new {
        return false;
    }
    info!(node_id = node.id(), %old, %new, "node status changed");
    engine.post(
        engine
            .event(EventCode::for_node_status(new), node.id())
            .arg("oldStatus", old)
            .arg("newStatus", new),
    );
    true
}

pub(crate) async fn run(engine: &Engine, node: &Node) {
    let _poller = node.lock_poller().await;
    let node_id = node.id();
    debug!(node_id, "status poll started");

    if engine.config.names.resolve_address_each_poll {
        update_primary_address(engine, node).await;
    }

    let mut deferred = DeferredEvents::new();
    if probe::probe_all(engine, node, &mut deferred).await {
        debug!(node_id, "capability demoted, probing again");
        probe::probe_all(engine, node, &mut deferred).await;
    }

    poll_children(engine, node, delegate_of(engine, node), &mut deferred).await;

    let reachability_changed = update_reachability(engine, node, &mut deferred);
    let now = engine.now();
    refresh_boot_time(engine, node, now).await;

    deferred.flush(engine.sink.as_ref());
    let status_changed = update_status(engine, node);

    node.update(|d| d.last_status_poll = Some(now));
    if reachability_changed || status_changed {
        engine.persist_node(node).await;
    }
    debug!(node_id, status = %node.status(), "status poll finished");
}

/// Re-resolve the primary host name and move the node to the new
/// address. The caller holds the poller lock. Returns `true` if the
/// address changed.
pub(crate) async fn update_primary_address(engine: &Engine, node: &Node) -> bool {
    let node_id = node.id();
    let (name, current, zone_id) = node.read(|d| (d.primary_name.clone(), d.primary_ip, d.zone_id));
    if name.is_empty() || name.parse::<IpAddr>().is_ok() {
        return false;
    }
    let Some(resolved) = engine.resolver.forward(&name).await else {
        warn!(node_id, host = %name, "unable to resolve primary host name");
        return false;
    };
    if resolved == current || resolved.is_unspecified() {
        return false;
    }
    if let Err(e) = engine.registry.rekey_node(node_id, zone_id, resolved) {
        warn!(node_id, new = %resolved, error = %e, "primary address change rejected");
        return false;
    }

    info!(node_id, old = %current, new = %resolved, "primary address changed");
    node.update(|d| d.primary_ip = resolved);
    engine.post(
        engine
            .event(EventCode::IpAddressChanged, node_id)
            .arg("newIpAddress", resolved)
            .arg("oldIpAddress", current),
    );
    node.drop_agent_connection().await;
    node.request_recheck();
    engine.persist_node(node).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_uptime_rejects_nonsense() {
        assert_eq!(agent_uptime(" 3600\n"), Some(TimeDelta::hours(1)));
        assert_eq!(agent_uptime("0"), None);
        assert_eq!(agent_uptime("-5"), None);
        assert_eq!(agent_uptime("abc"), None);
        assert_eq!(agent_uptime("99999999999999999"), None);
    }

    #[test]
    fn snmp_uptime_is_in_hundredths() {
        assert_eq!(snmp_uptime(12_345), Some(TimeDelta::milliseconds(123_450)));
        assert_eq!(snmp_uptime(-1), None);
        assert_eq!(snmp_uptime(i64::MAX), None);
    }
}
