// ── Connectivity probes ──
//
// One reachability test per enabled protocol. Outcomes go through the
// capability state machine; the resulting OK/FAIL events are queued on
// the cycle's deferred queue.

use netpoll_transport::{SnmpError, SnmpTransport};
use tracing::{debug, info, warn};

use super::capability::{self, Transition};
use super::session::{AgentLease, open_snmp};
use super::Engine;
use crate::events::DeferredEvents;
use crate::model::{EventCode, Node, Protocol};

/// Custom attribute overriding the OID fetched by the SNMP probe.
pub const TEST_OID_ATTRIBUTE: &str = "snmp.testoid";

/// Read by the CheckPoint probe on the alternate port.
pub const CHECKPOINT_TEST_OID: &str = ".1.3.6.1.4.1.2620.1.1.10.0";

fn transition_events(protocol: Protocol) -> (EventCode, EventCode) {
    match protocol {
        Protocol::Snmp => (EventCode::SnmpOk, EventCode::SnmpFail),
        Protocol::Agent => (EventCode::AgentOk, EventCode::AgentFail),
        Protocol::CheckPointSnmp => (EventCode::CpSnmpOk, EventCode::CpSnmpFail),
    }
}

/// An SNMP GET proves reachability if the agent answered at all.
pub(crate) async fn snmp_answers(transport: &dyn SnmpTransport, oid: &str) -> bool {
    match transport.get(oid).await {
        Ok(_) => true,
        Err(e) if e.agent_answered() => true,
        Err(SnmpError::Timeout) => false,
        Err(e) => {
            debug!(oid, error = %e, "SNMP probe failed");
            false
        }
    }
}

/// Fold one outcome into the node and queue the transition event.
pub(crate) fn record(
    engine: &Engine,
    node: &Node,
    protocol: Protocol,
    reachable: bool,
    deferred: &mut DeferredEvents,
) -> Transition {
    let now = engine.now();
    let window = engine.window();
    let policy = engine.config.demotion_policy;
    let transition = node.update(|d| capability::record_outcome(d, protocol, reachable, now, window, policy));

    let (ok, fail) = transition_events(protocol);
    match transition {
        Transition::Recovered => {
            info!(node_id = node.id(), %protocol, "protocol reachable again");
            deferred.push(engine.event(ok, node.id()));
        }
        Transition::Failed => {
            info!(node_id = node.id(), %protocol, "protocol unreachable");
            deferred.push(engine.event(fail, node.id()));
        }
        Transition::Demoted => {
            warn!(
                node_id = node.id(),
                %protocol,
                "capability expired after continuous failure, marking protocol unsupported"
            );
        }
        Transition::None => {}
    }
    transition
}

async fn probe_snmp(engine: &Engine, node: &Node) -> bool {
    let oid = node.read(|d| {
        d.custom_attributes
            .get(TEST_OID_ATTRIBUTE)
            .cloned()
            .unwrap_or_else(|| engine.config.snmp.test_oid.clone())
    });
    match open_snmp(engine, node, None) {
        Some(transport) => snmp_answers(transport.as_ref(), &oid).await,
        None => false,
    }
}

async fn probe_checkpoint(engine: &Engine, node: &Node) -> bool {
    match open_snmp(engine, node, Some(engine.config.snmp.checkpoint_port)) {
        Some(transport) => snmp_answers(transport.as_ref(), CHECKPOINT_TEST_OID).await,
        None => false,
    }
}

async fn probe_agent(engine: &Engine, node: &Node) -> bool {
    let mut lease = match AgentLease::acquire(engine, node).await {
        Ok(lease) => lease,
        Err(e) => {
            debug!(node_id = node.id(), error = %e, "cannot connect to agent");
            return false;
        }
    };
    match lease.nop().await {
        Ok(()) => true,
        Err(e) => {
            debug!(node_id = node.id(), error = %e, "agent liveness check failed");
            lease.discard().await;
            false
        }
    }
}

/// Probe every enabled protocol once.
///
/// CheckPoint SNMP is only tried when plain SNMP did not just answer.
/// Returns `true` if any capability was demoted.
pub(crate) async fn probe_all(engine: &Engine, node: &Node, deferred: &mut DeferredEvents) -> bool {
    let mut demoted = false;

    let mut snmp_confirmed = false;
    if node.read(|d| d.protocol_enabled(Protocol::Snmp)) {
        let reachable = probe_snmp(engine, node).await;
        snmp_confirmed = reachable;
        demoted |= record(engine, node, Protocol::Snmp, reachable, deferred) == Transition::Demoted;
    }

    if engine.config.snmp.enable_checkpoint
        && !snmp_confirmed
        && node.read(|d| d.protocol_enabled(Protocol::CheckPointSnmp))
    {
        let reachable = probe_checkpoint(engine, node).await;
        demoted |= record(engine, node, Protocol::CheckPointSnmp, reachable, deferred) == Transition::Demoted;
    }

    if engine.transports.agent.is_some() && node.read(|d| d.protocol_enabled(Protocol::Agent)) {
        let reachable = probe_agent(engine, node).await;
        demoted |= record(engine, node, Protocol::Agent, reachable, deferred) == Transition::Demoted;
    }

    demoted
}

/// Every protocol the node still uses is currently failing. A node
/// with no enabled protocol is treated as failing too.
pub(crate) fn all_protocols_down(node: &Node) -> bool {
    node.read(|d| {
        Protocol::ALL
            .into_iter()
            .filter(|&p| d.protocol_enabled(p))
            .all(|p| d.dynamic.contains(p.unreachable()))
    })
}

/// The protocol is in use and answered its last probe.
pub(crate) fn reachable_over(node: &Node, protocol: Protocol) -> bool {
    node.read(|d| d.protocol_enabled(protocol) && !d.dynamic.contains(protocol.unreachable()))
}
