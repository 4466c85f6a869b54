// ── Capability state machine ──
//
// Per protocol:  Unknown -> Reachable <-> Unreachable -> Disabled,
// and Disabled -> Unknown only through `force_recheck`. Every function
// here works on `NodeData` and is meant to run under the data lock.

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::DemotionPolicy;
use crate::model::{DynamicFlags, NodeData, NodeFlags, NodeType, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    /// Never detected, or wiped by a recheck.
    Unknown,
    Reachable,
    Unreachable { since: DateTime<Utc> },
    /// Expired; only a forced recheck brings it back.
    Disabled,
}

/// What a single probe outcome did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Unreachable -> Reachable.
    Recovered,
    /// Reachable -> Unreachable.
    Failed,
    /// Unreachable -> Disabled.
    Demoted,
}

pub fn state(data: &NodeData, protocol: Protocol) -> CapabilityState {
    if data.flags.contains(protocol.lost()) {
        return CapabilityState::Disabled;
    }
    if !data.flags.contains(protocol.capability()) {
        return CapabilityState::Unknown;
    }
    if data.dynamic.contains(protocol.unreachable()) {
        let since = data.failures.get(protocol).unwrap_or(DateTime::<Utc>::MIN_UTC);
        return CapabilityState::Unreachable { since };
    }
    CapabilityState::Reachable
}

/// Fold one probe result into the node.
///
/// Only the first failure of a streak and the first success after one
/// produce a transition. A capability is demoted once it has been
/// failing for strictly longer than `window`, and only when `policy`
/// allows it given the node's aggregate reachability.
pub fn record_outcome(
    data: &mut NodeData,
    protocol: Protocol,
    reachable: bool,
    now: DateTime<Utc>,
    window: TimeDelta,
    policy: DemotionPolicy,
) -> Transition {
    let flag = protocol.unreachable();

    if reachable {
        data.failures.set(protocol, None);
        if data.dynamic.contains(flag) {
            data.dynamic.remove(flag);
            return Transition::Recovered;
        }
        return Transition::None;
    }

    if !data.dynamic.contains(flag) {
        data.dynamic.insert(flag);
        data.failures.set(protocol, Some(now));
        return Transition::Failed;
    }

    let since = if let Some(since) = data.failures.get(protocol) {
        since
    } else {
        data.failures.set(protocol, Some(now));
        now
    };
    if now - since > window && policy.allows(data.is_unreachable()) {
        demote(data, protocol);
        return Transition::Demoted;
    }
    Transition::None
}

/// Mark a protocol unsupported and drop what was learned through it.
pub fn demote(data: &mut NodeData, protocol: Protocol) {
    data.flags.remove(protocol.capability());
    data.flags.insert(protocol.lost());
    data.dynamic.remove(protocol.unreachable());
    data.failures.set(protocol, None);
    match protocol {
        Protocol::Snmp => data.snmp_object_id.clear(),
        Protocol::Agent => {
            data.platform_name.clear();
            data.agent_version.clear();
        }
        Protocol::CheckPointSnmp => {}
    }
}

/// Wipe every detected capability and descriptive field so the next
/// configuration poll starts from scratch.
pub fn force_recheck(data: &mut NodeData) {
    data.flags.remove(NodeFlags::DETECTED | NodeFlags::LOST);
    data.dynamic.remove(DynamicFlags::PROTOCOL_UNREACHABLE);
    for protocol in Protocol::ALL {
        data.failures.set(protocol, None);
    }
    data.node_type = NodeType::Generic;
    data.snmp_object_id.clear();
    data.sys_description.clear();
    data.sys_name.clear();
    data.platform_name.clear();
    data.agent_version.clear();
}

/// Mark a protocol supported after successful detection.
pub fn confirm(data: &mut NodeData, protocol: Protocol) {
    data.flags.insert(protocol.capability());
    data.flags.remove(protocol.lost());
    data.dynamic.remove(protocol.unreachable());
    data.failures.set(protocol, None);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{Node, NodeRecord};

    fn data() -> NodeData {
        let mut record = NodeRecord::new(1, "n", "10.0.0.1".parse().unwrap());
        record.flags = NodeFlags::IS_SNMP | NodeFlags::IS_NATIVE_AGENT;
        record.snmp_object_id = ".1.3.6.1.4.1.9.1.1".into();
        record.platform_name = "linux-x64".into();
        Node::from_record(&record, Duration::from_secs(60)).read(Clone::clone)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn week() -> TimeDelta {
        TimeDelta::weeks(1)
    }

    #[test]
    fn only_first_failure_transitions() {
        let mut d = data();
        let policy = DemotionPolicy::default();
        let transitions: Vec<Transition> = (0..5)
            .map(|i| record_outcome(&mut d, Protocol::Snmp, false, t0() + TimeDelta::minutes(i), week(), policy))
            .collect();
        assert_eq!(transitions[0], Transition::Failed);
        assert!(transitions[1..].iter().all(|t| *t == Transition::None));
        assert_eq!(
            state(&d, Protocol::Snmp),
            CapabilityState::Unreachable { since: t0() }
        );
    }

    #[test]
    fn recovery_transitions_once() {
        let mut d = data();
        let policy = DemotionPolicy::default();
        record_outcome(&mut d, Protocol::Agent, false, t0(), week(), policy);
        assert_eq!(
            record_outcome(&mut d, Protocol::Agent, true, t0(), week(), policy),
            Transition::Recovered
        );
        assert_eq!(
            record_outcome(&mut d, Protocol::Agent, true, t0(), week(), policy),
            Transition::None
        );
        assert_eq!(state(&d, Protocol::Agent), CapabilityState::Reachable);
    }

    #[test]
    fn demotion_needs_strictly_longer_than_window() {
        let mut d = data();
        let policy = DemotionPolicy::default();
        record_outcome(&mut d, Protocol::Snmp, false, t0(), week(), policy);

        let at_window = record_outcome(&mut d, Protocol::Snmp, false, t0() + week(), week(), policy);
        assert_eq!(at_window, Transition::None);

        let past = record_outcome(
            &mut d,
            Protocol::Snmp,
            false,
            t0() + week() + TimeDelta::seconds(1),
            week(),
            policy,
        );
        assert_eq!(past, Transition::Demoted);
        assert_eq!(state(&d, Protocol::Snmp), CapabilityState::Disabled);
        assert!(d.snmp_object_id.is_empty());
    }

    #[test]
    fn unreachable_node_keeps_capability_under_default_policy() {
        let mut d = data();
        d.dynamic.insert(DynamicFlags::UNREACHABLE);
        record_outcome(&mut d, Protocol::Agent, false, t0(), week(), DemotionPolicy::default());
        let later = t0() + week() * 2;
        assert_eq!(
            record_outcome(&mut d, Protocol::Agent, false, later, week(), DemotionPolicy::default()),
            Transition::None
        );
        assert_eq!(
            record_outcome(&mut d, Protocol::Agent, false, later, week(), DemotionPolicy::Always),
            Transition::Demoted
        );
        assert!(d.platform_name.is_empty());
    }

    #[test]
    fn recheck_returns_disabled_to_unknown() {
        let mut d = data();
        demote(&mut d, Protocol::Snmp);
        force_recheck(&mut d);
        assert_eq!(state(&d, Protocol::Snmp), CapabilityState::Unknown);
        assert!(d.sys_description.is_empty());
        assert_eq!(d.node_type, NodeType::Generic);
    }
}
