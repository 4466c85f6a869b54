// ── Configuration poll ──
//
// Re-detects what the node speaks, rediscovers its interfaces and
// brings subnet links, the name and system templates in line. Runs
// under the node's poller lock from start to finish.

use netpoll_transport::snmp::{format_oid, parse_oid};
use netpoll_transport::{AgentError, SnmpTransport, SnmpValue, SnmpVersion};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::discovery;
use super::probe::{CHECKPOINT_TEST_OID, snmp_answers};
use super::session::{AgentLease, SnmpParams, open_snmp, open_snmp_with};
use super::{Engine, artifacts, capability, names, reconcile, subnets, templates};
use crate::model::node_type::{CHECKPOINT_OBJECT_ID, UNKNOWN_OBJECT_ID, classify};
use crate::model::{DynamicFlags, EventCode, Node, NodeData, NodeFlags, Protocol};

const SYS_DESCR: &str = ".1.3.6.1.2.1.1.1.0";
const SYS_OBJECT_ID: &str = ".1.3.6.1.2.1.1.2.0";
const SYS_NAME: &str = ".1.3.6.1.2.1.1.5.0";
const IP_FORWARDING: &str = ".1.3.6.1.2.1.4.1.0";

/// Flags learned from SNMP; cleared before every detection pass.
const SNMP_DERIVED: NodeFlags = NodeFlags::IS_BRIDGE
    .union(NodeFlags::IS_ROUTER)
    .union(NodeFlags::IS_CDP)
    .union(NodeFlags::IS_SONMP)
    .union(NodeFlags::IS_LLDP)
    .union(NodeFlags::IS_OSPF)
    .union(NodeFlags::IS_STP)
    .union(NodeFlags::IS_8021X);

/// Independent feature checks: the OID merely has to exist.
const FEATURE_CHECKS: [(&str, NodeFlags); 7] = [
    (".1.3.6.1.2.1.17.1.1.0", NodeFlags::IS_BRIDGE),
    (".1.3.6.1.4.1.9.9.23.1.3.1.0", NodeFlags::IS_CDP),
    (".1.3.6.1.4.1.45.1.6.13.1.2.0", NodeFlags::IS_SONMP),
    (".1.0.8802.1.1.2.1.3.2.0", NodeFlags::IS_LLDP),
    (".1.3.6.1.2.1.14.1.1.0", NodeFlags::IS_OSPF),
    (".1.3.6.1.2.1.17.2.1.0", NodeFlags::IS_STP),
    (".1.0.8802.1.1.1.1.1.1.0", NodeFlags::IS_8021X),
];

/// How a configuration poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPollOutcome {
    /// The node is unreachable and no recheck was requested.
    Skipped,
    Completed { changed: bool },
}

/// Line breaks become single spaces.
pub(crate) fn normalize_text(text: &str) -> String {
    text.replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
        .trim()
        .to_owned()
}

/// Whether detection should be attempted for `protocol` this cycle.
/// Disabled capabilities wait for a recheck; a supported protocol that
/// failed its last probe is left to the status poll.
fn should_detect(data: &NodeData, protocol: Protocol) -> bool {
    !data.flags.intersects(protocol.disabled_by() | protocol.lost())
        && !(data.flags.contains(protocol.capability()) && data.dynamic.contains(protocol.unreachable()))
}

// ── SNMP ────────────────────────────────────────────────────────────

/// Find working SNMP settings: stored ones first, then the other
/// version, then every configured community in both versions.
async fn negotiate(engine: &Engine, node: &Node) -> Option<(SnmpParams, Box<dyn SnmpTransport>)> {
    let own = node.read(SnmpParams::of);
    let mut candidates = vec![
        own.clone(),
        SnmpParams {
            version: own.version.fallback(),
            ..own.clone()
        },
    ];
    for community in &engine.config.snmp.communities {
        if community.expose_secret() == own.community.expose_secret() {
            continue;
        }
        for version in [SnmpVersion::V2c, SnmpVersion::V1] {
            candidates.push(SnmpParams {
                port: own.port,
                version,
                community: community.clone(),
            });
        }
    }

    for params in candidates {
        let Some(transport) = open_snmp_with(engine, node, &params) else {
            continue;
        };
        if snmp_answers(transport.as_ref(), SYS_OBJECT_ID).await {
            return Some((params, transport));
        }
        debug!(node_id = node.id(), version = %params.version, port = params.port, "SNMP settings rejected");
    }
    None
}

fn canonical_oid(value: &SnmpValue) -> Option<String> {
    let text = value.as_text();
    parse_oid(&text).ok().map(|arcs| format_oid(&arcs))
}

async fn read_text(transport: &dyn SnmpTransport, oid: &str) -> Option<String> {
    transport.get(oid).await.ok().map(|v| normalize_text(&v.as_text()))
}

async fn snmp_features(transport: &dyn SnmpTransport) -> NodeFlags {
    let mut found = NodeFlags::empty();
    if let Ok(value) = transport.get(IP_FORWARDING).await {
        if value.as_i64() == Some(1) {
            found |= NodeFlags::IS_ROUTER;
        }
    }
    for (oid, flag) in FEATURE_CHECKS {
        match transport.get(oid).await {
            Ok(SnmpValue::Null) | Err(_) => {}
            Ok(_) => found |= flag,
        }
    }
    found
}

/// Returns `true` if anything on the node changed.
async fn detect_snmp(engine: &Engine, node: &Node) -> bool {
    let node_id = node.id();
    let Some((params, transport)) = negotiate(engine, node).await else {
        debug!(node_id, "no SNMP response");
        return detect_checkpoint(engine, node).await;
    };
    let transport = transport.as_ref();

    let object_id = match transport.get(SYS_OBJECT_ID).await {
        Ok(value) => canonical_oid(&value).unwrap_or_else(|| UNKNOWN_OBJECT_ID.to_owned()),
        Err(_) => UNKNOWN_OBJECT_ID.to_owned(),
    };
    let (node_type, type_flags) = classify(&object_id, &engine.config.oid_types);
    let description = read_text(transport, SYS_DESCR).await;
    let sys_name = read_text(transport, SYS_NAME).await;
    let features = snmp_features(transport).await | type_flags;

    node.update(|d| {
        let mut changed = false;
        if d.snmp.version != params.version
            || d.snmp.port != params.port
            || d.snmp.community.expose_secret() != params.community.expose_secret()
        {
            info!(node_id, version = %params.version, "SNMP settings changed");
            d.snmp.version = params.version;
            d.snmp.port = params.port;
            d.snmp.community = params.community.clone();
            changed = true;
        }
        if !d.flags.contains(NodeFlags::IS_SNMP) {
            changed = true;
        }
        capability::confirm(d, Protocol::Snmp);

        if d.snmp_object_id != object_id {
            d.snmp_object_id.clone_from(&object_id);
            changed = true;
        }
        if d.node_type != node_type {
            d.node_type = node_type;
            changed = true;
        }
        if let Some(description) = description {
            if d.sys_description != description {
                debug!(node_id, "system description changed");
                d.sys_description = description;
                changed = true;
            }
        }
        if let Some(sys_name) = sys_name {
            if d.sys_name != sys_name {
                d.sys_name = sys_name;
                changed = true;
            }
        }
        d.flags.remove(SNMP_DERIVED);
        d.flags.insert(features);
        changed
    })
}

async fn detect_checkpoint(engine: &Engine, node: &Node) -> bool {
    if !engine.config.snmp.enable_checkpoint || !node.read(|d| should_detect(d, Protocol::CheckPointSnmp)) {
        return false;
    }
    let Some(transport) = open_snmp(engine, node, Some(engine.config.snmp.checkpoint_port)) else {
        return false;
    };
    if !snmp_answers(transport.as_ref(), CHECKPOINT_TEST_OID).await {
        return false;
    }
    info!(node_id = node.id(), "CheckPoint SNMP agent answered");
    let (node_type, type_flags) = classify(CHECKPOINT_OBJECT_ID, &engine.config.oid_types);
    node.update(|d| {
        let was = d.flags;
        capability::confirm(d, Protocol::CheckPointSnmp);
        d.flags.insert(NodeFlags::IS_ROUTER | type_flags);
        let changed = was != d.flags || d.snmp_object_id != CHECKPOINT_OBJECT_ID;
        d.snmp_object_id = CHECKPOINT_OBJECT_ID.to_owned();
        d.node_type = node_type;
        changed
    })
}

// ── Agent ───────────────────────────────────────────────────────────

struct AgentFacts {
    version: Option<String>,
    platform: Option<String>,
    forwarding: bool,
    uname: Option<String>,
}

async fn fact(lease: &mut AgentLease<'_>, name: &str) -> Option<String> {
    lease
        .get_parameter(name)
        .await
        .ok()
        .map(|v| normalize_text(&v))
        .filter(|v| !v.is_empty())
}

async fn read_facts(lease: &mut AgentLease<'_>) -> AgentFacts {
    AgentFacts {
        version: fact(lease, "Agent.Version").await,
        platform: fact(lease, "System.PlatformName").await,
        forwarding: fact(lease, "Net.IP.Forwarding").await.is_some_and(|v| v == "1"),
        uname: fact(lease, "System.Uname").await,
    }
}

/// Returns `true` if anything on the node changed.
async fn detect_agent(engine: &Engine, node: &Node) -> bool {
    let node_id = node.id();
    let mut changed = false;

    let mut lease = match AgentLease::acquire(engine, node).await {
        Ok(lease) => lease,
        Err(AgentError::AuthFailed) => {
            let fallback = engine.config.agent.default_secret.clone();
            match AgentLease::acquire_with(engine, node, Some(fallback.clone())).await {
                Ok(lease) => {
                    info!(node_id, "agent accepted the default shared secret");
                    node.update(|d| d.agent.secret = fallback);
                    changed = true;
                    lease
                }
                Err(e) => {
                    debug!(node_id, error = %e, "agent rejected the default shared secret");
                    return false;
                }
            }
        }
        Err(e) => {
            debug!(node_id, error = %e, "no native agent");
            return false;
        }
    };

    let facts = read_facts(&mut lease).await;
    drop(lease);

    changed |= node.update(|d| {
        let mut changed = !d.flags.contains(NodeFlags::IS_NATIVE_AGENT);
        capability::confirm(d, Protocol::Agent);
        if let Some(version) = facts.version {
            if d.agent_version != version {
                d.agent_version = version;
                changed = true;
            }
        }
        if let Some(platform) = facts.platform {
            if d.platform_name != platform {
                d.platform_name = platform;
                changed = true;
            }
        }
        if facts.forwarding {
            d.flags.insert(NodeFlags::IS_ROUTER);
        }
        // SNMP sysDescr wins when both are known.
        if let Some(uname) = facts.uname {
            if !d.flags.contains(NodeFlags::IS_SNMP) && d.sys_description != uname {
                d.sys_description = uname;
                changed = true;
            }
        }
        changed
    });

    match artifacts::fetch_parameters(engine, node).await {
        Ok(list) => {
            debug!(node_id, count = list.len(), "agent parameter catalog refreshed");
            node.parameters.store(list, engine.now());
        }
        Err(e) => debug!(node_id, error = %e, "agent parameter catalog unavailable"),
    }
    changed
}

// ── Cycle ───────────────────────────────────────────────────────────

fn flags_hex(flags: NodeFlags) -> String {
    format!("0x{:08X}", flags.bits())
}

pub(crate) async fn run(engine: &Engine, node: &Node) -> ConfigPollOutcome {
    let _poller = node.lock_poller().await;
    let node_id = node.id();
    let forced = node.dynamic().contains(DynamicFlags::RECHECK_CAPABILITIES);
    let old_flags = node.flags();

    if forced {
        info!(node_id, "capability recheck requested, discarding detected capabilities");
        node.update(capability::force_recheck);
        node.drop_agent_connection().await;
    } else if node.is_unreachable() {
        debug!(node_id, "node unreachable, configuration poll skipped");
        let now = engine.now();
        node.update(|d| d.last_config_poll = Some(now));
        return ConfigPollOutcome::Skipped;
    }

    debug!(node_id, forced, "configuration poll started");
    let mut changed = forced;

    if node.read(|d| should_detect(d, Protocol::Snmp)) {
        changed |= detect_snmp(engine, node).await;
    }
    if engine.transports.agent.is_some() && node.read(|d| should_detect(d, Protocol::Agent)) {
        changed |= detect_agent(engine, node).await;
    }

    let new_flags = node.flags();
    if new_flags != old_flags {
        info!(node_id, old = %flags_hex(old_flags), new = %flags_hex(new_flags), "node flags changed");
        engine.post(
            engine
                .event(EventCode::NodeFlagsChanged, node_id)
                .arg("oldFlags", flags_hex(old_flags))
                .arg("newFlags", flags_hex(new_flags)),
        );
        changed = true;
    }

    changed |= match discovery::discover(engine, node).await {
        Some((source, rows)) => {
            debug!(node_id, %source, count = rows.len(), "interfaces discovered");
            reconcile::reconcile(engine, node, &rows).await
        }
        None => {
            debug!(node_id, "interface discovery failed");
            reconcile::reconcile_without_discovery(engine, node, forced).await
        }
    };

    changed |= subnets::audit(engine, node).await;
    changed |= names::resolve_name(engine, node).await;
    changed |= templates::apply_system_templates(engine, node);

    let now = engine.now();
    node.update(|d| {
        d.last_config_poll = Some(now);
        d.dynamic.insert(DynamicFlags::CONFIG_POLL_PASSED);
        d.dynamic.remove(DynamicFlags::RECHECK_CAPABILITIES);
    });
    if changed {
        engine.persist_node(node).await;
    }
    debug!(node_id, changed, "configuration poll finished");
    ConfigPollOutcome::Completed { changed }
}
