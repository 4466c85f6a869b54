// ── Node type from sysObjectID ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::flags::NodeFlags;
use crate::config::OidTypeRule;

/// sysObjectID recorded when the agent would not return one.
pub const UNKNOWN_OBJECT_ID: &str = ".0.0";

/// sysObjectID recorded for nodes only reachable through the CheckPoint port.
pub const CHECKPOINT_OBJECT_ID: &str = ".1.3.6.1.4.1.2620.1.1";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeType {
    #[default]
    Generic,
    Router,
    Switch,
    Firewall,
    Server,
    Printer,
}

/// Vendor prefixes known without any configuration.
const BUILTIN: &[(&str, NodeType, NodeFlags)] = &[
    (".1.3.6.1.4.1.2620", NodeType::Firewall, NodeFlags::IS_ROUTER),
    (".1.3.6.1.4.1.2636.1.1.1", NodeType::Router, NodeFlags::IS_ROUTER),
    (".1.3.6.1.4.1.45.3", NodeType::Switch, NodeFlags::IS_BRIDGE),
    (".1.3.6.1.4.1.11.2.3.9.1", NodeType::Printer, NodeFlags::empty()),
    (".1.3.6.1.4.1.311.1.1.3", NodeType::Server, NodeFlags::empty()),
    (".1.3.6.1.4.1.8072.3.2", NodeType::Server, NodeFlags::empty()),
];

/// `true` when `oid` equals `prefix` or sits below it on an arc boundary.
fn under(oid: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('.');
    oid.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Derive node type and extra flags from a sysObjectID.
///
/// Configured rules are consulted first; within each table the longest
/// matching prefix wins.
pub fn classify(object_id: &str, rules: &[OidTypeRule]) -> (NodeType, NodeFlags) {
    let configured = rules
        .iter()
        .filter(|r| under(object_id, &r.prefix))
        .max_by_key(|r| r.prefix.len())
        .map(|r| (r.node_type, r.flags));
    if let Some(found) = configured {
        return found;
    }

    BUILTIN
        .iter()
        .filter(|(prefix, _, _)| under(object_id, prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())
        .map_or((NodeType::Generic, NodeFlags::empty()), |&(_, node_type, flags)| {
            (node_type, flags)
        })
}
