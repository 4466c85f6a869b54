// ── Engine events ──

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{Display, EnumString};

use super::status::ObjectStatus;

/// Every event the polling engine posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCode {
    // Protocol reachability
    SnmpOk,
    SnmpFail,
    AgentOk,
    AgentFail,
    #[strum(serialize = "CPSNMP_OK")]
    #[serde(rename = "CPSNMP_OK")]
    CpSnmpOk,
    #[strum(serialize = "CPSNMP_FAIL")]
    #[serde(rename = "CPSNMP_FAIL")]
    CpSnmpFail,

    // Node
    NodeDown,
    NodeUp,
    NodeUnreachable,
    NodeFlagsChanged,
    IpAddressChanged,

    // Node status family
    NodeNormal,
    NodeWarning,
    NodeMinor,
    NodeMajor,
    NodeCritical,
    NodeUnknown,
    NodeUnmanaged,

    // Interfaces
    InterfaceAdded,
    InterfaceDeleted,
    InterfaceUp,
    InterfaceDown,
    InterfaceDisabled,
    InterfaceUnknown,
    MacAddrChanged,
    IncorrectNetmask,

    // Services
    ServiceUp,
    ServiceDown,
    ServiceUnknown,

    // Templates
    TemplateAutoapply,
    TemplateAutoremove,
}

impl EventCode {
    /// Event posted when the node's compound status becomes `status`.
    pub fn for_node_status(status: ObjectStatus) -> Self {
        match status {
            ObjectStatus::Normal => Self::NodeNormal,
            ObjectStatus::Warning => Self::NodeWarning,
            ObjectStatus::Minor => Self::NodeMinor,
            ObjectStatus::Major => Self::NodeMajor,
            ObjectStatus::Critical => Self::NodeCritical,
            ObjectStatus::Unknown | ObjectStatus::Disabled => Self::NodeUnknown,
            ObjectStatus::Unmanaged => Self::NodeUnmanaged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub code: EventCode,
    pub node_id: u32,
    pub timestamp: DateTime<Utc>,
    /// Named, pre-formatted arguments in posting order.
    pub args: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(code: EventCode, node_id: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            code,
            node_id,
            timestamp,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, name: &'static str, value: impl ToString) -> Self {
        self.args.push((name, value.to_string()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}
