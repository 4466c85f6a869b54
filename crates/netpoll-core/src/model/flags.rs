// ── Node flag sets ──
//
// `NodeFlags` is persisted with the node record; `DynamicFlags` lives
// only in memory and is rebuilt by polling after a restart.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Persisted capability and administrative flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeFlags: u32 {
        const IS_SNMP         = 1 << 0;
        const IS_NATIVE_AGENT = 1 << 1;
        const IS_CPSNMP       = 1 << 2;
        const IS_BRIDGE       = 1 << 3;
        const IS_ROUTER       = 1 << 4;
        const IS_OSPF         = 1 << 5;
        const IS_CDP          = 1 << 6;
        const IS_SONMP        = 1 << 7;
        const IS_LLDP         = 1 << 8;
        const IS_STP          = 1 << 9;
        const IS_8021X        = 1 << 10;
        const BEHIND_NAT      = 1 << 11;
        const IS_LOCAL_MGMT   = 1 << 12;

        const DISABLE_SNMP    = 1 << 16;
        const DISABLE_AGENT   = 1 << 17;

        // Set when a capability expired; cleared only by a forced recheck.
        const SNMP_LOST       = 1 << 24;
        const AGENT_LOST      = 1 << 25;
        const CPSNMP_LOST     = 1 << 26;

        /// Everything the configuration poll derives from probing.
        const DETECTED = Self::IS_SNMP.bits()
            | Self::IS_NATIVE_AGENT.bits()
            | Self::IS_CPSNMP.bits()
            | Self::IS_BRIDGE.bits()
            | Self::IS_ROUTER.bits()
            | Self::IS_OSPF.bits()
            | Self::IS_CDP.bits()
            | Self::IS_SONMP.bits()
            | Self::IS_LLDP.bits()
            | Self::IS_STP.bits()
            | Self::IS_8021X.bits();

        const LOST = Self::SNMP_LOST.bits() | Self::AGENT_LOST.bits() | Self::CPSNMP_LOST.bits();
    }
}

bitflags! {
    /// Transient per-cycle state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DynamicFlags: u32 {
        const SNMP_UNREACHABLE       = 1 << 0;
        const AGENT_UNREACHABLE      = 1 << 1;
        const CPSNMP_UNREACHABLE     = 1 << 2;
        const UNREACHABLE            = 1 << 3;
        const NETWORK_PATH_PROBLEM   = 1 << 4;
        const RECHECK_CAPABILITIES   = 1 << 5;
        const POLLING_DISABLED       = 1 << 6;
        const DELETE_IN_PROGRESS     = 1 << 7;
        const QUEUED_FOR_STATUS_POLL = 1 << 8;
        const QUEUED_FOR_CONFIG_POLL = 1 << 9;
        const CONFIG_POLL_PASSED     = 1 << 10;

        const PROTOCOL_UNREACHABLE = Self::SNMP_UNREACHABLE.bits()
            | Self::AGENT_UNREACHABLE.bits()
            | Self::CPSNMP_UNREACHABLE.bits();
        const QUEUED = Self::QUEUED_FOR_STATUS_POLL.bits() | Self::QUEUED_FOR_CONFIG_POLL.bits();
    }
}

/// A management protocol with its own reachability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Protocol {
    #[strum(serialize = "SNMP")]
    Snmp,
    #[strum(serialize = "agent")]
    Agent,
    #[strum(serialize = "CheckPoint SNMP")]
    CheckPointSnmp,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Self::Snmp, Self::CheckPointSnmp, Self::Agent];

    /// Static flag meaning "supported".
    pub fn capability(self) -> NodeFlags {
        match self {
            Self::Snmp => NodeFlags::IS_SNMP,
            Self::Agent => NodeFlags::IS_NATIVE_AGENT,
            Self::CheckPointSnmp => NodeFlags::IS_CPSNMP,
        }
    }

    /// Static flag meaning "expired, wait for a recheck".
    pub fn lost(self) -> NodeFlags {
        match self {
            Self::Snmp => NodeFlags::SNMP_LOST,
            Self::Agent => NodeFlags::AGENT_LOST,
            Self::CheckPointSnmp => NodeFlags::CPSNMP_LOST,
        }
    }

    /// Administrative override that turns the protocol off.
    pub fn disabled_by(self) -> NodeFlags {
        match self {
            Self::Snmp | Self::CheckPointSnmp => NodeFlags::DISABLE_SNMP,
            Self::Agent => NodeFlags::DISABLE_AGENT,
        }
    }

    pub fn unreachable(self) -> DynamicFlags {
        match self {
            Self::Snmp => DynamicFlags::SNMP_UNREACHABLE,
            Self::Agent => DynamicFlags::AGENT_UNREACHABLE,
            Self::CheckPointSnmp => DynamicFlags::CPSNMP_UNREACHABLE,
        }
    }
}
