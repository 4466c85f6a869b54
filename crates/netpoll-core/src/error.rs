// ── Core error types ──
//
// Poll cycles never surface transient probe failures as errors; those
// end up in dynamic flags and events. What does reach callers is node
// construction and lookup trouble, persistence faults, and
// `LoadCorruption`, the one failure that excludes a node entirely.

use netpoll_transport::{AgentError, SnmpError};
use thiserror::Error;

/// Failure classes used for logging and escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorClass {
    /// Transient; absorbed into unreachable flags and retried next cycle.
    CommFailure,
    /// A capability was demoted after its expiration window.
    CapabilityLost,
    /// Non-fatal mismatch such as a wrong netmask.
    ConfigInconsistency,
    /// Connection reset once, then treated as `CommFailure`.
    Timeout,
    /// Persisted record is unusable; the object is not created.
    LoadCorruption,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Communication ────────────────────────────────────────────────
    #[error("communication with node {node_id} failed: {reason}")]
    CommFailure { node_id: u32, reason: String },

    #[error("request to node {node_id} timed out")]
    Timeout { node_id: u32 },

    #[error("node {node_id} lost capability {capability}")]
    CapabilityLost { node_id: u32, capability: String },

    #[error("configuration inconsistency on node {node_id}: {message}")]
    ConfigInconsistency { node_id: u32, message: String },

    // ── Objects ──────────────────────────────────────────────────────
    #[error("node {node_id} is corrupt: {reason}")]
    LoadCorruption { node_id: u32, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u32 },

    #[error("address {address} already belongs to node {existing}")]
    DuplicateAddress { address: String, existing: u32 },

    #[error("polling disabled for node {node_id}")]
    PollingDisabled { node_id: u32 },

    // ── Persistence ──────────────────────────────────────────────────
    #[error("persistence error: {message}")]
    Persistence { message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("configuration error: {message}")]
    Config { message: String },

    // ── Transport (unattributed) ─────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoreError {
    /// Map to the failure taxonomy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::CommFailure { .. } | Self::Transport(_) => ErrorClass::CommFailure,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::CapabilityLost { .. } => ErrorClass::CapabilityLost,
            Self::LoadCorruption { .. } => ErrorClass::LoadCorruption,
            Self::ConfigInconsistency { .. }
            | Self::NotFound { .. }
            | Self::DuplicateAddress { .. }
            | Self::PollingDisabled { .. }
            | Self::Persistence { .. }
            | Self::Config { .. } => ErrorClass::ConfigInconsistency,
        }
    }

    /// Only corrupt persisted data is escalated past node construction.
    pub fn is_escalated(&self) -> bool {
        self.classify() == ErrorClass::LoadCorruption
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<netpoll_transport::Error> for CoreError {
    fn from(err: netpoll_transport::Error) -> Self {
        match err {
            netpoll_transport::Error::Snmp(SnmpError::Timeout)
            | netpoll_transport::Error::Agent(AgentError::RequestTimeout) => {
                CoreError::Timeout { node_id: 0 }
            }
            netpoll_transport::Error::Snmp(e) => CoreError::Transport(e.to_string()),
            netpoll_transport::Error::Agent(e) => CoreError::Transport(e.to_string()),
            netpoll_transport::Error::Local(reason) => CoreError::CommFailure { node_id: 0, reason },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Persistence {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_load_corruption_escalates() {
        let corrupt = CoreError::LoadCorruption {
            node_id: 7,
            reason: "parent subnet 3 missing".into(),
        };
        assert!(corrupt.is_escalated());
        assert!(!CoreError::Timeout { node_id: 7 }.is_escalated());
        assert!(!CoreError::Transport("refused".into()).is_escalated());
    }

    #[test]
    fn transport_timeouts_map_to_timeout_class() {
        let err = CoreError::from(netpoll_transport::Error::from(AgentError::RequestTimeout));
        assert_eq!(err.classify(), ErrorClass::Timeout);

        let err = CoreError::from(netpoll_transport::Error::from(SnmpError::Comm {
            reason: "port unreachable".into(),
        }));
        assert_eq!(err.classify(), ErrorClass::CommFailure);
    }

    #[test]
    fn class_display_is_kebab_case() {
        assert_eq!(ErrorClass::LoadCorruption.to_string(), "load-corruption");
    }
}
