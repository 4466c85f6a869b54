use thiserror::Error;

// ── SNMP ────────────────────────────────────────────────────────────

/// Outcome of an SNMP request that did not yield a value.
///
/// `NoSuchObject` is special: the agent answered, so the protocol is
/// reachable even though the variable is missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnmpError {
    /// The agent responded with noSuchObject / noSuchInstance / endOfMibView.
    #[error("no such object")]
    NoSuchObject,

    /// No response within the configured timeout and retry budget.
    #[error("SNMP request timed out")]
    Timeout,

    /// Socket, encoding, or PDU-level failure.
    #[error("SNMP communication error: {reason}")]
    Comm { reason: String },

    /// The OID string could not be parsed.
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// The transport cannot serve this request (e.g. proxy tunnelling).
    #[error("unsupported SNMP operation: {0}")]
    Unsupported(&'static str),
}

impl SnmpError {
    /// Returns `true` if a response arrived from the agent, even an empty one.
    pub fn agent_answered(&self) -> bool {
        matches!(self, Self::NoSuchObject)
    }
}

// ── Native agent ────────────────────────────────────────────────────

/// Error kinds reported by the native agent RPC layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("agent not connected")]
    NotConnected,

    #[error("agent connection broken")]
    ConnectionBroken,

    #[error("agent request timed out")]
    RequestTimeout,

    #[error("agent authentication failed")]
    AuthFailed,

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("unsupported agent operation: {0}")]
    Unsupported(&'static str),
}

impl AgentError {
    /// Returns `true` when resetting the connection might help.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout | Self::ConnectionBroken | Self::NotConnected
        )
    }
}

// ── Unified ─────────────────────────────────────────────────────────

/// Top-level error type for the `netpoll-transport` crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Snmp(#[from] SnmpError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Local interface enumeration failed.
    #[error("local introspection failed: {0}")]
    Local(String),
}

impl Error {
    /// Returns `true` if the failure was a timeout on either protocol.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Snmp(SnmpError::Timeout) | Self::Agent(AgentError::RequestTimeout)
        )
    }

    /// Returns `true` if this is a transient error worth retrying next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Snmp(e) => matches!(e, SnmpError::Timeout | SnmpError::Comm { .. }),
            Self::Agent(e) => e.is_connection_fault() || matches!(e, AgentError::Transport(_)),
            Self::Local(_) => false,
        }
    }
}
