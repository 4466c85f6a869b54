//! Daemon error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use netpoll_config::ConfigError;
use netpoll_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const STATE: i32 = 4;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(
        code(netpoll::validation),
        help("Fix the value in the configuration file or its NETPOLL_ environment override.")
    )]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(
        code(netpoll::config),
        help("Run: netpolld config path  to see which file is read")
    )]
    Config(ConfigError),

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(code(netpoll::config_exists), help("Use --force to overwrite it."))]
    ConfigExists { path: String },

    // ── State ────────────────────────────────────────────────────────
    #[error("State file {path} is unreadable")]
    #[diagnostic(
        code(netpoll::state),
        help("Restore it from a backup, or move it aside to start from an empty inventory.")
    )]
    State {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // ── Engine ───────────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(netpoll::core))]
    Core(#[from] CoreError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::ConfigExists { .. } => exit_code::USAGE,
            Self::Config(_) => exit_code::CONFIG,
            Self::State { .. } => exit_code::STATE,
            Self::Core(err) if err.is_escalated() => exit_code::STATE,
            _ => exit_code::GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_usage_errors() {
        let err = CliError::from(ConfigError::Validation {
            field: "poller.workers".into(),
            reason: "must be greater than zero".into(),
        });
        assert!(matches!(err, CliError::Validation { .. }));
        assert_eq!(err.exit_code(), exit_code::USAGE);
    }

    #[test]
    fn corrupt_records_map_to_the_state_code() {
        let err = CliError::from(CoreError::LoadCorruption {
            node_id: 4,
            reason: "missing subnet 9".into(),
        });
        assert_eq!(err.exit_code(), exit_code::STATE);
        let err = CliError::from(CoreError::NotFound { entity: "node", id: 4 });
        assert_eq!(err.exit_code(), exit_code::GENERAL);
    }
}
