// ── Native agent transport contract ──
//
// The engine owns one `AgentSession` per node and serializes access to
// it. Proxying is expressed in the target: when `proxy` is set, the
// connector must tunnel through that endpoint instead of dialling the
// node directly.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::AgentError;
use crate::types::{ArpEntry, InterfaceInfo, ParameterInfo, RouteEntry};

/// Shared-secret authentication method negotiated with the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentAuth {
    #[default]
    None,
    Plain,
    Md5,
    Sha1,
}

/// Where and how to reach one agent.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub address: IpAddr,
    pub port: u16,
    pub auth: AgentAuth,
    pub secret: SecretString,
}

/// Full connection request: the node's endpoint plus an optional proxy hop.
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub endpoint: AgentEndpoint,
    pub proxy: Option<AgentEndpoint>,
    pub timeout: Duration,
}

/// An established agent connection.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Liveness check.
    async fn nop(&self) -> Result<(), AgentError>;

    async fn get_parameter(&self, name: &str) -> Result<String, AgentError>;

    async fn interface_list(&self) -> Result<Vec<InterfaceInfo>, AgentError>;

    async fn routing_table(&self) -> Result<Vec<RouteEntry>, AgentError>;

    async fn arp_cache(&self) -> Result<Vec<ArpEntry>, AgentError>;

    async fn supported_parameters(&self) -> Result<Vec<ParameterInfo>, AgentError>;

    /// Close the connection. Errors are not reported.
    async fn disconnect(&self);
}

/// Factory for agent sessions.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, target: &AgentTarget) -> Result<Box<dyn AgentSession>, AgentError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_round_trips_through_strings() {
        assert_eq!(AgentAuth::Sha1.to_string(), "sha1");
        assert_eq!("md5".parse::<AgentAuth>().unwrap(), AgentAuth::Md5);
        assert!("kerberos".parse::<AgentAuth>().is_err());
    }
}
