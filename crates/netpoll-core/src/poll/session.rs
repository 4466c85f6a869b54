// ── Transport sessions for one node ──
//
// Targets are built from a short read of the node data; the actual
// network calls happen after the data lock is released. The agent
// connection lives on the node and is reused across cycles behind its
// own lock.

use std::sync::Arc;

use netpoll_transport::{
    AgentConnector, AgentEndpoint, AgentError, AgentSession, AgentTarget, ArpEntry, InterfaceInfo,
    ParameterInfo, RouteEntry, SnmpTarget, SnmpTransport, SnmpVersion,
};
use secrecy::SecretString;
use tokio::sync::MutexGuard;
use tracing::{debug, trace};

use super::Engine;
use crate::model::{Node, NodeData};

/// Agent endpoint of a node, used both for direct connections and
/// when the node serves as somebody's proxy.
fn agent_endpoint(data: &NodeData) -> AgentEndpoint {
    AgentEndpoint {
        address: data.primary_ip,
        port: data.agent.port,
        auth: data.agent.auth,
        secret: data.agent.secret.clone(),
    }
}

fn proxy_endpoint(engine: &Engine, proxy_id: Option<u32>) -> Option<AgentEndpoint> {
    let proxy = engine.registry.node(proxy_id?)?;
    Some(proxy.read(agent_endpoint))
}

// ── SNMP ────────────────────────────────────────────────────────────

/// Connection parameters that can differ from what is stored on the
/// node, as tried during version and community negotiation.
#[derive(Debug, Clone)]
pub(crate) struct SnmpParams {
    pub port: u16,
    pub version: SnmpVersion,
    pub community: SecretString,
}

impl SnmpParams {
    pub fn of(data: &NodeData) -> Self {
        Self {
            port: data.snmp.port,
            version: data.snmp.version,
            community: data.snmp.community.clone(),
        }
    }
}

pub(crate) fn snmp_target(engine: &Engine, node: &Node, params: &SnmpParams) -> SnmpTarget {
    let (address, proxy_id) = node.read(|d| (d.primary_ip, d.snmp_proxy_node));
    SnmpTarget {
        address,
        port: params.port,
        version: params.version,
        community: params.community.clone(),
        proxy: proxy_endpoint(engine, proxy_id),
        timeout: engine.config.snmp.timeout,
        retries: engine.config.snmp.retries,
    }
}

/// Open an SNMP transport using the node's stored settings, or `port`
/// in place of the stored port.
pub(crate) fn open_snmp(engine: &Engine, node: &Node, port: Option<u16>) -> Option<Box<dyn SnmpTransport>> {
    let mut params = node.read(SnmpParams::of);
    if let Some(port) = port {
        params.port = port;
    }
    open_snmp_with(engine, node, &params)
}

pub(crate) fn open_snmp_with(
    engine: &Engine,
    node: &Node,
    params: &SnmpParams,
) -> Option<Box<dyn SnmpTransport>> {
    let target = snmp_target(engine, node, params);
    match engine.transports.snmp.open(&target) {
        Ok(transport) => Some(transport),
        Err(e) => {
            debug!(node_id = node.id(), error = %e, "cannot create SNMP transport");
            None
        }
    }
}

// ── Agent ───────────────────────────────────────────────────────────

pub(crate) fn agent_target(engine: &Engine, node: &Node, secret: Option<SecretString>) -> AgentTarget {
    let (mut endpoint, proxy_id) = node.read(|d| (agent_endpoint(d), d.proxy_node));
    if let Some(secret) = secret {
        endpoint.secret = secret;
    }
    AgentTarget {
        endpoint,
        proxy: proxy_endpoint(engine, proxy_id),
        timeout: engine.config.agent.timeout,
    }
}

/// Exclusive use of a node's agent connection.
///
/// Every request that fails with a connection fault is retried once on
/// a fresh connection before the error is returned.
pub(crate) struct AgentLease<'a> {
    slot: MutexGuard<'a, Option<Box<dyn AgentSession>>>,
    connector: Arc<dyn AgentConnector>,
    target: AgentTarget,
    node_id: u32,
}

macro_rules! retry_once {
    ($lease:expr, $s:ident => $call:expr) => {{
        let first = {
            let $s = $lease.session()?;
            $call.await
        };
        match first {
            Err(e) if e.is_connection_fault() => {
                debug!(node_id = $lease.node_id, error = %e, "agent connection fault, reconnecting");
                $lease.reconnect().await?;
                let $s = $lease.session()?;
                $call.await
            }
            other => other,
        }
    }};
}

impl<'a> AgentLease<'a> {
    /// Lock the node's agent slot and make sure it holds a connection.
    pub async fn acquire(engine: &Engine, node: &'a Node) -> Result<AgentLease<'a>, AgentError> {
        Self::acquire_with(engine, node, None).await
    }

    /// Like `acquire`, but connects with `secret` instead of the stored
    /// shared secret when a new connection is needed.
    pub async fn acquire_with(
        engine: &Engine,
        node: &'a Node,
        secret: Option<SecretString>,
    ) -> Result<AgentLease<'a>, AgentError> {
        let connector = engine
            .transports
            .agent
            .clone()
            .ok_or(AgentError::Unsupported("no agent connector configured"))?;
        let target = agent_target(engine, node, secret);
        let slot = node.agent_slot().await;
        let mut lease = AgentLease {
            slot,
            connector,
            target,
            node_id: node.id(),
        };
        if lease.slot.is_none() {
            lease.connect().await?;
        }
        Ok(lease)
    }

    fn session(&self) -> Result<&dyn AgentSession, AgentError> {
        self.slot.as_deref().ok_or(AgentError::NotConnected)
    }

    async fn connect(&mut self) -> Result<(), AgentError> {
        trace!(node_id = self.node_id, address = %self.target.endpoint.address, "connecting to agent");
        let session = self.connector.connect(&self.target).await?;
        *self.slot = Some(session);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), AgentError> {
        if let Some(old) = self.slot.take() {
            old.disconnect().await;
        }
        self.connect().await
    }

    /// Close the connection and leave the slot empty.
    pub async fn discard(mut self) {
        if let Some(old) = self.slot.take() {
            old.disconnect().await;
        }
    }

    pub async fn nop(&mut self) -> Result<(), AgentError> {
        retry_once!(self, s => s.nop())
    }

    pub async fn get_parameter(&mut self, name: &str) -> Result<String, AgentError> {
        retry_once!(self, s => s.get_parameter(name))
    }

    pub async fn interface_list(&mut self) -> Result<Vec<InterfaceInfo>, AgentError> {
        retry_once!(self, s => s.interface_list())
    }

    pub async fn routing_table(&mut self) -> Result<Vec<RouteEntry>, AgentError> {
        retry_once!(self, s => s.routing_table())
    }

    pub async fn arp_cache(&mut self) -> Result<Vec<ArpEntry>, AgentError> {
        retry_once!(self, s => s.arp_cache())
    }

    pub async fn supported_parameters(&mut self) -> Result<Vec<ParameterInfo>, AgentError> {
        retry_once!(self, s => s.supported_parameters())
    }
}
