// ── Child status polls ──
//
// Interfaces are polled over the node's own agent or SNMP; services
// are checked from the delegate poller node. Statuses are written back
// by child id and transition events go to the cycle's deferred queue.

use std::net::IpAddr;
use std::sync::Arc;

use netpoll_transport::SnmpTransport;
use tracing::{debug, trace};

use super::probe::{all_protocols_down, reachable_over};
use super::session::{AgentLease, open_snmp};
use super::Engine;
use crate::events::DeferredEvents;
use crate::model::interface::link_status;
use crate::model::{
    Event, EventCode, Interface, LinkState, NetworkService, Node, ObjectStatus, Protocol,
};

const IF_ADMIN_STATUS: &str = ".1.3.6.1.2.1.2.2.1.7";
const IF_OPER_STATUS: &str = ".1.3.6.1.2.1.2.2.1.8";

/// A node child that takes part in status polling.
#[derive(Debug, Clone)]
pub(crate) enum Pollable {
    Interface(Interface),
    Service(NetworkService),
}

/// Fresh state of one child after its poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildState {
    pub status: ObjectStatus,
    pub link: Option<(LinkState, LinkState)>,
}

/// Transports shared by all children of one node during a cycle.
pub(crate) struct ChildContext<'a> {
    engine: &'a Engine,
    node: &'a Node,
    primary: IpAddr,
    snmp: Option<Box<dyn SnmpTransport>>,
    agent: Option<AgentLease<'a>>,
    /// Node running service checks; `None` when it is this node.
    delegate: Option<Arc<Node>>,
    protocols_down: bool,
}

impl<'a> ChildContext<'a> {
    pub async fn open(engine: &'a Engine, node: &'a Node, delegate: Option<Arc<Node>>) -> ChildContext<'a> {
        let snmp = if reachable_over(node, Protocol::Snmp) {
            open_snmp(engine, node, None)
        } else {
            None
        };
        let agent = if reachable_over(node, Protocol::Agent) {
            AgentLease::acquire(engine, node).await.ok()
        } else {
            None
        };
        ChildContext {
            engine,
            node,
            primary: node.primary_ip(),
            snmp,
            agent,
            delegate: delegate.filter(|d| d.id() != node.id()),
            protocols_down: all_protocols_down(node),
        }
    }

    async fn agent_link_state(&mut self, if_index: u32) -> Option<(LinkState, LinkState)> {
        let lease = self.agent.as_mut()?;
        let admin = lease
            .get_parameter(&format!("Net.Interface.AdminStatus({if_index})"))
            .await
            .ok()?;
        let oper = lease
            .get_parameter(&format!("Net.Interface.OperStatus({if_index})"))
            .await
            .ok()?;
        Some((parse_state(&admin), parse_state(&oper)))
    }

    async fn snmp_link_state(&self, if_index: u32) -> Option<(LinkState, LinkState)> {
        let snmp = self.snmp.as_deref()?;
        let admin = snmp.get(&format!("{IF_ADMIN_STATUS}.{if_index}")).await.ok()?;
        let oper = snmp.get(&format!("{IF_OPER_STATUS}.{if_index}")).await.ok()?;
        Some((
            LinkState::from_mib(admin.as_i64().unwrap_or(0)),
            LinkState::from_mib(oper.as_i64().unwrap_or(0)),
        ))
    }

    /// Status inferred from protocol reachability when the interface
    /// cannot be asked directly.
    fn derived_status(&self) -> ObjectStatus {
        let any_protocol = self.node.read(|d| Protocol::ALL.iter().any(|&p| d.protocol_enabled(p)));
        match (any_protocol, self.protocols_down) {
            (false, _) => ObjectStatus::Unknown,
            (true, true) => ObjectStatus::Critical,
            (true, false) => ObjectStatus::Normal,
        }
    }

    async fn check_service(&mut self, service: &NetworkService) -> ObjectStatus {
        let parameter = service.check_parameter(self.primary);
        let result = match &self.delegate {
            Some(delegate) => {
                // Never hold two agent locks at once.
                self.agent = None;
                if !reachable_over(delegate, Protocol::Agent) {
                    return ObjectStatus::Unknown;
                }
                match AgentLease::acquire(self.engine, delegate).await {
                    Ok(mut lease) => lease.get_parameter(&parameter).await,
                    Err(e) => Err(e),
                }
            }
            None => match self.agent.as_mut() {
                Some(lease) => lease.get_parameter(&parameter).await,
                None => return ObjectStatus::Unknown,
            },
        };
        match result {
            Ok(value) if value.trim() == "0" => ObjectStatus::Normal,
            Ok(_) => ObjectStatus::Critical,
            Err(e) => {
                debug!(node_id = self.node.id(), service = %service.name, error = %e, "service check failed");
                ObjectStatus::Unknown
            }
        }
    }
}

fn parse_state(text: &str) -> LinkState {
    text.trim().parse::<i64>().map_or(LinkState::Unknown, LinkState::from_mib)
}

impl Pollable {
    pub fn id(&self) -> u32 {
        match self {
            Self::Interface(i) => i.id,
            Self::Service(s) => s.id,
        }
    }

    pub async fn status_poll(&self, ctx: &mut ChildContext<'_>) -> ChildState {
        match self {
            Self::Interface(iface) if iface.is_nat_adapter() => ChildState {
                status: ctx.derived_status(),
                link: None,
            },
            Self::Interface(iface) => {
                let link = match ctx.agent_link_state(iface.if_index).await {
                    Some(link) => Some(link),
                    None => ctx.snmp_link_state(iface.if_index).await,
                };
                match link {
                    Some((admin, oper)) => ChildState {
                        status: link_status(admin, oper),
                        link: Some((admin, oper)),
                    },
                    None => ChildState {
                        status: ctx.derived_status(),
                        link: None,
                    },
                }
            }
            Self::Service(service) => ChildState {
                status: ctx.check_service(service).await,
                link: None,
            },
        }
    }

    /// Event announcing a status change, if this transition has one.
    pub fn transition_event(&self, engine: &Engine, node_id: u32, new: ObjectStatus) -> Option<Event> {
        match self {
            Self::Interface(iface) => {
                let code = match new {
                    ObjectStatus::Normal => EventCode::InterfaceUp,
                    ObjectStatus::Critical => EventCode::InterfaceDown,
                    ObjectStatus::Disabled => EventCode::InterfaceDisabled,
                    ObjectStatus::Unknown => EventCode::InterfaceUnknown,
                    _ => return None,
                };
                Some(
                    engine
                        .event(code, node_id)
                        .arg("interfaceIndex", iface.if_index)
                        .arg("interfaceName", &iface.name)
                        .arg("ipAddress", iface.ip().map(|ip| ip.to_string()).unwrap_or_default()),
                )
            }
            Self::Service(service) => {
                let code = match new {
                    ObjectStatus::Normal => EventCode::ServiceUp,
                    ObjectStatus::Critical => EventCode::ServiceDown,
                    ObjectStatus::Unknown => EventCode::ServiceUnknown,
                    _ => return None,
                };
                Some(
                    engine
                        .event(code, node_id)
                        .arg("serviceName", &service.name)
                        .arg("serviceType", service.service_type)
                        .arg("port", service.port),
                )
            }
        }
    }
}

/// Managed children that are not cluster interconnect addresses.
pub(crate) fn pollable_children(node: &Node) -> Vec<Pollable> {
    node.read(|d| {
        d.interfaces
            .iter()
            .filter(|i| i.is_pollable())
            .cloned()
            .map(Pollable::Interface)
            .chain(d.services.iter().filter(|s| s.managed).cloned().map(Pollable::Service))
            .collect()
    })
}

/// Poll every child once, write the results back, and queue the
/// transition events.
pub(crate) async fn poll_children(
    engine: &Engine,
    node: &Node,
    delegate: Option<Arc<Node>>,
    deferred: &mut DeferredEvents,
) {
    let children = pollable_children(node);
    if children.is_empty() {
        return;
    }
    let node_id = node.id();
    let mut ctx = ChildContext::open(engine, node, delegate).await;

    for child in &children {
        let state = child.status_poll(&mut ctx).await;
        let id = child.id();
        let applied = node.update(|d| match child {
            Pollable::Interface(_) => {
                let iface = d.interfaces.iter_mut().find(|i| i.id == id)?;
                let old = iface.status;
                iface.status = state.status;
                if let Some((admin, oper)) = state.link {
                    iface.admin_state = admin;
                    iface.oper_state = oper;
                }
                Some(old)
            }
            Pollable::Service(_) => {
                let service = d.services.iter_mut().find(|s| s.id == id)?;
                let old = service.status;
                service.status = state.status;
                Some(old)
            }
        });

        // Deleted while we were polling it.
        let Some(old) = applied else { continue };
        trace!(node_id, child_id = id, status = %state.status, "child polled");
        if old != state.status {
            debug!(node_id, child_id = id, old = %old, new = %state.status, "child status changed");
            if let Some(event) = child.transition_event(engine, node_id, state.status) {
                deferred.push(event);
            }
        }
    }
}
