// ── Poll cycles ──
//
// `Engine` bundles everything a cycle needs. Poll functions borrow it
// together with the node they work on; none of them hold the data
// lock across an `.await`.

pub(crate) mod artifacts;
pub mod capability;
pub(crate) mod children;
pub mod config_poll;
pub(crate) mod discovery;
pub mod names;
pub mod probe;
pub mod reconcile;
pub(crate) mod session;
pub(crate) mod status_poll;
pub(crate) mod subnets;
pub(crate) mod templates;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use netpoll_transport::{AgentConnector, InterfaceSource, SnmpConnector};
use tracing::warn;

use crate::clock::Clock;
use crate::config::PollerConfig;
use crate::error::CoreError;
use crate::events::EventSink;
use crate::model::{Event, EventCode, Node, Subnet};
use crate::persistence::NodeStore;
use crate::store::Registry;

pub use names::{DnsResolver, NameResolver};

/// The transports a poller can use. Without an agent connector, agent
/// detection and probing are skipped.
#[derive(Clone)]
pub struct Transports {
    pub snmp: Arc<dyn SnmpConnector>,
    pub agent: Option<Arc<dyn AgentConnector>>,
    /// Interface source for the node flagged as the local management host.
    pub local: Option<Arc<dyn InterfaceSource>>,
}

pub(crate) struct Engine {
    pub config: PollerConfig,
    pub registry: Arc<Registry>,
    pub transports: Transports,
    pub sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn NodeStore>,
    pub resolver: Arc<dyn NameResolver>,
}

impl Engine {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Capability expiration window.
    pub fn window(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.capability_expiration).unwrap_or(TimeDelta::MAX)
    }

    pub fn event(&self, code: EventCode, node_id: u32) -> Event {
        Event::new(code, node_id, self.now())
    }

    pub fn post(&self, event: Event) {
        self.sink.post(event);
    }

    fn template_name(&self, id: u32) -> Option<String> {
        self.registry.template(id).map(|t| t.name.clone())
    }

    /// Write the node record. Failures are logged, never propagated
    /// into the poll cycle.
    pub async fn persist_node(&self, node: &Node) {
        let record = node.to_record(|id| self.template_name(id));
        let store = Arc::clone(&self.store);
        let node_id = record.id;
        match tokio::task::spawn_blocking(move || store.save_node(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(node_id, error = %e, "failed to save node"),
            Err(e) => warn!(node_id, error = %e, "node save task failed"),
        }
    }

    pub async fn persist_subnet(&self, subnet: &Subnet) {
        let record = subnet.to_record();
        let store = Arc::clone(&self.store);
        let subnet_id = record.id;
        match tokio::task::spawn_blocking(move || store.save_subnet(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(subnet_id, error = %e, "failed to save subnet"),
            Err(e) => warn!(subnet_id, error = %e, "subnet save task failed"),
        }
    }

    pub async fn forget_subnet(&self, subnet_id: u32) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.delete_subnet(subnet_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(subnet_id, error = %e, "failed to delete subnet"),
            Err(e) => warn!(subnet_id, error = %e, "subnet delete task failed"),
        }
    }

    pub async fn forget_node(&self, node_id: u32) -> Result<(), CoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.delete_node(node_id))
            .await
            .map_err(|e| CoreError::Persistence {
                message: e.to_string(),
            })?
    }

    /// Drop a node from a subnet, removing the subnet once it is empty.
    /// Returns `true` if the subnet was removed.
    pub async fn unbind_subnet(&self, node_id: u32, subnet_id: u32) -> bool {
        let Some(subnet) = self.registry.subnet(subnet_id) else {
            return false;
        };
        subnet.remove_node(node_id);
        if subnet.is_empty() {
            self.registry.remove_subnet(subnet_id);
            self.forget_subnet(subnet_id).await;
            return true;
        }
        false
    }
}
