// ── Poller facade ──
//
// Owns the registry, the engine and the background tasks. Cheaply
// cloneable; every clone drives the same poller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netpoll_transport::{ArpEntry, LinkNeighbor, ParameterInfo, RouteEntry};

use crate::clock::{Clock, SystemClock};
use crate::config::PollerConfig;
use crate::error::CoreError;
use crate::events::{BroadcastSink, EventSink};
use crate::model::{DciCleanup, DynamicFlags, Event, Node, NodeFlags, NodeRecord, Subnet};
use crate::persistence::{MemoryStore, NodeStore};
use crate::poll::config_poll::ConfigPollOutcome;
use crate::poll::{DnsResolver, Engine, NameResolver, Transports, artifacts, config_poll, status_poll};
use crate::scheduler::{self, PollKind, PollQueue, PollRequest};
use crate::store::Registry;

const EVENT_CHANNEL_SIZE: usize = 1024;

/// How often a deletion re-checks the queued flags while waiting.
const IDLE_RECHECK: Duration = Duration::from_millis(250);

/// Outcome of restoring state from the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub subnets: usize,
    pub nodes: usize,
    /// Ids of node records that were corrupt or clashing and left out.
    pub rejected: Vec<u32>,
}

// ── Builder ──────────────────────────────────────────────────────

pub struct PollerBuilder {
    config: PollerConfig,
    transports: Transports,
    store: Option<Arc<dyn NodeStore>>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    resolver: Option<Arc<dyn NameResolver>>,
}

impl PollerBuilder {
    /// Persistence collaborator. Defaults to a volatile in-memory store.
    pub fn store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Event sink. Without one, events go to a broadcast channel
    /// available through [`Poller::events`].
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Poller {
        let (sink, broadcast): (Arc<dyn EventSink>, _) = match self.sink {
            Some(sink) => (sink, None),
            None => {
                let broadcast = Arc::new(BroadcastSink::new(EVENT_CHANNEL_SIZE));
                (Arc::clone(&broadcast) as Arc<dyn EventSink>, Some(broadcast))
            }
        };
        let dns_timeout = self.config.names.dns_timeout;
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));

        let engine = Engine {
            config: self.config,
            registry: Arc::new(Registry::new()),
            transports: self.transports,
            sink,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(DnsResolver::new(dns_timeout))),
        };

        Poller {
            inner: Arc::new(PollerInner {
                engine: Arc::new(engine),
                broadcast,
                queue_tx,
                queue_rx: Arc::new(Mutex::new(queue_rx)),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }
}

// ── Poller ───────────────────────────────────────────────────────

/// The main entry point for consumers.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    engine: Arc<Engine>,
    broadcast: Option<Arc<BroadcastSink>>,
    queue_tx: mpsc::Sender<PollRequest>,
    queue_rx: PollQueue,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Poller {
    pub fn builder(config: PollerConfig, transports: Transports) -> PollerBuilder {
        PollerBuilder {
            config,
            transports,
            store: None,
            sink: None,
            clock: None,
            resolver: None,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.engine.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.engine.registry
    }

    /// Subscribe to posted events. `None` when a custom sink was given.
    pub fn events(&self) -> Option<broadcast::Receiver<Arc<Event>>> {
        self.inner.broadcast.as_ref().map(|b| b.subscribe())
    }

    fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    fn lookup(&self, node_id: u32) -> Result<Arc<Node>, CoreError> {
        self.registry().node(node_id).ok_or(CoreError::NotFound {
            entity: "node",
            id: node_id,
        })
    }

    fn pollable(&self, node_id: u32) -> Result<Arc<Node>, CoreError> {
        let node = self.lookup(node_id)?;
        if node
            .dynamic()
            .intersects(DynamicFlags::POLLING_DISABLED | DynamicFlags::DELETE_IN_PROGRESS)
        {
            return Err(CoreError::PollingDisabled { node_id });
        }
        Ok(node)
    }

    // ── Object lifecycle ─────────────────────────────────────────

    /// Build a node from its record and link it into the registry.
    ///
    /// Parent subnets must already be registered; a missing one makes
    /// the record corrupt. Template names are bound to the node, and the
    /// configured management node is marked as the local host.
    fn attach(&self, record: &NodeRecord) -> Result<Arc<Node>, CoreError> {
        let registry = self.registry();
        let mut parents = Vec::with_capacity(record.subnets.len());
        for &subnet_id in &record.subnets {
            let subnet = registry.subnet(subnet_id).ok_or_else(|| CoreError::LoadCorruption {
                node_id: record.id,
                reason: format!("parent subnet {subnet_id} does not exist"),
            })?;
            parents.push(subnet);
        }

        let node = Arc::new(Node::from_record(record, self.config().cache_ttl));
        let local_mgmt = self.config().management_node == Some(record.id);
        node.update(|d| d.flags.set(NodeFlags::IS_LOCAL_MGMT, local_mgmt));
        registry.insert_node(Arc::clone(&node))?;

        for subnet in &parents {
            subnet.add_node(record.id);
        }
        record.interfaces.iter().for_each(|i| registry.reserve_id(i.id));
        record.services.iter().for_each(|s| registry.reserve_id(s.id));
        let template_ids: Vec<u32> = record
            .templates
            .iter()
            .map(|name| {
                let template = registry.system_template(name);
                template.bind(record.id);
                template.id
            })
            .collect();
        node.update(|d| d.templates.extend(template_ids));
        Ok(node)
    }

    /// Register a new node and persist it. A zero id is replaced by a
    /// freshly allocated one.
    pub async fn add_node(&self, mut record: NodeRecord) -> Result<Arc<Node>, CoreError> {
        if record.id == 0 {
            record.id = self.registry().allocate_id();
        }
        let node = self.attach(&record)?;
        info!(node_id = record.id, name = %record.name, address = %record.primary_ip, "node added");
        self.engine().persist_node(&node).await;
        Ok(node)
    }

    /// Restore one node from the store. Fails with `NotFound` when the
    /// store has no such record.
    pub async fn load_node(&self, node_id: u32) -> Result<Arc<Node>, CoreError> {
        let store = Arc::clone(&self.engine().store);
        let record = tokio::task::spawn_blocking(move || store.load_node(node_id))
            .await
            .map_err(|e| CoreError::Persistence { message: e.to_string() })??;
        self.attach(&record)
    }

    /// Restore subnets, then nodes. Corrupt node records are reported
    /// and skipped; any other store failure aborts the load.
    pub async fn load_from_store(&self) -> Result<LoadReport, CoreError> {
        let store = Arc::clone(&self.engine().store);
        let (subnets, nodes) = tokio::task::spawn_blocking(move || {
            Ok::<_, CoreError>((store.load_subnets()?, store.load_nodes()?))
        })
        .await
        .map_err(|e| CoreError::Persistence { message: e.to_string() })??;

        let mut report = LoadReport::default();
        for record in &subnets {
            self.registry().reserve_id(record.id);
            self.registry().insert_subnet(Arc::new(Subnet::from_record(record)));
            report.subnets += 1;
        }
        // Every stored id is taken before anything new is allocated,
        // including those of records rejected below.
        for record in &nodes {
            self.registry().reserve_id(record.id);
            record.interfaces.iter().for_each(|i| self.registry().reserve_id(i.id));
            record.services.iter().for_each(|s| self.registry().reserve_id(s.id));
        }
        for record in &nodes {
            match self.attach(record) {
                Ok(_) => report.nodes += 1,
                Err(e) if e.is_escalated() => {
                    error!(node_id = record.id, error = %e, "node record is corrupt, not loaded");
                    report.rejected.push(record.id);
                }
                Err(e @ CoreError::DuplicateAddress { .. }) => {
                    warn!(node_id = record.id, error = %e, "node record skipped");
                    report.rejected.push(record.id);
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            subnets = report.subnets,
            nodes = report.nodes,
            rejected = report.rejected.len(),
            "state loaded"
        );
        Ok(report)
    }

    /// Take a node out of service and forget it.
    ///
    /// Polling is disabled first; the call then waits until no poll is
    /// queued or running before releasing subnets and children.
    pub async fn delete_node(&self, node_id: u32) -> Result<(), CoreError> {
        let node = self.lookup(node_id)?;
        node.set_dynamic(DynamicFlags::POLLING_DISABLED | DynamicFlags::DELETE_IN_PROGRESS);
        node.wait_idle(IDLE_RECHECK).await;

        let _poller = node.lock_poller().await;
        let engine = self.engine();
        let (subnets, templates) = node.read(|d| (d.subnets.clone(), d.templates.clone()));
        for subnet_id in subnets {
            engine.unbind_subnet(node_id, subnet_id).await;
        }
        for template_id in templates {
            if let Some(template) = engine.registry.template(template_id) {
                template.unbind(node_id);
                engine.registry.queue_dci_cleanup(DciCleanup { template_id, node_id });
            }
        }
        node.drop_agent_connection().await;
        node.update(|d| {
            d.interfaces.clear();
            d.services.clear();
            d.subnets.clear();
            d.templates.clear();
        });
        engine.registry.remove_node(node_id);
        engine.forget_node(node_id).await?;
        info!(node_id, "node deleted");
        Ok(())
    }

    /// Put a node in or out of management and recompute its status.
    pub async fn set_managed(&self, node_id: u32, managed: bool) -> Result<(), CoreError> {
        let node = self.lookup(node_id)?;
        let _poller = node.lock_poller().await;
        if node.read(|d| d.managed) == managed {
            return Ok(());
        }
        node.update(|d| d.managed = managed);
        info!(node_id, managed, "management state changed");
        status_poll::update_status(self.engine(), &node);
        self.engine().persist_node(&node).await;
        Ok(())
    }

    // ── On-demand polls ──────────────────────────────────────────

    pub async fn status_poll(&self, node_id: u32) -> Result<(), CoreError> {
        let node = self.pollable(node_id)?;
        status_poll::run(self.engine(), &node).await;
        Ok(())
    }

    pub async fn configuration_poll(&self, node_id: u32) -> Result<ConfigPollOutcome, CoreError> {
        let node = self.pollable(node_id)?;
        Ok(config_poll::run(self.engine(), &node).await)
    }

    /// Forget every detected capability and run a configuration poll.
    pub async fn recheck_capabilities(&self, node_id: u32) -> Result<ConfigPollOutcome, CoreError> {
        let node = self.pollable(node_id)?;
        node.request_recheck();
        Ok(config_poll::run(self.engine(), &node).await)
    }

    /// Re-resolve the node's primary host name. Returns `true` if the
    /// primary address changed.
    pub async fn update_primary_address(&self, node_id: u32) -> Result<bool, CoreError> {
        let node = self.pollable(node_id)?;
        let _poller = node.lock_poller().await;
        Ok(status_poll::update_primary_address(self.engine(), &node).await)
    }

    /// Queue a poll for the workers. Returns `false` if it is already
    /// queued or the queue is full.
    pub fn queue_poll(&self, node_id: u32, kind: PollKind) -> Result<bool, CoreError> {
        let node = self.pollable(node_id)?;
        if node.dynamic().contains(kind.queued_flag()) {
            return Ok(false);
        }
        Ok(scheduler::try_queue(&self.inner.queue_tx, &node, kind))
    }

    // ── Cached artifacts ─────────────────────────────────────────

    pub async fn routing_table(&self, node_id: u32) -> Result<Arc<Vec<RouteEntry>>, CoreError> {
        let node = self.lookup(node_id)?;
        artifacts::routing_table(self.engine(), &node).await
    }

    pub async fn arp_cache(&self, node_id: u32) -> Result<Arc<Vec<ArpEntry>>, CoreError> {
        let node = self.lookup(node_id)?;
        artifacts::arp_cache(self.engine(), &node).await
    }

    pub async fn topology(&self, node_id: u32) -> Result<Arc<Vec<LinkNeighbor>>, CoreError> {
        let node = self.lookup(node_id)?;
        artifacts::topology(self.engine(), &node).await
    }

    pub async fn parameters(&self, node_id: u32) -> Result<Arc<Vec<ParameterInfo>>, CoreError> {
        let node = self.lookup(node_id)?;
        artifacts::parameters(self.engine(), &node).await
    }

    /// Hand pending template cleanup requests to the DCI subsystem.
    pub fn drain_dci_cleanup(&self) -> Vec<DciCleanup> {
        self.registry().drain_dci_cleanup()
    }

    // ── Background tasks ─────────────────────────────────────────

    /// Spawn the scheduler and the poll workers.
    pub async fn start(&self) {
        let mut handles = self.inner.task_handles.lock().await;
        if !handles.is_empty() {
            warn!("poller already started");
            return;
        }
        let engine = &self.inner.engine;
        let cancel = &self.inner.cancel;
        let workers = engine.config.workers.max(1);

        for worker in 0..workers {
            handles.push(tokio::spawn(scheduler::worker_task(
                Arc::clone(engine),
                Arc::clone(&self.inner.queue_rx),
                worker,
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(scheduler::scheduler_task(
            Arc::clone(engine),
            self.inner.queue_tx.clone(),
            engine.config.scheduler_tick,
            cancel.clone(),
        )));
        info!(workers, nodes = engine.registry.node_count(), "poller started");
    }

    /// Stop queueing, let running polls finish and release whatever
    /// is still waiting in the queue.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "poller task ended abnormally");
            }
        }
        scheduler::drain(&self.inner.queue_rx).await;
        for node in self.registry().nodes().iter() {
            node.drop_agent_connection().await;
        }
        debug!("poller stopped");
    }
}
