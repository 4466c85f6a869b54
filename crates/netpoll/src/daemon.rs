// ── Daemon run loop ──
//
// Builds the poller from configuration, restores persisted nodes,
// provisions inventory entries that are not known yet, and polls until
// Ctrl-C. Events and template cleanup requests are written to the log.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use netpoll_config::Config;
use netpoll_core::{MemoryStore, NodeRecord, NodeStore, Poller, Transports};
use netpoll_transport::{LocalHost, UdpSnmpConnector};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::store::JsonFileStore;

pub async fn run(config: Config, args: &RunArgs) -> Result<(), CliError> {
    let poller_config = config.poller_config()?;
    let inventory = config.inventory()?;

    let store: Arc<dyn NodeStore> = if args.ephemeral {
        info!("running without a state file");
        Arc::new(MemoryStore::new())
    } else {
        let path = args.state_file.clone().unwrap_or_else(|| config.state_path());
        let store = JsonFileStore::open(&path).map_err(|e| CliError::State {
            path: path.display().to_string(),
            source: Box::new(e),
        })?;
        info!(path = %store.path().display(), unreadable = store.unreadable(), "state file opened");
        Arc::new(store)
    };

    // No agent transport is wired in; agent detection and probes are skipped.
    let transports = Transports {
        snmp: Arc::new(UdpSnmpConnector),
        agent: None,
        local: Some(Arc::new(LocalHost)),
    };
    let poller = Poller::builder(poller_config, transports).store(store).build();

    let report = poller.load_from_store().await?;
    info!(
        subnets = report.subnets,
        nodes = report.nodes,
        rejected = report.rejected.len(),
        "state restored"
    );
    if !report.rejected.is_empty() {
        warn!(ids = ?report.rejected, "node records left out of the registry");
    }

    provision(&poller, inventory).await;
    warn_proxied_snmp(&poller);

    let events = spawn_event_log(&poller);
    let cleanup = spawn_cleanup_log(&poller, poller.config().configuration_interval);
    poller.start().await;
    info!(nodes = poller.registry().nodes().len(), "polling started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C; shutting down");
    }
    info!("shutting down");
    poller.shutdown().await;
    cleanup.abort();
    log_dci_cleanup(&poller);
    if let Some(handle) = events {
        handle.abort();
    }
    Ok(())
}

/// Add inventory entries whose id and address are both unknown.
async fn provision(poller: &Poller, inventory: Vec<NodeRecord>) {
    let registry = poller.registry();
    for record in inventory {
        if record.id != 0 && registry.node(record.id).is_some() {
            debug!(node_id = record.id, "inventory node already known");
            continue;
        }
        if let Some(existing) = registry.node_by_address(record.zone_id, record.primary_ip) {
            debug!(
                node_id = existing.id(),
                address = %record.primary_ip,
                "inventory address already known"
            );
            continue;
        }
        let name = record.name.clone();
        match poller.add_node(record).await {
            Ok(node) => info!(node_id = node.id(), name = %name, "inventory node added"),
            Err(e) => warn!(name = %name, error = %e, "cannot add inventory node"),
        }
    }
}

/// The UDP connector cannot tunnel through an agent, so SNMP proxies
/// configured on nodes have no effect here.
fn warn_proxied_snmp(poller: &Poller) -> usize {
    let mut proxied = 0;
    for node in poller.registry().nodes().iter() {
        if let Some(proxy) = node.read(|d| d.snmp_proxy_node) {
            warn!(node_id = node.id(), proxy, "SNMP proxy not supported, node is polled without SNMP");
            proxied += 1;
        }
    }
    proxied
}

/// Drain pending template cleanup requests into the log. Returns how
/// many there were.
fn log_dci_cleanup(poller: &Poller) -> usize {
    let requests = poller.drain_dci_cleanup();
    for request in &requests {
        info!(
            node_id = request.node_id,
            template_id = request.template_id,
            "template data collection items released"
        );
    }
    requests.len()
}

/// Drain cleanup requests once per configuration poll interval.
fn spawn_cleanup_log(poller: &Poller, every: Duration) -> JoinHandle<()> {
    let poller = poller.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let drained = log_dci_cleanup(&poller);
            if drained > 0 {
                debug!(drained, "template cleanup requests handled");
            }
        }
    })
}

fn spawn_event_log(poller: &Poller) -> Option<JoinHandle<()>> {
    let mut events = poller.events()?;
    Some(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let args = event
                        .args
                        .iter()
                        .map(|(name, value)| format!("{name}={value}"))
                        .collect::<Vec<_>>()
                        .join(" ");
                    info!(code = %event.code, node_id = event.node_id, args = %args, "event");
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }))
}
