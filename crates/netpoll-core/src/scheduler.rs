// ── Poll scheduling ──
//
// One ticker task walks the node snapshot and queues nodes whose poll
// interval elapsed; a fixed set of workers drains the bounded queue.
// A node is queued at most once per poll kind, tracked by its
// QUEUED_FOR_* dynamic flag until the poll finishes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::model::{DynamicFlags, Node, NodeData};
use crate::poll::{Engine, config_poll, status_poll};

/// Which cycle to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PollKind {
    Status,
    Configuration,
}

impl PollKind {
    pub fn queued_flag(self) -> DynamicFlags {
        match self {
            Self::Status => DynamicFlags::QUEUED_FOR_STATUS_POLL,
            Self::Configuration => DynamicFlags::QUEUED_FOR_CONFIG_POLL,
        }
    }

    fn last_run(self, data: &NodeData) -> Option<DateTime<Utc>> {
        match self {
            Self::Status => data.last_status_poll,
            Self::Configuration => data.last_config_poll,
        }
    }
}

pub(crate) struct PollRequest {
    pub node: Arc<Node>,
    pub kind: PollKind,
}

pub(crate) type PollQueue = Arc<Mutex<mpsc::Receiver<PollRequest>>>;

fn interval_of(engine: &Engine, kind: PollKind) -> TimeDelta {
    let interval = match kind {
        PollKind::Status => engine.config.status_interval,
        PollKind::Configuration => engine.config.configuration_interval,
    };
    TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX)
}

/// Polling is allowed and the interval since the last run elapsed.
fn is_due(node: &Node, kind: PollKind, interval: TimeDelta, now: DateTime<Utc>) -> bool {
    node.read(|d| {
        let blocked = DynamicFlags::POLLING_DISABLED | DynamicFlags::DELETE_IN_PROGRESS | kind.queued_flag();
        d.managed
            && !d.dynamic.intersects(blocked)
            && kind.last_run(d).is_none_or(|last| now - last >= interval)
    })
}

/// Put one node on the queue. The queued flag is set first so the next
/// tick skips it; a full queue clears it again.
pub(crate) fn try_queue(tx: &mpsc::Sender<PollRequest>, node: &Arc<Node>, kind: PollKind) -> bool {
    let flag = kind.queued_flag();
    node.set_dynamic(flag);
    match tx.try_send(PollRequest {
        node: Arc::clone(node),
        kind,
    }) {
        Ok(()) => {
            trace!(node_id = node.id(), %kind, "poll queued");
            true
        }
        Err(TrySendError::Full(request)) => {
            debug!(node_id = node.id(), %kind, "poll queue full, retrying next tick");
            request.node.finish_queued(flag);
            false
        }
        Err(TrySendError::Closed(request)) => {
            request.node.finish_queued(flag);
            false
        }
    }
}

/// Queue every due node. Configuration polls go first so fresh nodes
/// are classified before their first status poll.
pub(crate) fn queue_due(engine: &Engine, tx: &mpsc::Sender<PollRequest>) -> usize {
    let now = engine.now();
    let mut queued = 0;
    for kind in [PollKind::Configuration, PollKind::Status] {
        let interval = interval_of(engine, kind);
        for node in engine.registry.nodes().iter() {
            if is_due(node, kind, interval, now) && try_queue(tx, node, kind) {
                queued += 1;
            }
        }
    }
    queued
}

/// Clears a queued flag when dropped, so a panicking poll still
/// releases the node.
struct QueuedGuard<'a> {
    node: &'a Node,
    flag: DynamicFlags,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.node.finish_queued(self.flag);
    }
}

/// Run one queued poll and release the node's queued flag.
pub(crate) async fn execute(engine: &Engine, request: PollRequest) {
    let PollRequest { node, kind } = request;
    let _queued = QueuedGuard {
        node: &node,
        flag: kind.queued_flag(),
    };
    let disabled = node
        .dynamic()
        .intersects(DynamicFlags::POLLING_DISABLED | DynamicFlags::DELETE_IN_PROGRESS);
    if disabled {
        trace!(node_id = node.id(), %kind, "polling disabled, dropping queued poll");
        return;
    }
    match kind {
        PollKind::Status => status_poll::run(engine, &node).await,
        PollKind::Configuration => {
            config_poll::run(engine, &node).await;
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

pub(crate) async fn scheduler_task(
    engine: Arc<Engine>,
    tx: mpsc::Sender<PollRequest>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let queued = queue_due(&engine, &tx);
                if queued > 0 {
                    debug!(queued, "nodes queued for polling");
                }
            }
        }
    }
    debug!("scheduler stopped");
}

pub(crate) async fn worker_task(engine: Arc<Engine>, queue: PollQueue, worker: usize, cancel: CancellationToken) {
    loop {
        let request = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                request = rx.recv() => request,
            }
        };
        let Some(request) = request else { break };
        let (node_id, kind) = (request.node.id(), request.kind);
        trace!(worker, node_id, %kind, "worker picked up poll");
        let task_engine = Arc::clone(&engine);
        if let Err(e) = tokio::spawn(async move { execute(&task_engine, request).await }).await {
            error!(worker, node_id, %kind, error = %e, "poll task failed");
        }
    }
    debug!(worker, "poll worker stopped");
}

/// Release every request still waiting after the workers stopped.
pub(crate) async fn drain(queue: &PollQueue) -> usize {
    let mut rx = queue.lock().await;
    let mut dropped = 0;
    while let Ok(request) = rx.try_recv() {
        request.node.finish_queued(request.kind.queued_flag());
        dropped += 1;
    }
    if dropped > 0 {
        warn!(dropped, "queued polls dropped at shutdown");
    }
    dropped
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::model::NodeRecord;

    use super::*;

    fn node() -> Arc<Node> {
        let record = NodeRecord::new(7, "edge", "10.0.0.7".parse().unwrap());
        Arc::new(Node::from_record(&record, Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn queued_flag_is_released_when_a_poll_panics() {
        let node = node();
        node.set_dynamic(DynamicFlags::QUEUED_FOR_STATUS_POLL);

        let task = {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let _queued = QueuedGuard {
                    node: &node,
                    flag: DynamicFlags::QUEUED_FOR_STATUS_POLL,
                };
                panic!("device sent garbage");
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert!(!node.dynamic().intersects(DynamicFlags::QUEUED));
        tokio::time::timeout(Duration::from_secs(1), node.wait_idle(Duration::from_millis(10)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_queue_does_not_leave_the_node_queued() {
        let (tx, _rx) = mpsc::channel(1);
        let (first, second) = (node(), node());
        assert!(try_queue(&tx, &first, PollKind::Status));
        assert!(!try_queue(&tx, &second, PollKind::Status));
        assert!(first.dynamic().contains(DynamicFlags::QUEUED_FOR_STATUS_POLL));
        assert!(!second.dynamic().contains(DynamicFlags::QUEUED_FOR_STATUS_POLL));
    }
}
