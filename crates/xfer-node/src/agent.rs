//! Node agent: the per-node loop tying queue, running set and manager together
//!
//! Inbound calls from the manager land on the `on_*` handlers. The loop in
//! [`NodeAgent::run`] interleaves maintenance with dequeuing, asks the
//! manager for permission to start and hands winners to the executor.

use crate::admission::{LocalAdmissionQueue, SlotGauge};
use crate::executor::ProcessExecutor;
use crate::running::RunningTransferTracker;
use crate::{NodeError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use xfer_sched::{
    with_timeout, ManagerClient, NodeId, OutcomeKind, QueuedTransfer, SchedulerClient,
    SchedulerId, StartDecision, TransferId, TransferKind, TransferOutcome,
};

/// Configuration for the node agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_id: String,
    /// Minimum time between two maintenance passes
    pub maintenance_interval_ms: u64,
    /// Timeout for calls to the manager and dispatchers
    pub remote_timeout_ms: u64,
    /// Pause when every slot is taken
    pub slot_wait_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: "localhost".to_string(),
            maintenance_interval_ms: 1000,
            remote_timeout_ms: 5000,
            slot_wait_ms: 200,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(NodeError::InvalidConfig("node_id must not be empty".to_string()));
        }
        if self.remote_timeout_ms == 0 || self.slot_wait_ms == 0 {
            return Err(NodeError::InvalidConfig(
                "timeouts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// What one pass of the loop did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every slot taken, nothing dequeued
    Full,
    /// Queue empty
    Idle,
    Started(TransferId),
    /// Destination parked until its source starts
    Deferred(TransferId),
    /// Another node won
    Dropped(TransferId),
    /// Manager unreachable, transfer re-queued with priority
    Requeued(TransferId),
    /// Allowed to start but the mover could not be launched
    SpawnFailed(TransferId),
}

/// Per-node agent
pub struct NodeAgent {
    config: AgentConfig,
    node: NodeId,
    queue: Arc<LocalAdmissionQueue>,
    running: Arc<RunningTransferTracker>,
    manager: Arc<dyn ManagerClient>,
    schedulers: Arc<dyn SchedulerClient>,
    executor: Arc<dyn ProcessExecutor>,
    last_maintenance: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("node", &self.node)
            .field("queue", &self.queue)
            .field("running", &self.running)
            .finish()
    }
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        queue: Arc<LocalAdmissionQueue>,
        running: Arc<RunningTransferTracker>,
        manager: Arc<dyn ManagerClient>,
        schedulers: Arc<dyn SchedulerClient>,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            node: NodeId::new(config.node_id.clone()),
            config,
            queue,
            running,
            manager,
            schedulers,
            executor,
            last_maintenance: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn queue(&self) -> &Arc<LocalAdmissionQueue> {
        &self.queue
    }

    pub fn running(&self) -> &Arc<RunningTransferTracker> {
        &self.running
    }

    fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.config.remote_timeout_ms)
    }

    /// The manager offers a transfer
    pub fn on_offer(&self, queued: QueuedTransfer) -> bool {
        if self.running.contains(queued.id()) {
            debug!(transfer_id = %queued.id(), node = %self.node, "Offer for a transfer already running here");
            return false;
        }
        if queued.source_ready {
            self.queue.admit_priority(queued)
        } else {
            self.queue.admit(queued)
        }
    }

    /// The manager withdraws transfers, queued or running
    pub fn on_withdraw(&self, ids: &[TransferId]) -> usize {
        let dropped = self.queue.cancel(ids).len();
        let killed = self.running.kill(ids).len();
        debug!(node = %self.node, dropped, killed, "Transfers withdrawn");
        dropped + killed
    }

    pub fn on_source_ready(&self, id: &TransferId) -> bool {
        self.queue.promote_source_ready(id)
    }

    pub fn on_already_started(&self, id: &TransferId) -> bool {
        let dropped = !self.queue.cancel(std::slice::from_ref(id)).is_empty();
        if !dropped {
            debug!(transfer_id = %id, node = %self.node, "Transfer started elsewhere was not queued here");
        }
        dropped
    }

    pub async fn on_copy_finished(&self, id: &TransferId) -> bool {
        self.running.end_source(id).await
    }

    /// Rebuild the queue from what the manager believes is queued here
    pub async fn resync(&self) -> Result<usize> {
        let queued = with_timeout(self.remote_timeout(), self.manager.list_queued(&self.node)).await?;
        let mut admitted = 0;
        for q in queued {
            if self.queue.contains(q.id()) || self.running.contains(q.id()) {
                continue;
            }
            if self.on_offer(q) {
                admitted += 1;
            }
        }
        info!(node = %self.node, admitted, "Node resynchronised with manager");
        Ok(admitted)
    }

    /// Drop queued transfers whose capacity went away; all of it when
    /// `mountpoints` is `None`
    pub async fn disable_capacity(&self, mountpoints: Option<&[String]>) -> usize {
        let dropped = self.queue.cancel_for_disabled_capacity(mountpoints);
        let count = dropped.len();
        self.report_cancelled(dropped).await;
        count
    }

    /// Periodic work: waiting destinations, queue timeouts, ended transfers
    pub async fn maintenance(&self) {
        let promoted = self.queue.poll_d2d_dest();
        if promoted > 0 {
            debug!(node = %self.node, promoted, "Waiting destinations retried");
        }
        let expired = self.queue.cancel_expired();
        if !expired.is_empty() {
            info!(node = %self.node, count = expired.len(), "Queued transfers timed out");
            self.report_cancelled(expired).await;
        }
        self.running.poll().await;
    }

    fn maintenance_due(&self) -> bool {
        let mut last = self.last_maintenance.lock();
        let now = Instant::now();
        let due = match *last {
            None => true,
            Some(at) => {
                now.duration_since(at) >= Duration::from_millis(self.config.maintenance_interval_ms)
            }
        };
        if due {
            *last = Some(now);
        }
        due
    }

    /// One pass of the node loop
    pub async fn tick(&self) -> TickOutcome {
        if self.maintenance_due() {
            self.maintenance().await;
        }

        let used = self.running.used_slots();
        if used >= self.queue.config().total_slots {
            debug!(node = %self.node, used, "All slots taken");
            tokio::time::sleep(Duration::from_millis(self.config.slot_wait_ms)).await;
            return TickOutcome::Full;
        }

        let Some(queued) = self.queue.dequeue().await else {
            return TickOutcome::Idle;
        };
        let id = queued.id().clone();
        let decision = with_timeout(
            self.remote_timeout(),
            self.manager.try_start(&self.node, &queued.transfer),
        )
        .await;

        match decision {
            Ok(StartDecision::Accepted { source_node }) => self.start(queued, source_node).await,
            Ok(StartDecision::SourceNotReady) => {
                self.queue.dest_waiting_for_source(queued);
                TickOutcome::Deferred(id)
            }
            Ok(StartDecision::AlreadyStartedElsewhere) => {
                debug!(transfer_id = %id, node = %self.node, "Transfer started elsewhere, dropping");
                TickOutcome::Dropped(id)
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!(transfer_id = %id, node = %self.node, error = %e, "Timed out asking to start transfer");
                } else {
                    warn!(transfer_id = %id, node = %self.node, error = %e, "Failed to ask to start transfer");
                }
                // A lost answer is recognised as a retry by the manager
                self.queue.admit_priority(queued);
                TickOutcome::Requeued(id)
            }
        }
    }

    async fn start(&self, queued: QueuedTransfer, source_node: Option<NodeId>) -> TickOutcome {
        let id = queued.id().clone();
        if queued.kind() == TransferKind::D2dSource {
            self.running.add(queued, None);
            info!(transfer_id = %id, node = %self.node, "Copy source started");
            return TickOutcome::Started(id);
        }

        match self.executor.spawn(&queued, source_node.as_ref()) {
            Ok(process) => {
                info!(transfer_id = %id, node = %self.node, source = ?source_node, "Transfer started");
                self.running.add(queued, process);
                TickOutcome::Started(id)
            }
            Err(e) => {
                error!(transfer_id = %id, node = %self.node, error = %e, "Failed to start mover");
                if queued.kind() == TransferKind::D2dDest {
                    if let Err(e) =
                        with_timeout(self.remote_timeout(), self.manager.finish_copy(&id)).await
                    {
                        warn!(transfer_id = %id, error = %e, "Failed to release copy source");
                    }
                }
                let outcome = TransferOutcome::new(
                    id.clone(),
                    OutcomeKind::Failed { exit_code: -1 },
                    format!("Failed to start mover: {e}"),
                )
                .from_node(self.node.clone());
                let res = with_timeout(
                    self.remote_timeout(),
                    self.schedulers.report_outcomes(&queued.scheduler, vec![outcome]),
                )
                .await;
                if let Err(e) = res {
                    warn!(transfer_id = %id, scheduler = %queued.scheduler, error = %e,
                        "Failed to inform scheduler of mover failure");
                }
                TickOutcome::SpawnFailed(id)
            }
        }
    }

    async fn report_cancelled(&self, dropped: Vec<(SchedulerId, TransferOutcome)>) {
        let mut per_scheduler: HashMap<SchedulerId, Vec<TransferOutcome>> = HashMap::new();
        for (scheduler, outcome) in dropped {
            per_scheduler.entry(scheduler).or_default().push(outcome);
        }
        for (scheduler, outcomes) in per_scheduler {
            let count = outcomes.len();
            let res = with_timeout(
                self.remote_timeout(),
                self.schedulers.report_cancelled(&scheduler, &self.node, outcomes),
            )
            .await;
            match res {
                Ok(()) => debug!(scheduler = %scheduler, count, "Informed scheduler of dropped transfers"),
                Err(e) if e.is_timeout() => {
                    warn!(scheduler = %scheduler, count, error = %e, "Timed out informing scheduler of dropped transfers")
                }
                Err(e) => {
                    error!(scheduler = %scheduler, count, error = %e, "Failed to inform scheduler of dropped transfers")
                }
            }
        }
    }

    /// Loop until `shutdown` flips to true
    ///
    /// A pass is never interrupted halfway, so a dequeued transfer is always
    /// either started, parked or re-queued.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(node = %self.node, "Node agent started");
        while !*shutdown.borrow() {
            self.tick().await;
        }
        info!(node = %self.node, "Node agent stopped");
    }
}
