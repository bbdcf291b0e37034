//! Transfers running on a node
//!
//! Tracks what holds a slot, notices when it ends and tells the owning
//! dispatcher. Status checks and every outbound call happen outside the
//! lock; the lock only guards the map.

use crate::admission::SlotGauge;
use crate::executor::{ExitState, ProcessHandle, ProcessInspector};
use crate::{NodeError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use xfer_sched::{
    with_timeout, ManagerClient, NodeId, OutcomeKind, QueuedTransfer, SchedulerClient,
    SchedulerId, TransferId, TransferKind, TransferOutcome,
};

/// Configuration for running-transfer tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunningConfig {
    /// Slots taken by a transfer whose protocol has no explicit weight
    pub default_weight: u32,
    /// Slots taken per protocol
    pub protocol_weights: HashMap<String, u32>,
    /// How long a slot waits for its client before it is released
    pub client_connect_timeout_secs: u64,
    /// Timeout for outcome reports and copy completion calls
    pub report_timeout_ms: u64,
}

impl Default for RunningConfig {
    fn default() -> Self {
        Self {
            default_weight: 1,
            protocol_weights: HashMap::new(),
            client_connect_timeout_secs: 300,
            report_timeout_ms: 5000,
        }
    }
}

impl RunningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_connect_timeout_secs == 0 {
            return Err(NodeError::InvalidConfig(
                "client_connect_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.report_timeout_ms == 0 {
            return Err(NodeError::InvalidConfig(
                "report_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn weight(&self, protocol: &str) -> u32 {
        self.protocol_weights
            .get(protocol)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn with_weight(mut self, protocol: impl Into<String>, weight: u32) -> Self {
        self.protocol_weights.insert(protocol.into(), weight);
        self
    }
}

/// How the end of a running transfer is detected
#[derive(Debug, Clone)]
enum Supervision {
    /// Spawned here, polled for its exit status
    Owned(Arc<dyn ProcessHandle>),
    /// Found running at startup, checked by pid and command line
    Adopted(u32),
    /// No local process: a copy source, or a slot waiting for its client
    Detached,
}

#[derive(Debug, Clone)]
struct RunningTransfer {
    queued: QueuedTransfer,
    supervision: Supervision,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Public view of one running transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningSummary {
    pub queued: QueuedTransfer,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Per-node set of running transfers
pub struct RunningTransferTracker {
    config: RunningConfig,
    node: NodeId,
    transfers: Mutex<HashMap<TransferId, RunningTransfer>>,
    inspector: Arc<dyn ProcessInspector>,
    manager: Arc<dyn ManagerClient>,
    schedulers: Arc<dyn SchedulerClient>,
}

impl std::fmt::Debug for RunningTransferTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTransferTracker")
            .field("node", &self.node)
            .field("running", &self.count())
            .field("used_slots", &self.used_slots())
            .finish()
    }
}

impl RunningTransferTracker {
    pub fn new(
        config: RunningConfig,
        node: NodeId,
        inspector: Arc<dyn ProcessInspector>,
        manager: Arc<dyn ManagerClient>,
        schedulers: Arc<dyn SchedulerClient>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            node,
            transfers: Mutex::new(HashMap::new()),
            inspector,
            manager,
            schedulers,
        })
    }

    fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.config.report_timeout_ms)
    }

    fn insert(&self, queued: QueuedTransfer, supervision: Supervision) -> bool {
        let id = queued.id().clone();
        let entry = RunningTransfer {
            queued,
            supervision,
            started: Instant::now(),
            started_at: Utc::now(),
        };
        let replaced = self.transfers.lock().insert(id.clone(), entry).is_some();
        if replaced {
            warn!(transfer_id = %id, node = %self.node, "Transfer was already running, entry replaced");
        }
        !replaced
    }

    /// Track a transfer that just started here
    pub fn add(&self, queued: QueuedTransfer, process: Option<Arc<dyn ProcessHandle>>) -> bool {
        let supervision = process.map_or(Supervision::Detached, Supervision::Owned);
        self.insert(queued, supervision)
    }

    /// Track a mover found running when the node started
    pub fn adopt(&self, queued: QueuedTransfer, pid: u32) -> bool {
        info!(transfer_id = %queued.id(), node = %self.node, pid, "Adopting running transfer");
        self.insert(queued, Supervision::Adopted(pid))
    }

    /// The client of a waiting slot connected and its mover started
    pub fn attach_process(&self, id: &TransferId, process: Arc<dyn ProcessHandle>) -> bool {
        match self.transfers.lock().get_mut(id) {
            Some(running) => {
                running.supervision = Supervision::Owned(process);
                true
            }
            None => false,
        }
    }

    /// Check every transfer for termination and report the ended ones
    pub async fn poll(&self) -> Vec<TransferOutcome> {
        let snapshot: Vec<(TransferId, RunningTransfer)> = self
            .transfers
            .lock()
            .iter()
            .map(|(id, running)| (id.clone(), running.clone()))
            .collect();

        let now = Instant::now();
        let mut ended = Vec::new();
        for (id, running) in snapshot {
            if let Some(outcome) = self.check(&id, &running, now) {
                ended.push((running.queued, outcome));
            }
        }
        if ended.is_empty() {
            return Vec::new();
        }

        let ended: Vec<(QueuedTransfer, TransferOutcome)> = {
            let mut transfers = self.transfers.lock();
            ended
                .into_iter()
                .filter(|(queued, _)| transfers.remove(queued.id()).is_some())
                .collect()
        };

        for (queued, _) in &ended {
            if queued.kind() == TransferKind::D2dDest {
                self.finish_copy(queued.id()).await;
            }
        }
        let outcomes: Vec<_> = ended
            .iter()
            .map(|(q, o)| (q.scheduler.clone(), o.clone()))
            .collect();
        self.report(outcomes.clone()).await;
        outcomes.into_iter().map(|(_, o)| o).collect()
    }

    /// Whether `pid` is still the mover of `id`; pids get reused
    fn owns(&self, id: &TransferId, pid: u32) -> bool {
        if !self.inspector.is_alive(pid) {
            return false;
        }
        let same = self
            .inspector
            .cmdline(pid)
            .is_some_and(|cmd| cmd.contains(id.as_str()));
        if !same {
            debug!(transfer_id = %id, pid, "Pid reused by another process");
        }
        same
    }

    fn check(&self, id: &TransferId, running: &RunningTransfer, now: Instant) -> Option<TransferOutcome> {
        let (kind, message) = match &running.supervision {
            Supervision::Adopted(pid) => {
                if self.owns(id, *pid) {
                    return None;
                }
                (
                    OutcomeKind::Completed { exit_code: None },
                    format!("Adopted mover {pid} ended, exit status unknown"),
                )
            }
            Supervision::Owned(process) => match process.try_wait() {
                Ok(None) => return None,
                Ok(Some(ExitState::Exited(0))) => {
                    (OutcomeKind::Completed { exit_code: Some(0) }, "Transfer ended".to_string())
                }
                Ok(Some(ExitState::Exited(rc))) => (
                    OutcomeKind::Failed { exit_code: rc },
                    format!("Mover exited with failure, rc={rc}"),
                ),
                Ok(Some(ExitState::Signaled(signal))) => {
                    let diagnostics = process.diagnostics();
                    let mut message = format!("Transfer has been killed by signal {signal}");
                    if !diagnostics.is_empty() {
                        message.push_str(": ");
                        message.push_str(&diagnostics);
                    }
                    (OutcomeKind::Killed { signal }, message)
                }
                Err(e) => {
                    warn!(transfer_id = %id, error = %e, "Unable to poll mover status");
                    return None;
                }
            },
            Supervision::Detached => {
                let timeout = Duration::from_secs(self.config.client_connect_timeout_secs);
                if running.queued.kind() != TransferKind::Standard
                    || now.duration_since(running.started) < timeout
                {
                    return None;
                }
                (
                    OutcomeKind::TimedOut,
                    "Timed out waiting for client connection".to_string(),
                )
            }
        };
        debug!(transfer_id = %id, node = %self.node, code = kind.code(), "Transfer ended");
        Some(TransferOutcome::new(id.clone(), kind, message).from_node(self.node.clone()))
    }

    async fn finish_copy(&self, id: &TransferId) {
        match with_timeout(self.report_timeout(), self.manager.finish_copy(id)).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!(transfer_id = %id, error = %e, "Timed out releasing copy source")
            }
            Err(e) => error!(transfer_id = %id, error = %e, "Failed to release copy source"),
        }
    }

    /// Send outcomes to their dispatchers, one call per scheduler
    async fn report(&self, outcomes: Vec<(SchedulerId, TransferOutcome)>) {
        let mut per_scheduler: HashMap<SchedulerId, Vec<TransferOutcome>> = HashMap::new();
        for (scheduler, outcome) in outcomes {
            per_scheduler.entry(scheduler).or_default().push(outcome);
        }
        for (scheduler, outcomes) in per_scheduler {
            let count = outcomes.len();
            let res = with_timeout(
                self.report_timeout(),
                self.schedulers.report_outcomes(&scheduler, outcomes),
            )
            .await;
            match res {
                Ok(()) => debug!(scheduler = %scheduler, count, "Informed scheduler of ended transfers"),
                Err(e) if e.is_timeout() => {
                    warn!(scheduler = %scheduler, count, error = %e, "Timed out informing scheduler of ended transfers")
                }
                Err(e) => {
                    error!(scheduler = %scheduler, count, error = %e, "Failed to inform scheduler of ended transfers")
                }
            }
        }
    }

    /// The destination of a copy finished; complete the source leg held here
    pub async fn end_source(&self, id: &TransferId) -> bool {
        let removed = {
            let mut transfers = self.transfers.lock();
            match transfers.get(id) {
                Some(r) if r.queued.kind() == TransferKind::D2dSource => transfers.remove(id),
                _ => None,
            }
        };
        let Some(running) = removed else {
            debug!(transfer_id = %id, node = %self.node, "No running copy source to end");
            return false;
        };
        if let Supervision::Owned(process) = &running.supervision {
            if let Err(e) = process.kill() {
                debug!(transfer_id = %id, error = %e, "Source mover already gone");
            }
        }
        let outcome = TransferOutcome::new(
            id.clone(),
            OutcomeKind::Completed { exit_code: None },
            "Copy source ended",
        )
        .from_node(self.node.clone());
        self.report(vec![(running.queued.scheduler, outcome)]).await;
        true
    }

    /// Drop transfers and kill their movers; nothing is reported
    pub fn kill(&self, ids: &[TransferId]) -> Vec<TransferId> {
        let removed: Vec<RunningTransfer> = {
            let mut transfers = self.transfers.lock();
            ids.iter().filter_map(|id| transfers.remove(id)).collect()
        };
        let mut killed = Vec::with_capacity(removed.len());
        for running in removed {
            let id = running.queued.id().clone();
            match &running.supervision {
                Supervision::Owned(process) => {
                    if let Err(e) = process.kill() {
                        debug!(transfer_id = %id, error = %e, "Mover already gone");
                    }
                }
                Supervision::Adopted(pid) => {
                    if self.owns(&id, *pid) {
                        if let Err(e) = self.inspector.terminate(*pid) {
                            warn!(transfer_id = %id, pid, error = %e, "Failed to terminate adopted mover");
                        }
                    }
                }
                Supervision::Detached => {}
            }
            info!(transfer_id = %id, node = %self.node, "Killed running transfer");
            killed.push(id);
        }
        killed
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.transfers.lock().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn list(&self) -> Vec<RunningSummary> {
        self.transfers
            .lock()
            .values()
            .map(|r| RunningSummary {
                queued: r.queued.clone(),
                pid: match &r.supervision {
                    Supervision::Owned(p) => p.pid(),
                    Supervision::Adopted(pid) => Some(*pid),
                    Supervision::Detached => None,
                },
                started_at: r.started_at,
            })
            .collect()
    }

    /// Copy sources running here on behalf of a scheduler
    pub fn running_sources(&self, scheduler: &SchedulerId) -> Vec<TransferId> {
        self.transfers
            .lock()
            .values()
            .filter(|r| r.queued.kind() == TransferKind::D2dSource && &r.queued.scheduler == scheduler)
            .map(|r| r.queued.id().clone())
            .collect()
    }

    pub fn any_from_scheduler(&self, scheduler: &SchedulerId) -> bool {
        self.transfers
            .lock()
            .values()
            .any(|r| &r.queued.scheduler == scheduler)
    }
}

impl SlotGauge for RunningTransferTracker {
    fn used_slots(&self) -> u32 {
        self.transfers
            .lock()
            .values()
            .map(|r| self.config.weight(&r.queued.transfer.protocol))
            .sum()
    }
}
