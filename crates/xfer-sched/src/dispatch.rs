//! Dispatcher: pulls pending work and places it on candidate nodes
//!
//! Runs as independent tasks talking over bounded channels:
//!
//! - **Poll loop**: fetches requests from the work source, applies the
//!   optional per-second quota and feeds the work channel
//! - **Workers**: a fixed pool placing each request on its candidates
//! - **Outcome writer**: batches outcomes to the work source so that each
//!   transfer does not cost one store round-trip
//!
//! A failure on one candidate never aborts the offers to the others, and a
//! single bad request never stalls the pipeline.

use crate::directory::{NodeDirectory, PoolDirectoryCache, UNKNOWN_POOL};
use crate::placement::{PendingTransfer, PlacementTracker};
use crate::remote::{with_timeout, NodeClient, SchedulerClient, WorkSource};
use crate::types::{
    NodeId, OutcomeKind, QueuedTransfer, ScheduleRequest, SchedulerId, Transfer, TransferOutcome,
};
use crate::{Result, SchedError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Configuration for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Identity stamped on every transfer this dispatcher places
    pub scheduler_id: String,
    /// Size of the worker pool
    pub worker_count: usize,
    /// Capacity of the work channel between poll loop and workers
    pub work_queue_capacity: usize,
    /// Capacity of the outcome channel feeding the writer
    pub outcome_queue_capacity: usize,
    /// Outcomes per store call
    pub outcome_batch_size: usize,
    /// Flush a partial batch after this long
    pub outcome_flush_interval_ms: u64,
    /// Attempts for one batch before it is dropped
    pub outcome_max_retries: u32,
    /// Optional quota of transfers scheduled per wall-clock second
    pub max_scheduled_per_second: Option<u32>,
    /// Timeout for each call to a node
    pub remote_timeout_ms: u64,
    /// How long one poll of the work source may wait for new work
    pub poll_wait_ms: u64,
    /// Pause between reconnection attempts to the work source
    pub reconnect_delay_ms: u64,
    /// How long a loaded node to pool mapping is trusted
    pub pool_directory_max_age_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            scheduler_id: "transfer-manager".to_string(),
            worker_count: 4,
            work_queue_capacity: 1000,
            outcome_queue_capacity: 10_000,
            outcome_batch_size: 100,
            outcome_flush_interval_ms: 1000,
            outcome_max_retries: 3,
            max_scheduled_per_second: None,
            remote_timeout_ms: 5000,
            poll_wait_ms: 1000,
            reconnect_delay_ms: 1000,
            pool_directory_max_age_ms: 300_000,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_id.is_empty() {
            return Err(SchedError::InvalidConfig(
                "scheduler_id must not be empty".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(SchedError::InvalidConfig(
                "worker_count must be > 0".to_string(),
            ));
        }
        if self.work_queue_capacity == 0 || self.outcome_queue_capacity == 0 {
            return Err(SchedError::InvalidConfig(
                "channel capacities must be > 0".to_string(),
            ));
        }
        if self.outcome_batch_size == 0 {
            return Err(SchedError::InvalidConfig(
                "outcome_batch_size must be > 0".to_string(),
            ));
        }
        if self.outcome_flush_interval_ms == 0
            || self.remote_timeout_ms == 0
            || self.pool_directory_max_age_ms == 0
        {
            return Err(SchedError::InvalidConfig(
                "intervals and timeouts must be > 0".to_string(),
            ));
        }
        if self.max_scheduled_per_second == Some(0) {
            return Err(SchedError::InvalidConfig(
                "max_scheduled_per_second must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_scheduler_id(mut self, id: impl Into<String>) -> Self {
        self.scheduler_id = id.into();
        self
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.max_scheduled_per_second = Some(per_second);
        self
    }
}

/// Per-wall-clock-second quota on scheduled transfers
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_second: Option<u32>,
    second: u64,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_per_second: Option<u32>) -> Self {
        Self {
            max_per_second,
            second: 0,
            count: 0,
        }
    }

    /// Take one unit of quota now, or learn how long to wait for the next second
    pub fn throttle(&mut self) -> Option<Duration> {
        self.throttle_at(SystemTime::now())
    }

    pub fn throttle_at(&mut self, now: SystemTime) -> Option<Duration> {
        let max = self.max_per_second?;
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let second = since_epoch.as_secs();
        if second != self.second {
            self.second = second;
            self.count = 0;
        }
        if self.count >= max {
            return Some(Duration::from_secs(1) - Duration::from_nanos(u64::from(since_epoch.subsec_nanos())));
        }
        self.count += 1;
        None
    }
}

/// Offer results per node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOfferStats {
    pub accepted: u64,
    pub failed: u64,
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub scheduled: u64,
    pub placement_failed: u64,
    pub outcomes_recorded: u64,
    pub outcomes_dropped: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    placement_failed: AtomicU64,
    outcomes_recorded: AtomicU64,
    outcomes_dropped: AtomicU64,
    store_errors: AtomicU64,
}

/// Handle on a running dispatcher
pub struct DispatcherHandle {
    stop: watch::Sender<bool>,
    writer_stop: watch::Sender<bool>,
    poller: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop polling, let workers finish what was already fetched, then flush outcomes
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.poller.await {
            warn!(error = %e, "Poll loop ended abnormally");
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        let _ = self.writer_stop.send(true);
        if let Err(e) = self.writer.await {
            warn!(error = %e, "Outcome writer ended abnormally");
        }
    }
}

/// Central dispatcher placing pending transfers on nodes
pub struct Dispatcher {
    config: DispatcherConfig,
    id: SchedulerId,
    tracker: Arc<PlacementTracker>,
    nodes: Arc<dyn NodeClient>,
    source: Arc<dyn WorkSource>,
    outcome_tx: mpsc::Sender<TransferOutcome>,
    outcome_rx: Mutex<Option<mpsc::Receiver<TransferOutcome>>>,
    offers: DashMap<NodeId, NodeOfferStats>,
    counters: Counters,
    pools: Option<PoolDirectoryCache>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        tracker: Arc<PlacementTracker>,
        nodes: Arc<dyn NodeClient>,
        source: Arc<dyn WorkSource>,
    ) -> Result<Self> {
        config.validate()?;
        let (outcome_tx, outcome_rx) = mpsc::channel(config.outcome_queue_capacity);
        Ok(Self {
            id: SchedulerId::new(config.scheduler_id.clone()),
            config,
            tracker,
            nodes,
            source,
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
            offers: DashMap::new(),
            counters: Counters::default(),
            pools: None,
        })
    }

    /// Resolve node pools through `directory` for the monitoring queries
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn NodeDirectory>) -> Self {
        let max_age = Duration::from_millis(self.config.pool_directory_max_age_ms);
        self.pools = Some(PoolDirectoryCache::new(directory, max_age));
        self
    }

    #[must_use]
    pub fn id(&self) -> &SchedulerId {
        &self.id
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<PlacementTracker> {
        &self.tracker
    }

    fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.config.remote_timeout_ms)
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_delay_ms)
    }

    /// Spawn the poll loop, the worker pool and the outcome writer
    pub fn start(self: &Arc<Self>) -> Result<DispatcherHandle> {
        let outcome_rx = self.outcome_rx.lock().take().ok_or_else(|| {
            SchedError::InvalidConfig("dispatcher already started".to_string())
        })?;
        let (work_tx, work_rx) = mpsc::channel(self.config.work_queue_capacity);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (stop, stop_rx) = watch::channel(false);
        let (writer_stop, writer_stop_rx) = watch::channel(false);

        let poller = tokio::spawn(Arc::clone(self).poll_loop(work_tx, stop_rx));
        let workers = (0..self.config.worker_count)
            .map(|index| tokio::spawn(Arc::clone(self).worker(index, Arc::clone(&work_rx))))
            .collect();
        let writer = tokio::spawn(Arc::clone(self).outcome_writer(outcome_rx, writer_stop_rx));

        info!(scheduler = %self.id, workers = self.config.worker_count, "Dispatcher started");
        Ok(DispatcherHandle {
            stop,
            writer_stop,
            poller,
            workers,
            writer,
        })
    }

    async fn poll_loop(
        self: Arc<Self>,
        work_tx: mpsc::Sender<ScheduleRequest>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut limiter = RateLimiter::new(self.config.max_scheduled_per_second);
        let wait = Duration::from_millis(self.config.poll_wait_ms);
        loop {
            if *stop.borrow() {
                break;
            }
            let next = tokio::select! {
                _ = stop.changed() => break,
                res = self.source.next_request(wait) => res,
            };
            match next {
                Ok(Some(request)) => {
                    while let Some(pause) = limiter.throttle() {
                        debug!(pause_ms = pause.as_millis() as u64, "Scheduling quota reached");
                        tokio::time::sleep(pause).await;
                    }
                    if work_tx.send(request).await.is_err() {
                        warn!("Work channel closed, stopping poll loop");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_connectivity() => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Lost work source connection, reconnecting");
                    tokio::select! {
                        _ = stop.changed() => break,
                        () = tokio::time::sleep(self.reconnect_delay()) => {}
                    }
                    if let Err(e) = self.source.reconnect().await {
                        warn!(error = %e, "Failed to reconnect to work source");
                    }
                }
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Failed to fetch pending work");
                    tokio::select! {
                        _ = stop.changed() => break,
                        () = tokio::time::sleep(self.reconnect_delay()) => {}
                    }
                }
            }
        }
        debug!(scheduler = %self.id, "Poll loop stopped");
    }

    async fn worker(
        self: Arc<Self>,
        index: usize,
        work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ScheduleRequest>>>,
    ) {
        loop {
            let next = work_rx.lock().await.recv().await;
            let Some(request) = next else {
                break;
            };
            let outcome = self.schedule(request).await;
            if self.record(outcome).await.is_err() {
                break;
            }
        }
        debug!(worker = index, "Worker stopped");
    }

    /// Place one request and return its scheduling outcome
    pub async fn schedule(&self, request: ScheduleRequest) -> TransferOutcome {
        let outcome = match request {
            ScheduleRequest::Standard(transfer) => self.schedule_standard(transfer).await,
            ScheduleRequest::DiskCopy {
                source,
                destination,
            } => self.schedule_d2d(source, destination).await,
        };
        match outcome.kind {
            OutcomeKind::Scheduled => self.counters.scheduled.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.placement_failed.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Offer a transfer to all its candidates; it stays queued if one accepts
    pub async fn schedule_standard(&self, transfer: Transfer) -> TransferOutcome {
        if let Err(e) = self.tracker.put(&transfer, &self.id) {
            warn!(transfer_id = %transfer.id, error = %e, "Unable to register transfer");
            return TransferOutcome::new(
                transfer.id,
                OutcomeKind::PlacementFailed,
                format!("failed: {e}"),
            );
        }
        let id = transfer.id.clone();
        if self.offer_all(&transfer).await {
            debug!(transfer_id = %id, "Transfer scheduled");
            TransferOutcome::scheduled(id)
        } else {
            self.tracker.cancel_and_withdraw(&[id.clone()]).await;
            warn!(transfer_id = %id, "No candidate accepted the transfer");
            TransferOutcome::placement_failed(id)
        }
    }

    /// Place the source leg, then fan the destination out
    pub async fn schedule_d2d(&self, source: Transfer, destination: Transfer) -> TransferOutcome {
        let id = source.id.clone();
        if destination.id != id {
            return TransferOutcome::new(
                id,
                OutcomeKind::PlacementFailed,
                format!("failed: destination leg {} does not match", destination.id),
            );
        }
        if let Err(e) = self.tracker.put(&source, &self.id) {
            warn!(transfer_id = %id, error = %e, "Unable to register copy source");
            return TransferOutcome::new(id, OutcomeKind::PlacementFailed, format!("failed: {e}"));
        }

        let source_node = source.candidates[0].node.clone();
        let offered = with_timeout(
            self.remote_timeout(),
            self.nodes
                .offer(&source_node, QueuedTransfer::new(source.clone(), self.id.clone())),
        )
        .await;
        self.count_offer(&source_node, offered.is_ok());
        if let Err(e) = offered {
            warn!(transfer_id = %id, node = %source_node, error = %e,
                "Failed to place copy source, not trying destinations");
            self.tracker.cancel_and_withdraw(&[id.clone()]).await;
            return TransferOutcome::placement_failed(id);
        }

        let candidates: Vec<_> = destination
            .candidates
            .iter()
            .filter(|p| p.node != source_node)
            .cloned()
            .collect();
        let destination = destination.with_candidates(candidates);
        if destination.candidates.is_empty() {
            warn!(transfer_id = %id, "Copy has no destination candidate besides its source");
            self.tracker.cancel_and_withdraw(&[id.clone()]).await;
            return TransferOutcome::placement_failed(id);
        }
        if let Err(e) = self.tracker.put(&destination, &self.id) {
            debug!(transfer_id = %id, error = %e, "Copy source vanished before destinations were placed");
            self.tracker.cancel_and_withdraw(&[id.clone()]).await;
            return TransferOutcome::new(id, OutcomeKind::PlacementFailed, format!("failed: {e}"));
        }

        if self.offer_all(&destination).await {
            debug!(transfer_id = %id, source = %source_node, "Copy scheduled");
            TransferOutcome::scheduled(id)
        } else {
            warn!(transfer_id = %id, "No destination accepted the copy");
            self.tracker.cancel_and_withdraw(&[id.clone()]).await;
            TransferOutcome::placement_failed(id)
        }
    }

    /// Offer to every candidate concurrently; returns whether one accepted.
    /// Failed candidates are dropped from the tracker unless none succeeded.
    async fn offer_all(&self, transfer: &Transfer) -> bool {
        let limit = self.remote_timeout();
        let mut set = JoinSet::new();
        for placement in &transfer.candidates {
            let client = Arc::clone(&self.nodes);
            let queued = QueuedTransfer::new(transfer.clone(), self.id.clone());
            let node = placement.node.clone();
            set.spawn(async move {
                let res = with_timeout(limit, client.offer(&node, queued)).await;
                (node, res)
            });
        }

        let mut failed = Vec::new();
        let mut accepted = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((node, Ok(()))) => {
                    self.count_offer(&node, true);
                    accepted += 1;
                }
                Ok((node, Err(e))) => {
                    if e.is_timeout() {
                        warn!(transfer_id = %transfer.id, node = %node, error = %e, "Offer timed out");
                    } else {
                        warn!(transfer_id = %transfer.id, node = %node, error = %e, "Offer failed");
                    }
                    self.count_offer(&node, false);
                    failed.push(node);
                }
                Err(e) => error!(transfer_id = %transfer.id, error = %e, "Offer task failed"),
            }
        }

        if accepted > 0 {
            for node in &failed {
                self.tracker.offer_failed(&transfer.id, node);
            }
        }
        accepted > 0
    }

    fn count_offer(&self, node: &NodeId, accepted: bool) {
        let mut entry = self.offers.entry(node.clone()).or_default();
        if accepted {
            entry.accepted += 1;
        } else {
            entry.failed += 1;
        }
    }

    /// Queue an outcome for the writer
    ///
    /// Fails with [`SchedError::ChannelClosed`] once the writer has stopped;
    /// the outcome is counted as dropped.
    pub async fn record(&self, outcome: TransferOutcome) -> Result<()> {
        self.outcome_tx.send(outcome).await.map_err(|e| {
            self.counters.outcomes_dropped.fetch_add(1, Ordering::Relaxed);
            error!(transfer_id = %e.0.transfer_id, "Outcome writer gone, dropping outcome");
            SchedError::ChannelClosed(format!("outcome writer for {}", e.0.transfer_id))
        })
    }

    async fn outcome_writer(
        self: Arc<Self>,
        mut outcome_rx: mpsc::Receiver<TransferOutcome>,
        mut stop: watch::Receiver<bool>,
    ) {
        let batch_size = self.config.outcome_batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.outcome_flush_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = outcome_rx.recv() => match next {
                    Some(outcome) => {
                        batch.push(outcome);
                        if batch.len() >= batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = stop.changed() => {
                    while let Ok(outcome) = outcome_rx.try_recv() {
                        batch.push(outcome);
                    }
                    break;
                }
            }
        }
        while !batch.is_empty() {
            let rest = batch.split_off(batch.len().min(batch_size));
            self.flush(&mut batch).await;
            batch = rest;
        }
        debug!(scheduler = %self.id, "Outcome writer stopped");
    }

    async fn flush(&self, batch: &mut Vec<TransferOutcome>) {
        let mut attempt = 0u32;
        loop {
            match self.source.record_outcomes(batch).await {
                Ok(()) => {
                    self.counters
                        .outcomes_recorded
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    batch.clear();
                    return;
                }
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    if attempt > self.config.outcome_max_retries {
                        error!(count = batch.len(), error = %e, "Dropping outcomes after repeated failures");
                        self.counters
                            .outcomes_dropped
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        batch.clear();
                        return;
                    }
                    warn!(count = batch.len(), attempt, error = %e, "Failed to record outcomes");
                    tokio::time::sleep(self.reconnect_delay()).await;
                    if e.is_connectivity() {
                        if let Err(e) = self.source.reconnect().await {
                            warn!(error = %e, "Failed to reconnect to work source");
                        }
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            placement_failed: self.counters.placement_failed.load(Ordering::Relaxed),
            outcomes_recorded: self.counters.outcomes_recorded.load(Ordering::Relaxed),
            outcomes_dropped: self.counters.outcomes_dropped.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }

    pub fn offer_stats(&self, node: &NodeId) -> NodeOfferStats {
        self.offers.get(node).map(|s| *s).unwrap_or_default()
    }

    /// Drop the cached node to pool mapping
    pub fn refresh_directory(&self) {
        if let Some(pools) = &self.pools {
            pools.clear();
        }
    }

    /// Pool a pending transfer is counted in, from its first holder
    async fn pool_of(&self, pending: &PendingTransfer) -> Result<String> {
        match (&self.pools, pending.nodes.first()) {
            (Some(pools), Some(node)) => pools.pool_of(node).await,
            _ => Ok(UNKNOWN_POOL.to_string()),
        }
    }

    /// Transfers queued somewhere, with the pool they count against
    ///
    /// `pool` restricts the listing to one pool. Without a directory every
    /// transfer is in [`UNKNOWN_POOL`].
    pub async fn list_pending(&self, pool: Option<&str>) -> Result<Vec<(String, PendingTransfer)>> {
        let mut listed = Vec::new();
        for pending in self.tracker.pending() {
            let found = self.pool_of(&pending).await?;
            if pool.map_or(true, |p| p == found) {
                listed.push((found, pending));
            }
        }
        Ok(listed)
    }

    /// Number of distinct queued legs per pool
    pub async fn pending_per_pool(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for (pool, _) in self.list_pending(None).await? {
            *counts.entry(pool).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn check_owner(&self, scheduler: &SchedulerId) -> Result<()> {
        if scheduler == &self.id {
            Ok(())
        } else {
            Err(SchedError::Transport(format!(
                "outcomes for {scheduler} delivered to {}",
                self.id
            )))
        }
    }
}

#[async_trait]
impl SchedulerClient for Dispatcher {
    async fn report_outcomes(
        &self,
        scheduler: &SchedulerId,
        outcomes: Vec<TransferOutcome>,
    ) -> Result<()> {
        self.check_owner(scheduler)?;
        for outcome in outcomes {
            self.record(outcome).await?;
        }
        Ok(())
    }

    async fn report_cancelled(
        &self,
        scheduler: &SchedulerId,
        node: &NodeId,
        outcomes: Vec<TransferOutcome>,
    ) -> Result<()> {
        self.check_owner(scheduler)?;
        for outcome in outcomes {
            if self.tracker.node_cancelled(&outcome.transfer_id, node).await {
                self.record(outcome.from_node(node.clone())).await?;
            } else {
                debug!(transfer_id = %outcome.transfer_id, node = %node,
                    "Transfer dropped by one node, other candidates remain");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::PlacementConfig;
    use crate::types::{Placement, ReplicationClass, TransferId, TransferKind};
    use std::collections::{HashMap, HashSet, VecDeque};

    #[derive(Default)]
    struct FakeNodes {
        refuse: Mutex<HashSet<NodeId>>,
        offers: Mutex<Vec<(NodeId, TransferId)>>,
        withdrawn: Mutex<Vec<(NodeId, TransferId)>>,
    }

    #[async_trait]
    impl NodeClient for FakeNodes {
        async fn offer(&self, node: &NodeId, transfer: QueuedTransfer) -> Result<()> {
            if self.refuse.lock().contains(node) {
                return Err(SchedError::Transport("connection refused".to_string()));
            }
            self.offers.lock().push((node.clone(), transfer.transfer.id));
            Ok(())
        }

        async fn withdraw(&self, node: &NodeId, ids: Vec<TransferId>) -> Result<()> {
            let mut withdrawn = self.withdrawn.lock();
            for id in ids {
                withdrawn.push((node.clone(), id));
            }
            Ok(())
        }

        async fn notify_source_ready(&self, _: &NodeId, _: &TransferId) -> Result<()> {
            Ok(())
        }

        async fn notify_already_started(&self, _: &NodeId, _: &TransferId) -> Result<()> {
            Ok(())
        }

        async fn notify_copy_finished(&self, _: &NodeId, _: &TransferId) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSource {
        pending: Mutex<VecDeque<Result<Option<ScheduleRequest>>>>,
        recorded: Mutex<Vec<TransferOutcome>>,
        record_failures: Mutex<u32>,
        reconnects: AtomicU64,
    }

    #[async_trait]
    impl WorkSource for FakeSource {
        async fn next_request(&self, wait: Duration) -> Result<Option<ScheduleRequest>> {
            let next = self.pending.lock().pop_front();
            match next {
                Some(res) => res,
                None => {
                    tokio::time::sleep(wait).await;
                    Ok(None)
                }
            }
        }

        async fn record_outcomes(&self, outcomes: &[TransferOutcome]) -> Result<()> {
            {
                let mut failures = self.record_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SchedError::StoreUnavailable("db down".to_string()));
                }
            }
            self.recorded.lock().extend_from_slice(outcomes);
            Ok(())
        }

        async fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn setup(config: DispatcherConfig) -> (Arc<Dispatcher>, Arc<FakeNodes>, Arc<FakeSource>) {
        let nodes = Arc::new(FakeNodes::default());
        let source = Arc::new(FakeSource::default());
        let tracker =
            Arc::new(PlacementTracker::new(PlacementConfig::default(), nodes.clone()).unwrap());
        let dispatcher = Dispatcher::new(config, tracker, nodes.clone(), source.clone()).unwrap();
        (Arc::new(dispatcher), nodes, source)
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            outcome_flush_interval_ms: 10,
            reconnect_delay_ms: 10,
            poll_wait_ms: 10,
            ..DispatcherConfig::default()
        }
    }

    fn standard(id: &str, nodes: &[&str]) -> Transfer {
        Transfer::standard(
            id,
            "xroot",
            "default",
            nodes.iter().map(|n| Placement::new(*n, "/srv/data")).collect(),
        )
    }

    fn copy(id: &str, src: &str, dests: &[&str]) -> ScheduleRequest {
        ScheduleRequest::DiskCopy {
            source: standard(id, &[src])
                .with_kind(TransferKind::D2dSource)
                .with_replication(ReplicationClass::User),
            destination: standard(id, dests)
                .with_kind(TransferKind::D2dDest)
                .with_replication(ReplicationClass::User),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(DispatcherConfig::default().with_workers(0).validate().is_err());
        assert!(DispatcherConfig::default().with_rate_limit(0).validate().is_err());
        assert!(DispatcherConfig::default()
            .with_scheduler_id("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_rate_limiter_quota_per_second() {
        let mut limiter = RateLimiter::new(Some(2));
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        assert_eq!(limiter.throttle_at(base), None);
        assert_eq!(limiter.throttle_at(base + Duration::from_millis(100)), None);
        assert_eq!(
            limiter.throttle_at(base + Duration::from_millis(250)),
            Some(Duration::from_millis(750))
        );
        // The next second has a fresh quota
        assert_eq!(limiter.throttle_at(base + Duration::from_millis(1_010)), None);
    }

    #[test]
    fn test_rate_limiter_disabled() {
        let mut limiter = RateLimiter::new(None);
        for _ in 0..10_000 {
            assert_eq!(limiter.throttle(), None);
        }
    }

    #[tokio::test]
    async fn test_standard_partial_failure_keeps_transfer() {
        let (dispatcher, nodes, _) = setup(quick_config());
        nodes.refuse.lock().insert(NodeId::from("a"));
        let outcome = dispatcher
            .schedule(ScheduleRequest::Standard(standard("t1", &["a", "b"])))
            .await;
        assert_eq!(outcome.kind, OutcomeKind::Scheduled);
        assert_eq!(
            dispatcher.tracker().holders(&TransferId::from("t1")),
            vec![NodeId::from("b")]
        );
        assert_eq!(dispatcher.offer_stats(&NodeId::from("a")).failed, 1);
        assert_eq!(dispatcher.offer_stats(&NodeId::from("b")).accepted, 1);
    }

    #[tokio::test]
    async fn test_standard_all_candidates_fail() {
        let (dispatcher, nodes, _) = setup(quick_config());
        nodes.refuse.lock().extend([NodeId::from("a"), NodeId::from("b")]);
        let outcome = dispatcher
            .schedule(ScheduleRequest::Standard(standard("t1", &["a", "b"])))
            .await;
        assert_eq!(outcome, TransferOutcome::placement_failed(TransferId::from("t1")));
        assert!(dispatcher.tracker().holders(&TransferId::from("t1")).is_empty());
        // Withdrawn everywhere in case an offer landed despite the error
        assert_eq!(nodes.withdrawn.lock().len(), 2);
        assert_eq!(dispatcher.stats().placement_failed, 1);
    }

    #[tokio::test]
    async fn test_copy_source_failure_skips_destinations() {
        let (dispatcher, nodes, _) = setup(quick_config());
        nodes.refuse.lock().insert(NodeId::from("s"));
        let outcome = dispatcher.schedule(copy("t2", "s", &["d1", "d2"])).await;
        assert_eq!(outcome.kind, OutcomeKind::PlacementFailed);
        assert_eq!(outcome.message, "failed: no placement available");
        assert!(nodes.offers.lock().is_empty());
        assert!(!dispatcher.tracker().is_source_pending(&TransferId::from("t2")));
    }

    #[tokio::test]
    async fn test_copy_without_any_destination_withdraws_source() {
        let (dispatcher, nodes, _) = setup(quick_config());
        nodes.refuse.lock().extend([NodeId::from("d1"), NodeId::from("d2")]);
        let outcome = dispatcher.schedule(copy("t3", "s", &["d1", "d2"])).await;
        assert_eq!(outcome.kind, OutcomeKind::PlacementFailed);
        let withdrawn = nodes.withdrawn.lock().clone();
        assert!(withdrawn.contains(&(NodeId::from("s"), TransferId::from("t3"))));
        assert_eq!(dispatcher.tracker().stats().pending_sources, 0);
    }

    #[tokio::test]
    async fn test_copy_scheduled_excludes_source_node() {
        let (dispatcher, nodes, _) = setup(quick_config());
        let outcome = dispatcher.schedule(copy("t4", "s", &["s", "d1"])).await;
        assert_eq!(outcome.kind, OutcomeKind::Scheduled);
        let offers = nodes.offers.lock().clone();
        assert_eq!(
            offers,
            vec![
                (NodeId::from("s"), TransferId::from("t4")),
                (NodeId::from("d1"), TransferId::from("t4")),
            ]
        );
    }

    #[tokio::test]
    async fn test_pipeline_records_outcomes_in_batches() {
        let (dispatcher, _, source) = setup(quick_config().with_workers(2));
        {
            let mut pending = source.pending.lock();
            for i in 0..5 {
                pending.push_back(Ok(Some(ScheduleRequest::Standard(standard(
                    &format!("t{i}"),
                    &["a"],
                )))));
            }
        }
        let handle = dispatcher.start().unwrap();
        assert!(dispatcher.start().is_err());

        for _ in 0..200 {
            if source.recorded.lock().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        let recorded = source.recorded.lock().clone();
        assert_eq!(recorded.len(), 5);
        assert!(recorded.iter().all(|o| o.kind == OutcomeKind::Scheduled));
        assert_eq!(dispatcher.stats().scheduled, 5);
    }

    #[tokio::test]
    async fn test_poll_loop_reconnects_after_store_failure() {
        let (dispatcher, _, source) = setup(quick_config());
        source
            .pending
            .lock()
            .push_back(Err(SchedError::StoreUnavailable("gone".to_string())));
        source
            .pending
            .lock()
            .push_back(Ok(Some(ScheduleRequest::Standard(standard("t1", &["a"])))));

        let handle = dispatcher.start().unwrap();
        for _ in 0..200 {
            if !source.recorded.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert_eq!(source.reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(source.recorded.lock().len(), 1);
        assert_eq!(dispatcher.stats().store_errors, 1);
    }

    #[tokio::test]
    async fn test_outcome_batch_retried_after_store_failure() {
        let (dispatcher, _, source) = setup(quick_config());
        *source.record_failures.lock() = 2;
        let handle = dispatcher.start().unwrap();
        dispatcher
            .record(TransferOutcome::scheduled(TransferId::from("t1")))
            .await
            .unwrap();
        handle.shutdown().await;
        assert_eq!(source.recorded.lock().len(), 1);
        assert_eq!(source.reconnects.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_record_after_writer_stopped_is_rejected() {
        let (dispatcher, _, source) = setup(quick_config());
        let handle = dispatcher.start().unwrap();
        handle.shutdown().await;

        let err = dispatcher
            .record(TransferOutcome::scheduled(TransferId::from("late")))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::ChannelClosed(_)));
        assert_eq!(dispatcher.stats().outcomes_dropped, 1);

        let err = dispatcher
            .report_outcomes(dispatcher.id(), vec![TransferOutcome::scheduled(
                TransferId::from("late2"),
            )])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::ChannelClosed(_)));
        assert!(source.recorded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_reports_reconcile_with_other_holders() {
        let (dispatcher, _, source) = setup(quick_config());
        dispatcher
            .schedule(ScheduleRequest::Standard(standard("t1", &["a", "b"])))
            .await;
        let handle = dispatcher.start().unwrap();
        let timed_out =
            || TransferOutcome::new(TransferId::from("t1"), OutcomeKind::TimedOut, "timeout");

        let owner = dispatcher.id().clone();
        dispatcher
            .report_cancelled(&owner, &NodeId::from("a"), vec![timed_out()])
            .await
            .unwrap();
        dispatcher
            .report_cancelled(&owner, &NodeId::from("b"), vec![timed_out()])
            .await
            .unwrap();
        handle.shutdown().await;

        let recorded = source.recorded.lock().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].node, Some(NodeId::from("b")));
    }

    #[tokio::test]
    async fn test_reports_for_other_scheduler_rejected() {
        let (dispatcher, _, _) = setup(quick_config());
        let res = dispatcher
            .report_outcomes(&SchedulerId::from("someone-else"), vec![])
            .await;
        assert!(res.is_err());
    }

    struct StaticDirectory(HashMap<NodeId, String>);

    #[async_trait]
    impl NodeDirectory for StaticDirectory {
        async fn load(&self) -> Result<HashMap<NodeId, String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_pending_grouped_by_pool() {
        let nodes = Arc::new(FakeNodes::default());
        let source = Arc::new(FakeSource::default());
        let tracker =
            Arc::new(PlacementTracker::new(PlacementConfig::default(), nodes.clone()).unwrap());
        let directory = StaticDirectory(HashMap::from([
            (NodeId::from("a"), "hot".to_string()),
            (NodeId::from("b"), "hot".to_string()),
            (NodeId::from("c"), "cold".to_string()),
        ]));
        let dispatcher = Dispatcher::new(quick_config(), tracker, nodes, source)
            .unwrap()
            .with_directory(Arc::new(directory));

        dispatcher
            .schedule(ScheduleRequest::Standard(standard("t1", &["a", "b"])))
            .await;
        dispatcher
            .schedule(ScheduleRequest::Standard(standard("t2", &["c"])))
            .await;
        dispatcher
            .schedule(ScheduleRequest::Standard(standard("t3", &["gone"])))
            .await;

        let counts = dispatcher.pending_per_pool().await.unwrap();
        assert_eq!(counts.get("hot"), Some(&1));
        assert_eq!(counts.get("cold"), Some(&1));
        assert_eq!(counts.get(UNKNOWN_POOL), Some(&1));

        let hot = dispatcher.list_pending(Some("hot")).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].1.queued.id(), &TransferId::from("t1"));
        assert_eq!(hot[0].1.nodes, vec![NodeId::from("a"), NodeId::from("b")]);
    }

    #[tokio::test]
    async fn test_pending_without_directory_is_unknown_pool() {
        let (dispatcher, _, _) = setup(quick_config());
        dispatcher
            .schedule(ScheduleRequest::Standard(standard("t1", &["a"])))
            .await;
        dispatcher.refresh_directory();
        let counts = dispatcher.pending_per_pool().await.unwrap();
        assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![(UNKNOWN_POOL.to_string(), 1)]);
    }
}
