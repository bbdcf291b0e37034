//! Central placement tracker
//!
//! Records, for every offered transfer, the set of nodes holding it queued,
//! resolves which node gets to start it, and coordinates the source and
//! destination legs of disk-to-disk copies.
//!
//! # Concurrency
//!
//! All maps live behind one mutex and critical sections are map mutations
//! only. Notifications to nodes are sent after the lock is released,
//! concurrently, and a failure towards one node never affects the others.
//! Nodes must tolerate a notification about a transfer they already dropped.

use crate::recent::RecentStarts;
use crate::remote::{with_timeout, ManagerClient, NodeClient};
use crate::types::{
    NodeId, QueuedTransfer, SchedulerId, StartDecision, Transfer, TransferId, TransferKind,
};
use crate::{Result, SchedError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Configuration for the placement tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Width of one recent-start bucket in milliseconds (two buckets are kept)
    pub recent_start_bucket_ms: u64,
    /// Timeout applied to each notification sent to a node
    pub notify_timeout_ms: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            recent_start_bucket_ms: 10_000,
            notify_timeout_ms: 5_000,
        }
    }
}

impl PlacementConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recent_start_bucket_ms == 0 {
            return Err(SchedError::InvalidConfig(
                "recent_start_bucket_ms must be > 0".to_string(),
            ));
        }
        if self.notify_timeout_ms == 0 {
            return Err(SchedError::InvalidConfig(
                "notify_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A D2D source leg that has been allowed to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSource {
    pub queued: QueuedTransfer,
    pub node: NodeId,
    pub started_at: DateTime<Utc>,
}

/// One queued leg and every node holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub queued: QueuedTransfer,
    /// Sorted holders
    pub nodes: Vec<NodeId>,
}

/// Counters exposed for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementStats {
    /// Distinct standard / destination transfers still queued somewhere
    pub queued_transfers: usize,
    /// Queue entries across all nodes (one transfer may count several times)
    pub queued_entries: usize,
    pub pending_sources: usize,
    pub running_sources: usize,
    pub recent_starts: usize,
}

#[derive(Debug)]
struct PlacementState {
    /// Every queued leg, per node
    queues: HashMap<NodeId, HashMap<TransferId, QueuedTransfer>>,
    /// Nodes holding a standard or destination leg queued
    locations: HashMap<TransferId, HashSet<NodeId>>,
    /// Source legs waiting to start, with the node they were placed on
    pending_d2d_source: HashMap<TransferId, NodeId>,
    running_d2d_source: HashMap<TransferId, RunningSource>,
    recent_starts: RecentStarts,
}

impl PlacementState {
    fn remove_entry(&mut self, node: &NodeId, id: &TransferId) -> Option<QueuedTransfer> {
        let queue = self.queues.get_mut(node)?;
        let removed = queue.remove(id);
        if queue.is_empty() {
            self.queues.remove(node);
        }
        removed
    }

    fn source_node(&self, id: &TransferId) -> Option<&NodeId> {
        self.pending_d2d_source
            .get(id)
            .or_else(|| self.running_d2d_source.get(id).map(|r| &r.node))
    }

    /// Flip `source_ready` on every destination holder; returns the holders
    fn set_source_ready(&mut self, id: &TransferId, ready: bool) -> Vec<NodeId> {
        let Some(holders) = self.locations.get(id) else {
            return Vec::new();
        };
        let holders: Vec<NodeId> = holders.iter().cloned().collect();
        for node in &holders {
            if let Some(queued) = self.queues.get_mut(node).and_then(|q| q.get_mut(id)) {
                queued.source_ready = ready;
            }
        }
        holders
    }

    /// Drop every trace of a transfer, noting which nodes must withdraw it.
    /// Returns the running source that has to be ended, if any.
    fn remove_transfer(
        &mut self,
        id: &TransferId,
        per_node: &mut HashMap<NodeId, Vec<TransferId>>,
    ) -> Option<RunningSource> {
        if let Some(holders) = self.locations.remove(id) {
            for node in holders {
                self.remove_entry(&node, id);
                per_node.entry(node).or_default().push(id.clone());
            }
        }
        if let Some(node) = self.pending_d2d_source.remove(id) {
            self.remove_entry(&node, id);
            per_node.entry(node).or_default().push(id.clone());
        }
        self.running_d2d_source.remove(id)
    }
}

/// Central record of where every offered transfer is queued
pub struct PlacementTracker {
    config: PlacementConfig,
    state: Mutex<PlacementState>,
    nodes: Arc<dyn NodeClient>,
    /// Notifications handed off after a decision, owned here so that they
    /// outlive the call that triggered them
    in_flight: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for PlacementTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementTracker")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PlacementTracker {
    /// Create a tracker notifying nodes through `nodes`
    pub fn new(config: PlacementConfig, nodes: Arc<dyn NodeClient>) -> Result<Self> {
        config.validate()?;
        let bucket = Duration::from_millis(config.recent_start_bucket_ms);
        Ok(Self {
            config,
            state: Mutex::new(PlacementState {
                queues: HashMap::new(),
                locations: HashMap::new(),
                pending_d2d_source: HashMap::new(),
                running_d2d_source: HashMap::new(),
                recent_starts: RecentStarts::new(bucket),
            }),
            nodes,
            in_flight: Mutex::new(JoinSet::new()),
        })
    }

    fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.config.notify_timeout_ms)
    }

    /// Register a transfer as queued on its candidate nodes
    ///
    /// A source leg clears any stale running entry for the same id (the node
    /// believed it started but never got the answer) and becomes pending
    /// again. A destination leg needs a pending or running source.
    pub fn put(&self, transfer: &Transfer, scheduler: &SchedulerId) -> Result<()> {
        if transfer.candidates.is_empty() {
            return Err(SchedError::InvalidTransfer(format!(
                "transfer {} has no candidate node",
                transfer.id
            )));
        }
        let id = &transfer.id;
        let mut st = self.state.lock();

        match transfer.kind {
            TransferKind::D2dSource => {
                if transfer.candidates.len() != 1 {
                    return Err(SchedError::InvalidTransfer(format!(
                        "source of copy {} must have exactly one candidate, got {}",
                        id,
                        transfer.candidates.len()
                    )));
                }
                let node = transfer.candidates[0].node.clone();
                if let Some(stale) = st.running_d2d_source.remove(id) {
                    debug!(transfer_id = %id, node = %stale.node, "Dropping stale running source");
                    st.set_source_ready(id, false);
                }
                st.pending_d2d_source.insert(id.clone(), node.clone());
                st.queues
                    .entry(node)
                    .or_default()
                    .insert(id.clone(), QueuedTransfer::new(transfer.clone(), scheduler.clone()));
            }
            TransferKind::D2dDest | TransferKind::Standard => {
                let source_ready = if transfer.kind == TransferKind::D2dDest {
                    if st.source_node(id).is_none() {
                        return Err(SchedError::SourceMissing(id.clone()));
                    }
                    st.running_d2d_source.contains_key(id)
                } else {
                    false
                };
                let source_node = st.source_node(id).cloned();
                for placement in &transfer.candidates {
                    if source_node.as_ref() == Some(&placement.node) {
                        debug!(transfer_id = %id, node = %placement.node,
                            "Skipping destination candidate hosting the source");
                        continue;
                    }
                    let mut queued = QueuedTransfer::new(transfer.clone(), scheduler.clone());
                    queued.source_ready = source_ready;
                    st.queues
                        .entry(placement.node.clone())
                        .or_default()
                        .insert(id.clone(), queued);
                    st.locations
                        .entry(id.clone())
                        .or_default()
                        .insert(placement.node.clone());
                }
            }
        }
        Ok(())
    }

    /// Decide whether `node` may start `transfer`
    pub async fn try_start(&self, node: &NodeId, transfer: &Transfer) -> StartDecision {
        match transfer.kind {
            TransferKind::D2dSource => self.try_start_source(node, &transfer.id).await,
            TransferKind::Standard | TransferKind::D2dDest => {
                self.try_start_leg(node, transfer).await
            }
        }
    }

    async fn try_start_source(&self, node: &NodeId, id: &TransferId) -> StartDecision {
        let destinations = {
            let mut st = self.state.lock();
            match st.pending_d2d_source.get(id) {
                Some(pending_on) if pending_on == node => {}
                Some(pending_on) => {
                    debug!(transfer_id = %id, node = %node, queued_on = %pending_on,
                        "Source queued on another node, denying start");
                    return StartDecision::AlreadyStartedElsewhere;
                }
                None => {
                    return match st.running_d2d_source.get(id) {
                        Some(running) if &running.node == node => {
                            debug!(transfer_id = %id, node = %node, "Source start reconfirmed");
                            StartDecision::Accepted { source_node: None }
                        }
                        Some(running) => {
                            debug!(transfer_id = %id, node = %node, started_on = %running.node,
                                "Source already started elsewhere");
                            StartDecision::AlreadyStartedElsewhere
                        }
                        None => {
                            debug!(transfer_id = %id, node = %node,
                                "Denying start of source cancelled while queued");
                            StartDecision::AlreadyStartedElsewhere
                        }
                    };
                }
            }

            let Some(queued) = st.remove_entry(node, id) else {
                warn!(transfer_id = %id, node = %node, "Pending source missing from node queue");
                st.pending_d2d_source.remove(id);
                return StartDecision::AlreadyStartedElsewhere;
            };
            st.pending_d2d_source.remove(id);
            st.running_d2d_source.insert(
                id.clone(),
                RunningSource {
                    queued,
                    node: node.clone(),
                    started_at: Utc::now(),
                },
            );
            st.set_source_ready(id, true)
        };

        debug!(transfer_id = %id, node = %node, destinations = destinations.len(), "Source started");
        // Destinations would retry on their own anyway; this only makes it faster
        self.broadcast(destinations, id, "source ready", |client, target, id| async move {
            client.notify_source_ready(&target, &id).await
        });
        StartDecision::Accepted { source_node: None }
    }

    async fn try_start_leg(&self, node: &NodeId, transfer: &Transfer) -> StartDecision {
        let id = &transfer.id;
        let is_dest = transfer.kind == TransferKind::D2dDest;
        let (others, source_node) = {
            let mut st = self.state.lock();
            let holds = st.locations.get(id).is_some_and(|h| h.contains(node));
            if !holds {
                if st.recent_starts.is_retry(id, node) {
                    debug!(transfer_id = %id, node = %node, "Transfer start reconfirmed");
                    let source_node = if is_dest {
                        st.running_d2d_source.get(id).map(|r| r.node.clone())
                    } else {
                        None
                    };
                    return StartDecision::Accepted { source_node };
                }
                debug!(transfer_id = %id, node = %node, "Transfer already started elsewhere");
                return StartDecision::AlreadyStartedElsewhere;
            }

            if is_dest {
                let ready = st
                    .queues
                    .get(node)
                    .and_then(|q| q.get(id))
                    .is_some_and(|q| q.source_ready);
                if !ready {
                    debug!(transfer_id = %id, node = %node, "Source is not ready yet");
                    return StartDecision::SourceNotReady;
                }
            }

            let holders = st.locations.remove(id).unwrap_or_default();
            for holder in &holders {
                st.remove_entry(holder, id);
            }
            st.recent_starts.record(id.clone(), node.clone());
            let source_node = if is_dest {
                st.running_d2d_source.get(id).map(|r| r.node.clone())
            } else {
                None
            };
            let others: Vec<NodeId> = holders.into_iter().filter(|h| h != node).collect();
            (others, source_node)
        };

        for other in &others {
            debug!(transfer_id = %id, node = %other, started_on = %node,
                "Informing node that transfer started elsewhere");
        }
        self.broadcast(others, id, "already started", |client, target, id| async move {
            client.notify_already_started(&target, &id).await
        });
        StartDecision::Accepted { source_node }
    }

    /// The destination of a copy finished: release the source leg
    ///
    /// Returns false when no running source was known, which happens when a
    /// race was already handled; that case is only logged.
    pub async fn finish_d2d(&self, id: &TransferId) -> bool {
        let running = {
            let mut st = self.state.lock();
            let running = st.running_d2d_source.remove(id);
            if running.is_none() {
                if let Some(node) = st.pending_d2d_source.remove(id) {
                    st.remove_entry(&node, id);
                }
            }
            running
        };
        match running {
            Some(source) => {
                self.end_sources(vec![(source.node, id.clone())]).await;
                true
            }
            None => {
                debug!(transfer_id = %id, "Unable to end copy, source not running. Probable race condition");
                false
            }
        }
    }

    /// Remove transfers from every queue
    ///
    /// Returns, per node, the ids that node must withdraw. Running sources are
    /// ended the way [`finish_d2d`](Self::finish_d2d) ends them.
    pub async fn cancel(&self, ids: &[TransferId]) -> HashMap<NodeId, Vec<TransferId>> {
        let mut per_node = HashMap::new();
        let mut ended = Vec::new();
        {
            let mut st = self.state.lock();
            for id in ids {
                if let Some(source) = st.remove_transfer(id, &mut per_node) {
                    ended.push((source.node, id.clone()));
                }
            }
        }
        self.end_sources(ended).await;
        per_node
    }

    /// Cancel every transfer queued on `node` that matches `filter`
    pub async fn cancel_for_node<F>(
        &self,
        node: &NodeId,
        filter: F,
    ) -> HashMap<NodeId, Vec<TransferId>>
    where
        F: Fn(&QueuedTransfer) -> bool,
    {
        let ids: Vec<TransferId> = {
            let st = self.state.lock();
            let queued = st
                .queues
                .get(node)
                .into_iter()
                .flat_map(|q| q.values())
                .filter(|q| filter(q))
                .map(|q| q.id().clone());
            let running = st
                .running_d2d_source
                .values()
                .filter(|r| &r.node == node && filter(&r.queued))
                .map(|r| r.queued.id().clone());
            queued.chain(running).collect()
        };
        self.cancel(&ids).await
    }

    /// [`cancel`](Self::cancel) and tell each node to drop what it holds
    pub async fn cancel_and_withdraw(&self, ids: &[TransferId]) -> HashMap<NodeId, Vec<TransferId>> {
        let per_node = self.cancel(ids).await;
        let limit = self.notify_timeout();
        let mut set = JoinSet::new();
        for (node, ids) in per_node.clone() {
            let client = Arc::clone(&self.nodes);
            set.spawn(async move {
                let res = with_timeout(limit, client.withdraw(&node, ids)).await;
                (node, res)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((node, Err(e))) => {
                    // Nothing more to do; the node drops it when it tries to start
                    warn!(node = %node, error = %e, "Failed to withdraw transfers");
                }
                Err(e) => warn!(error = %e, "Withdraw task failed"),
            }
        }
        per_node
    }

    /// One candidate could not take the offer; returns true when none is left
    pub fn offer_failed(&self, id: &TransferId, node: &NodeId) -> bool {
        let mut st = self.state.lock();
        if st.pending_d2d_source.get(id) == Some(node) {
            st.pending_d2d_source.remove(id);
            st.remove_entry(node, id);
            return true;
        }
        let Some(holders) = st.locations.get_mut(id) else {
            // Started or cancelled in the meantime
            return false;
        };
        holders.remove(node);
        let exhausted = holders.is_empty();
        if exhausted {
            st.locations.remove(id);
        }
        st.remove_entry(node, id);
        exhausted
    }

    /// A node dropped a queued transfer on its own (timeout, disabled capacity)
    ///
    /// Returns true when this was the last node holding it, i.e. the transfer
    /// can no longer run anywhere and its failure must be recorded.
    pub async fn node_cancelled(&self, id: &TransferId, node: &NodeId) -> bool {
        let mut per_node: HashMap<NodeId, Vec<TransferId>> = HashMap::new();
        let mut ended = Vec::new();
        let terminal = {
            let mut st = self.state.lock();
            if st.pending_d2d_source.get(id) == Some(node) {
                // Without its source the copy cannot happen anywhere
                st.pending_d2d_source.remove(id);
                st.remove_entry(node, id);
                if let Some(source) = st.remove_transfer(id, &mut per_node) {
                    ended.push((source.node, id.clone()));
                }
                true
            } else {
                let removed = st
                    .locations
                    .get_mut(id)
                    .map(|holders| (holders.remove(node), holders.is_empty()));
                match removed {
                    Some((true, exhausted)) => {
                        st.remove_entry(node, id);
                        if exhausted {
                            st.locations.remove(id);
                            if let Some(source) = st.remove_transfer(id, &mut per_node) {
                                ended.push((source.node, id.clone()));
                            }
                        }
                        exhausted
                    }
                    _ => {
                        debug!(transfer_id = %id, node = %node,
                            "Unable to cancel transfer, not queued there. Probable race condition");
                        false
                    }
                }
            }
        };

        self.end_sources(ended).await;
        for (target, ids) in per_node {
            if let Err(e) = with_timeout(self.notify_timeout(), self.nodes.withdraw(&target, ids)).await {
                warn!(node = %target, error = %e, "Failed to withdraw transfers");
            }
        }
        terminal
    }

    /// Queued legs for a node rebuilding its queue after a restart
    pub fn list_queued_for_node(&self, node: &NodeId) -> Vec<QueuedTransfer> {
        let st = self.state.lock();
        st.queues
            .get(node)
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every queued leg with its holders, ordered by transfer id
    ///
    /// The two legs of a copy are listed separately.
    pub fn pending(&self) -> Vec<PendingTransfer> {
        let st = self.state.lock();
        let mut grouped: HashMap<(TransferId, TransferKind), PendingTransfer> = HashMap::new();
        for (node, queue) in &st.queues {
            for (id, queued) in queue {
                grouped
                    .entry((id.clone(), queued.kind()))
                    .or_insert_with(|| PendingTransfer {
                        queued: queued.clone(),
                        nodes: Vec::new(),
                    })
                    .nodes
                    .push(node.clone());
            }
        }
        drop(st);

        let mut pending: Vec<PendingTransfer> = grouped.into_values().collect();
        for p in &mut pending {
            p.nodes.sort();
        }
        pending.sort_by_key(|p| (p.queued.id().clone(), p.queued.kind() == TransferKind::D2dDest));
        pending
    }

    /// Running sources, optionally restricted to one node
    pub fn list_running_sources(&self, node: Option<&NodeId>) -> Vec<RunningSource> {
        let st = self.state.lock();
        st.running_d2d_source
            .values()
            .filter(|r| node.map_or(true, |n| &r.node == n))
            .cloned()
            .collect()
    }

    /// Nodes currently holding a standard or destination leg queued
    pub fn holders(&self, id: &TransferId) -> Vec<NodeId> {
        let st = self.state.lock();
        let mut nodes: Vec<NodeId> = st
            .locations
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    pub fn is_source_pending(&self, id: &TransferId) -> bool {
        self.state.lock().pending_d2d_source.contains_key(id)
    }

    pub fn is_source_running(&self, id: &TransferId) -> bool {
        self.state.lock().running_d2d_source.contains_key(id)
    }

    pub fn stats(&self) -> PlacementStats {
        let st = self.state.lock();
        PlacementStats {
            queued_transfers: st.locations.len(),
            queued_entries: st.queues.values().map(HashMap::len).sum(),
            pending_sources: st.pending_d2d_source.len(),
            running_sources: st.running_d2d_source.len(),
            recent_starts: st.recent_starts.len(),
        }
    }

    async fn end_sources(&self, sources: Vec<(NodeId, TransferId)>) {
        for (node, id) in sources {
            info!(transfer_id = %id, node = %node, "Copy over, releasing source");
            if let Err(e) = with_timeout(
                self.notify_timeout(),
                self.nodes.notify_copy_finished(&node, &id),
            )
            .await
            {
                warn!(transfer_id = %id, node = %node, error = %e,
                    "Failed to inform node that a copy is over");
            }
        }
    }

    /// Send the same notification to several nodes in the background
    ///
    /// Returns at once; a slow or unreachable node never delays the answer
    /// to the node that asked.
    fn broadcast<F, Fut>(&self, targets: Vec<NodeId>, id: &TransferId, what: &'static str, call: F)
    where
        F: Fn(Arc<dyn NodeClient>, NodeId, TransferId) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if targets.is_empty() {
            return;
        }
        let limit = self.notify_timeout();
        let mut in_flight = self.in_flight.lock();
        while in_flight.try_join_next().is_some() {}
        for target in targets {
            let fut = call(Arc::clone(&self.nodes), target.clone(), id.clone());
            let id = id.clone();
            in_flight.spawn(async move {
                if let Err(e) = with_timeout(limit, fut).await {
                    warn!(transfer_id = %id, node = %target, notification = what, error = %e,
                        "Failed to notify node");
                }
            });
        }
    }

    /// Wait until the notifications handed off so far are delivered or failed
    pub async fn settle(&self) {
        let mut set = std::mem::take(&mut *self.in_flight.lock());
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Notification task failed");
            }
        }
    }
}

#[async_trait]
impl ManagerClient for PlacementTracker {
    async fn try_start(&self, node: &NodeId, transfer: &Transfer) -> Result<StartDecision> {
        Ok(PlacementTracker::try_start(self, node, transfer).await)
    }

    async fn finish_copy(&self, id: &TransferId) -> Result<()> {
        self.finish_d2d(id).await;
        Ok(())
    }

    async fn list_queued(&self, node: &NodeId) -> Result<Vec<QueuedTransfer>> {
        Ok(self.list_queued_for_node(node))
    }
}

#[cfg(test)]
mod tests;
