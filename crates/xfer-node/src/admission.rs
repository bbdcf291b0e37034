//! Local admission queue
//!
//! Orders the transfers queued on one node. Four queues feed `dequeue`:
//!
//! - **priority**: destinations whose source just became ready, retries
//! - **main**: standard transfers and user-triggered copies
//! - **backfill**: internal copies filling idle capacity
//! - **d2d backfill**: internal copy sources held back while the node is busy
//!
//! The index is authoritative. Cancelling only drops the index entry; queue
//! slots pointing at a cancelled id are skipped when they come up.

use crate::{NodeError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use xfer_sched::{
    NodeId, OutcomeKind, QueuedTransfer, ReplicationClass, SchedulerId, TransferId, TransferKind,
    TransferOutcome,
};

/// Source of the number of slots currently occupied on the node
pub trait SlotGauge: Send + Sync {
    fn used_slots(&self) -> u32;
}

/// Configuration for the admission queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Slots available on the node
    pub total_slots: u32,
    /// Share of the slots backfill copy sources may not eat into
    pub guaranteed_user_slot_percent: u32,
    /// Consecutive regular dequeues before backfill gets a look
    pub max_regular_before_backfill: u32,
    /// How long one dequeue may block on the main queue
    pub dequeue_wait_ms: u64,
    /// Queue timeout for standard transfers without a per-class value
    pub default_pending_timeout_secs: Option<u64>,
    /// Queue timeout per service class for standard transfers
    pub service_class_timeouts: HashMap<String, u64>,
    /// Queue timeout for user-triggered copies; internal copies never time out
    pub user_d2d_timeout_secs: Option<u64>,
    /// Ceiling on the delay before a waiting destination retries
    pub max_d2d_retry_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            total_slots: 100,
            guaranteed_user_slot_percent: 50,
            max_regular_before_backfill: 20,
            dequeue_wait_ms: 1000,
            default_pending_timeout_secs: None,
            service_class_timeouts: HashMap::new(),
            user_d2d_timeout_secs: Some(86_400),
            max_d2d_retry_interval_secs: 300,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_slots == 0 {
            return Err(NodeError::InvalidConfig(
                "total_slots must be > 0".to_string(),
            ));
        }
        if self.guaranteed_user_slot_percent > 100 {
            return Err(NodeError::InvalidConfig(format!(
                "guaranteed_user_slot_percent must be <= 100, got {}",
                self.guaranteed_user_slot_percent
            )));
        }
        if self.max_regular_before_backfill == 0 {
            return Err(NodeError::InvalidConfig(
                "max_regular_before_backfill must be > 0".to_string(),
            ));
        }
        if self.dequeue_wait_ms == 0 {
            return Err(NodeError::InvalidConfig(
                "dequeue_wait_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Queue timeout applying to a transfer, if any
    pub fn pending_timeout(&self, queued: &QueuedTransfer) -> Option<Duration> {
        let transfer = &queued.transfer;
        let secs = match (transfer.kind, transfer.replication) {
            (TransferKind::Standard, _) => self
                .service_class_timeouts
                .get(&transfer.service_class)
                .copied()
                .or(self.default_pending_timeout_secs),
            (_, ReplicationClass::Internal) => None,
            (_, ReplicationClass::User) => self.user_d2d_timeout_secs,
        };
        secs.map(Duration::from_secs)
    }
}

/// Live entries per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub priority: usize,
    pub main: usize,
    pub backfill: usize,
    pub d2d_backfill: usize,
    pub pending_d2d_dest: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    main: VecDeque<TransferId>,
    priority: VecDeque<TransferId>,
    backfill: VecDeque<TransferId>,
    d2d_backfill: VecDeque<TransferId>,
    pending_d2d_dest: HashMap<TransferId, Instant>,
    index: HashMap<TransferId, QueuedTransfer>,
    regular_count: u32,
    main_was_empty: bool,
}

impl QueueState {
    /// Pop the first id still present in the index
    fn pop_live(queue: &mut VecDeque<TransferId>, index: &mut HashMap<TransferId, QueuedTransfer>) -> Option<QueuedTransfer> {
        while let Some(id) = queue.pop_front() {
            if let Some(queued) = index.remove(&id) {
                return Some(queued);
            }
            debug!(transfer_id = %id, "Skipping cancelled transfer");
        }
        None
    }

    fn pop_priority(&mut self) -> Option<QueuedTransfer> {
        Self::pop_live(&mut self.priority, &mut self.index)
    }

    fn pop_main(&mut self) -> Option<QueuedTransfer> {
        Self::pop_live(&mut self.main, &mut self.index)
    }

    fn live(&self, queue: &VecDeque<TransferId>) -> usize {
        queue.iter().filter(|id| self.index.contains_key(*id)).count()
    }

    fn drop_id(&mut self, id: &TransferId) -> Option<QueuedTransfer> {
        self.pending_d2d_dest.remove(id);
        self.index.remove(id)
    }
}

/// Per-node queue of transfers waiting for a slot
pub struct LocalAdmissionQueue {
    config: AdmissionConfig,
    node: NodeId,
    state: Mutex<QueueState>,
    ready: Notify,
    slots: Arc<dyn SlotGauge>,
}

impl std::fmt::Debug for LocalAdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAdmissionQueue")
            .field("node", &self.node)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl LocalAdmissionQueue {
    pub fn new(config: AdmissionConfig, node: NodeId, slots: Arc<dyn SlotGauge>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            node,
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            slots,
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Queue a transfer: regular work to main, internal copies to backfill
    ///
    /// Returns false when the id was already queued; its entry is refreshed.
    pub fn admit(&self, queued: QueuedTransfer) -> bool {
        self.insert(queued, false)
    }

    /// Same class split as [`admit`](Self::admit), ahead of the main queue
    pub fn admit_priority(&self, queued: QueuedTransfer) -> bool {
        self.insert(queued, true)
    }

    fn insert(&self, queued: QueuedTransfer, priority: bool) -> bool {
        let id = queued.id().clone();
        let backfill = queued.transfer.is_backfill();
        let wake = {
            let mut st = self.state.lock();
            if st.index.insert(id.clone(), queued).is_some() {
                debug!(transfer_id = %id, node = %self.node, "Transfer already queued, entry refreshed");
                return false;
            }
            if backfill {
                st.backfill.push_back(id);
                false
            } else if priority {
                st.priority.push_back(id);
                true
            } else {
                st.main.push_back(id);
                true
            }
        };
        if wake {
            self.ready.notify_one();
        }
        true
    }

    /// Next transfer to try, waiting up to the configured time on the main queue
    pub async fn dequeue(&self) -> Option<QueuedTransfer> {
        let backfill_first = {
            let mut st = self.state.lock();
            if let Some(queued) = st.pop_priority() {
                return Some(queued);
            }
            if st.regular_count >= self.config.max_regular_before_backfill || st.main_was_empty {
                st.regular_count = 0;
                st.main_was_empty = false;
                true
            } else {
                false
            }
        };
        if backfill_first {
            if let Some(queued) = self.take_backfill() {
                return Some(queued);
            }
        }

        if let Some(queued) = self.wait_regular().await {
            return Some(queued);
        }
        self.take_backfill()
    }

    /// Block on priority and main; counts main dequeues towards the backfill check
    async fn wait_regular(&self) -> Option<QueuedTransfer> {
        let deadline = Instant::now() + Duration::from_millis(self.config.dequeue_wait_ms);
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if let Some(queued) = st.pop_priority() {
                    return Some(queued);
                }
                if let Some(queued) = st.pop_main() {
                    st.regular_count += 1;
                    return Some(queued);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut st = self.state.lock();
                if let Some(queued) = st.pop_main() {
                    st.regular_count += 1;
                    return Some(queued);
                }
                st.main_was_empty = true;
                return None;
            }
        }
    }

    /// Whether used slots leave room for backfill copy sources
    fn idle_enough(&self) -> bool {
        let used = u64::from(self.slots.used_slots());
        let reserved = 100 - u64::from(self.config.guaranteed_user_slot_percent);
        used * 100 < u64::from(self.config.total_slots) * reserved
    }

    fn take_backfill(&self) -> Option<QueuedTransfer> {
        let idle = self.idle_enough();
        let mut st = self.state.lock();
        let st = &mut *st;
        if idle {
            return QueueState::pop_live(&mut st.d2d_backfill, &mut st.index)
                .or_else(|| QueueState::pop_live(&mut st.backfill, &mut st.index));
        }
        while let Some(id) = st.backfill.pop_front() {
            match st.index.get(&id) {
                None => continue,
                Some(queued) if queued.kind() == TransferKind::D2dSource => {
                    debug!(transfer_id = %id, node = %self.node, "Node busy, holding back copy source");
                    st.d2d_backfill.push_back(id);
                }
                Some(_) => return st.index.remove(&id),
            }
        }
        None
    }

    /// Park a destination whose source has not started yet
    ///
    /// The retry delay is the transfer's age capped at the configured
    /// ceiling, so young copies retry fast and old ones back off.
    pub fn dest_waiting_for_source(&self, queued: QueuedTransfer) -> Duration {
        self.dest_waiting_for_source_at(queued, Utc::now())
    }

    pub fn dest_waiting_for_source_at(&self, queued: QueuedTransfer, now: DateTime<Utc>) -> Duration {
        let cap = Duration::from_secs(self.config.max_d2d_retry_interval_secs);
        let delay = queued.transfer.age(now).min(cap);
        let id = queued.id().clone();
        let mut st = self.state.lock();
        st.index.insert(id.clone(), queued);
        st.pending_d2d_dest.insert(id.clone(), Instant::now() + delay);
        debug!(transfer_id = %id, node = %self.node, delay_ms = delay.as_millis() as u64,
            "Destination waiting for its source");
        delay
    }

    /// Move destinations whose retry time has come to the priority queue
    pub fn poll_d2d_dest(&self) -> usize {
        let now = Instant::now();
        let promoted = {
            let mut st = self.state.lock();
            let due: Vec<TransferId> = st
                .pending_d2d_dest
                .iter()
                .filter(|(_, retry)| **retry <= now)
                .map(|(id, _)| id.clone())
                .collect();
            let mut promoted = 0;
            for id in due {
                st.pending_d2d_dest.remove(&id);
                let backfill = match st.index.get(&id) {
                    Some(queued) => queued.transfer.is_backfill(),
                    None => continue,
                };
                if backfill {
                    st.backfill.push_back(id);
                } else {
                    st.priority.push_back(id);
                }
                promoted += 1;
            }
            promoted
        };
        if promoted > 0 {
            self.ready.notify_one();
        }
        promoted
    }

    /// The source of a waiting destination started: retry it right away
    pub fn promote_source_ready(&self, id: &TransferId) -> bool {
        let backfill = {
            let mut st = self.state.lock();
            let Some(queued) = st.index.get_mut(id) else {
                debug!(transfer_id = %id, node = %self.node, "Source ready for a transfer not queued here");
                return false;
            };
            queued.source_ready = true;
            let backfill = queued.transfer.is_backfill();
            st.pending_d2d_dest.remove(id);
            if backfill {
                st.backfill.push_back(id.clone());
            } else {
                st.priority.push_back(id.clone());
            }
            backfill
        };
        if !backfill {
            self.ready.notify_one();
        }
        true
    }

    /// Drop transfers; returns the ones that were queued
    pub fn cancel(&self, ids: &[TransferId]) -> Vec<QueuedTransfer> {
        let mut st = self.state.lock();
        ids.iter().filter_map(|id| st.drop_id(id)).collect()
    }

    /// Drop transfers that waited longer than their queue timeout
    pub fn cancel_expired(&self) -> Vec<(SchedulerId, TransferOutcome)> {
        self.cancel_expired_at(Utc::now())
    }

    pub fn cancel_expired_at(&self, now: DateTime<Utc>) -> Vec<(SchedulerId, TransferOutcome)> {
        let mut st = self.state.lock();
        let expired: Vec<(TransferId, Duration)> = st
            .index
            .values()
            .filter_map(|queued| {
                let timeout = self.config.pending_timeout(queued)?;
                (queued.transfer.age(now) > timeout).then(|| (queued.id().clone(), timeout))
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|(id, timeout)| {
                let queued = st.drop_id(&id)?;
                debug!(transfer_id = %id, node = %self.node, timeout_secs = timeout.as_secs(),
                    "Queued transfer timed out");
                let outcome = TransferOutcome::new(
                    id,
                    OutcomeKind::TimedOut,
                    format!("Timed out after {}s in the queue", timeout.as_secs()),
                )
                .from_node(self.node.clone());
                Some((queued.scheduler, outcome))
            })
            .collect()
    }

    /// Drop transfers targeting disabled mountpoints, or everything when
    /// the whole node is disabled
    pub fn cancel_for_disabled_capacity(
        &self,
        mountpoints: Option<&[String]>,
    ) -> Vec<(SchedulerId, TransferOutcome)> {
        let mut st = self.state.lock();
        let affected: Vec<TransferId> = st
            .index
            .values()
            .filter(|queued| match mountpoints {
                None => true,
                Some(disabled) => queued
                    .transfer
                    .mountpoint_on(&self.node)
                    .is_some_and(|mp| disabled.iter().any(|d| d == mp)),
            })
            .map(|queued| queued.id().clone())
            .collect();

        affected
            .into_iter()
            .filter_map(|id| {
                let queued = st.drop_id(&id)?;
                let message = match queued.transfer.mountpoint_on(&self.node) {
                    Some(mp) if mountpoints.is_some() => format!("Mountpoint {mp} disabled"),
                    _ => format!("Node {} disabled", self.node),
                };
                let outcome = TransferOutcome::new(id, OutcomeKind::ResourceUnavailable, message)
                    .from_node(self.node.clone());
                Some((queued.scheduler, outcome))
            })
            .collect()
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.state.lock().index.contains_key(id)
    }

    /// Queued transfers, waiting destinations included
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let st = self.state.lock();
        QueueSnapshot {
            priority: st.live(&st.priority),
            main: st.live(&st.main),
            backfill: st.live(&st.backfill),
            d2d_backfill: st.live(&st.d2d_backfill),
            pending_d2d_dest: st.pending_d2d_dest.len(),
        }
    }
}
