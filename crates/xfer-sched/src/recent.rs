//! Memory of recently accepted starts
//!
//! Keeps the (transfer, node) pairs accepted in the current and previous time
//! bucket. A start request for a transfer that is no longer queued anywhere is
//! a lost race, unless the very same node was accepted recently: then the node
//! is retrying a call whose answer never reached it.

use crate::types::{NodeId, TransferId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Two rolling buckets of recently started transfers
#[derive(Debug)]
pub struct RecentStarts {
    bucket_width: Duration,
    origin: Instant,
    current_slot: u64,
    current: HashMap<TransferId, NodeId>,
    previous: HashMap<TransferId, NodeId>,
}

impl RecentStarts {
    pub fn new(bucket_width: Duration) -> Self {
        debug_assert!(!bucket_width.is_zero(), "bucket width must be positive");
        Self {
            bucket_width,
            origin: Instant::now(),
            current_slot: 0,
            current: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    fn slot_of(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_millis() / self.bucket_width.as_millis().max(1)) as u64
    }

    fn rotate(&mut self, now: Instant) {
        let slot = self.slot_of(now);
        if slot == self.current_slot {
            return;
        }
        if slot == self.current_slot + 1 {
            self.previous = std::mem::take(&mut self.current);
        } else {
            // More than one bucket went by without any start
            self.previous.clear();
            self.current.clear();
        }
        self.current_slot = slot;
    }

    /// Remember that `node` was allowed to start `id`
    pub fn record(&mut self, id: TransferId, node: NodeId) {
        self.record_at(id, node, Instant::now());
    }

    pub fn record_at(&mut self, id: TransferId, node: NodeId, now: Instant) {
        self.rotate(now);
        self.current.insert(id, node);
    }

    /// Whether `node` was accepted for `id` within the last two buckets
    pub fn is_retry(&mut self, id: &TransferId, node: &NodeId) -> bool {
        self.is_retry_at(id, node, Instant::now())
    }

    pub fn is_retry_at(&mut self, id: &TransferId, node: &NodeId, now: Instant) -> bool {
        self.rotate(now);
        self.current.get(id) == Some(node) || self.previous.get(id) == Some(node)
    }

    /// Number of remembered starts
    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty()
    }
}
