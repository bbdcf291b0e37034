//! Stress tests for xfer-sched
//!
//! Many nodes hammering the placement tracker concurrently:
//! - exactly one winner per transfer
//! - copies never start a destination before their source
//! - cancels racing starts leave no leftovers
//!
//! Run with: cargo test -p xfer-sched --test stress -- --nocapture

#![allow(clippy::cast_possible_truncation)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use xfer_sched::{
    NodeClient, NodeId, Placement, PlacementConfig, PlacementStats, PlacementTracker,
    QueuedTransfer, ReplicationClass, SchedulerId, StartDecision, Transfer, TransferId,
    TransferKind,
};

#[derive(Default)]
struct CountingNodes {
    notifications: Mutex<HashMap<&'static str, usize>>,
}

impl CountingNodes {
    fn bump(&self, what: &'static str) {
        *self.notifications.lock().entry(what).or_default() += 1;
    }

    fn count(&self, what: &'static str) -> usize {
        self.notifications.lock().get(what).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NodeClient for CountingNodes {
    async fn offer(&self, _: &NodeId, _: QueuedTransfer) -> xfer_sched::Result<()> {
        Ok(())
    }

    async fn withdraw(&self, _: &NodeId, ids: Vec<TransferId>) -> xfer_sched::Result<()> {
        for _ in ids {
            self.bump("withdraw");
        }
        Ok(())
    }

    async fn notify_source_ready(&self, _: &NodeId, _: &TransferId) -> xfer_sched::Result<()> {
        self.bump("source_ready");
        Ok(())
    }

    async fn notify_already_started(&self, _: &NodeId, _: &TransferId) -> xfer_sched::Result<()> {
        self.bump("already_started");
        Ok(())
    }

    async fn notify_copy_finished(&self, _: &NodeId, _: &TransferId) -> xfer_sched::Result<()> {
        self.bump("copy_finished");
        Ok(())
    }
}

fn nodes(prefix: &str, count: usize) -> Vec<Placement> {
    (0..count)
        .map(|n| Placement::new(format!("{prefix}{n:02}"), "/srv/data"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_exactly_one_winner_per_transfer() {
    const TRANSFERS: usize = 2_000;
    const FANOUT: usize = 6;

    let counting = Arc::new(CountingNodes::default());
    let tracker =
        Arc::new(PlacementTracker::new(PlacementConfig::default(), counting.clone()).unwrap());
    let owner = SchedulerId::from("stress");
    let transfers: Vec<_> = (0..TRANSFERS)
        .map(|i| Transfer::standard(format!("t{i}"), "xroot", "default", nodes("n", FANOUT)))
        .collect();
    for t in &transfers {
        tracker.put(t, &owner).unwrap();
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for node in nodes("n", FANOUT) {
        let tracker = tracker.clone();
        let transfers = transfers.clone();
        handles.push(tokio::spawn(async move {
            let mut won = 0usize;
            for t in &transfers {
                if tracker.try_start(&node.node, t).await.is_accepted() {
                    won += 1;
                }
            }
            won
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    println!("{TRANSFERS} transfers x {FANOUT} nodes raced in {:?}", start.elapsed());

    assert_eq!(total, TRANSFERS);
    tracker.settle().await;
    assert_eq!(counting.count("already_started"), TRANSFERS * (FANOUT - 1));
    let stats = tracker.stats();
    assert_eq!(stats.queued_transfers, 0);
    assert_eq!(stats.queued_entries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_copies_start_source_first() {
    const COPIES: usize = 500;

    let counting = Arc::new(CountingNodes::default());
    let tracker =
        Arc::new(PlacementTracker::new(PlacementConfig::default(), counting.clone()).unwrap());
    let owner = SchedulerId::from("stress");
    let mut pairs = Vec::new();
    for i in 0..COPIES {
        let id = format!("c{i}");
        let source = Transfer::standard(
            id.clone(),
            "xroot",
            "default",
            vec![Placement::new(format!("s{:02}", i % 10), "/srv/data")],
        )
        .with_kind(TransferKind::D2dSource)
        .with_replication(ReplicationClass::Internal);
        let dest = Transfer::standard(id, "xroot", "default", nodes("d", 4))
            .with_kind(TransferKind::D2dDest)
            .with_replication(ReplicationClass::Internal);
        tracker.put(&source, &owner).unwrap();
        tracker.put(&dest, &owner).unwrap();
        pairs.push((source, dest));
    }

    // Destinations race first: all must be told to wait
    let mut early = Vec::new();
    for (_, dest) in pairs.iter().take(50) {
        early.push(tracker.try_start(&dest.candidates[0].node, dest).await);
    }
    assert!(early.iter().all(|d| *d == StartDecision::SourceNotReady));

    for (source, _) in &pairs {
        let decision = tracker.try_start(&source.candidates[0].node, source).await;
        assert_eq!(decision, StartDecision::Accepted { source_node: None });
    }

    let mut handles = Vec::new();
    for dest_node in nodes("d", 4) {
        let tracker = tracker.clone();
        let pairs = pairs.clone();
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            for (source, dest) in &pairs {
                if let StartDecision::Accepted { source_node } =
                    tracker.try_start(&dest_node.node, dest).await
                {
                    assert_eq!(source_node.as_ref(), Some(&source.candidates[0].node));
                    won.push(dest.id.clone());
                }
            }
            won
        }));
    }
    let mut winners = 0;
    for h in handles {
        winners += h.await.unwrap().len();
    }
    assert_eq!(winners, COPIES);
    tracker.settle().await;
    assert_eq!(counting.count("source_ready"), COPIES * 4);

    for (source, _) in &pairs {
        assert!(tracker.finish_d2d(&source.id).await);
    }
    assert_eq!(counting.count("copy_finished"), COPIES);
    assert_eq!(tracker.stats(), PlacementStats {
        recent_starts: tracker.stats().recent_starts,
        ..PlacementStats::default()
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_cancel_races_start() {
    const TRANSFERS: usize = 1_000;

    let counting = Arc::new(CountingNodes::default());
    let tracker =
        Arc::new(PlacementTracker::new(PlacementConfig::default(), counting.clone()).unwrap());
    let owner = SchedulerId::from("stress");
    let transfers: Vec<_> = (0..TRANSFERS)
        .map(|i| Transfer::standard(format!("t{i}"), "xroot", "default", nodes("n", 3)))
        .collect();
    for t in &transfers {
        tracker.put(t, &owner).unwrap();
    }

    let starter = {
        let tracker = tracker.clone();
        let transfers = transfers.clone();
        tokio::spawn(async move {
            let mut accepted = 0usize;
            for t in &transfers {
                if tracker.try_start(&NodeId::from("n00"), t).await.is_accepted() {
                    accepted += 1;
                }
            }
            accepted
        })
    };
    let canceller = {
        let tracker = tracker.clone();
        let ids: Vec<TransferId> = transfers.iter().rev().map(|t| t.id.clone()).collect();
        tokio::spawn(async move {
            let mut cancelled = 0usize;
            for id in ids {
                if !tracker.cancel(std::slice::from_ref(&id)).await.is_empty() {
                    cancelled += 1;
                }
            }
            cancelled
        })
    };

    let accepted = starter.await.unwrap();
    let cancelled = canceller.await.unwrap();
    assert_eq!(accepted + cancelled, TRANSFERS);
    assert_eq!(tracker.stats().queued_entries, 0);
}
