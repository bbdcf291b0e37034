use super::*;
use crate::types::{Placement, ReplicationClass};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Offer(NodeId, TransferId),
    Withdraw(NodeId, Vec<TransferId>),
    SourceReady(NodeId, TransferId),
    AlreadyStarted(NodeId, TransferId),
    CopyFinished(NodeId, TransferId),
}

#[derive(Default)]
struct RecordingNodes {
    calls: Mutex<Vec<Call>>,
    unreachable: Mutex<HashSet<NodeId>>,
}

impl RecordingNodes {
    fn record(&self, node: &NodeId, call: Call) -> Result<()> {
        if self.unreachable.lock().contains(node) {
            return Err(SchedError::Transport(format!("{node} unreachable")));
        }
        self.calls.lock().push(call);
        Ok(())
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NodeClient for RecordingNodes {
    async fn offer(&self, node: &NodeId, transfer: QueuedTransfer) -> Result<()> {
        self.record(node, Call::Offer(node.clone(), transfer.transfer.id))
    }

    async fn withdraw(&self, node: &NodeId, mut ids: Vec<TransferId>) -> Result<()> {
        ids.sort();
        self.record(node, Call::Withdraw(node.clone(), ids))
    }

    async fn notify_source_ready(&self, node: &NodeId, id: &TransferId) -> Result<()> {
        self.record(node, Call::SourceReady(node.clone(), id.clone()))
    }

    async fn notify_already_started(&self, node: &NodeId, id: &TransferId) -> Result<()> {
        self.record(node, Call::AlreadyStarted(node.clone(), id.clone()))
    }

    async fn notify_copy_finished(&self, node: &NodeId, id: &TransferId) -> Result<()> {
        self.record(node, Call::CopyFinished(node.clone(), id.clone()))
    }
}

fn tracker() -> (Arc<PlacementTracker>, Arc<RecordingNodes>) {
    let nodes = Arc::new(RecordingNodes::default());
    let tracker = PlacementTracker::new(PlacementConfig::default(), nodes.clone()).unwrap();
    (Arc::new(tracker), nodes)
}

fn sched() -> SchedulerId {
    SchedulerId::from("manager-1")
}

fn node(name: &str) -> NodeId {
    NodeId::from(name)
}

fn standard(id: &str, nodes: &[&str]) -> Transfer {
    Transfer::standard(
        id,
        "xroot",
        "default",
        nodes.iter().map(|n| Placement::new(*n, "/srv/data")).collect(),
    )
}

fn copy(id: &str, src: &str, dests: &[&str]) -> (Transfer, Transfer) {
    let source = standard(id, &[src])
        .with_kind(TransferKind::D2dSource)
        .with_replication(ReplicationClass::User);
    let dest = standard(id, dests)
        .with_kind(TransferKind::D2dDest)
        .with_replication(ReplicationClass::User);
    (source, dest)
}

#[test]
fn test_config_validation() {
    let mut config = PlacementConfig::default();
    assert!(config.validate().is_ok());
    config.recent_start_bucket_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_put_rejects_malformed_transfers() {
    let (tracker, _) = tracker();
    let empty = standard("t0", &[]);
    assert!(matches!(
        tracker.put(&empty, &sched()),
        Err(SchedError::InvalidTransfer(_))
    ));

    let (mut source, _) = copy("c0", "s", &[]);
    source.candidates.push(Placement::new("s2", "/srv/data"));
    assert!(matches!(
        tracker.put(&source, &sched()),
        Err(SchedError::InvalidTransfer(_))
    ));
}

#[tokio::test]
async fn test_start_race_two_nodes() {
    let (tracker, nodes) = tracker();
    let t1 = standard("t1", &["a", "b"]);
    tracker.put(&t1, &sched()).unwrap();
    assert_eq!(tracker.holders(&t1.id), vec![node("a"), node("b")]);

    let first = tracker.try_start(&node("a"), &t1).await;
    assert_eq!(first, StartDecision::Accepted { source_node: None });

    let second = tracker.try_start(&node("b"), &t1).await;
    assert_eq!(second, StartDecision::AlreadyStartedElsewhere);

    assert!(tracker.holders(&t1.id).is_empty());
    tracker.settle().await;
    assert_eq!(
        nodes.calls(),
        vec![Call::AlreadyStarted(node("b"), t1.id.clone())]
    );
    assert!(tracker.list_queued_for_node(&node("b")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_exactly_one_winner() {
    for round in 0..20 {
        let (tracker, nodes) = tracker();
        let names: Vec<String> = (0..8).map(|i| format!("n{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let t = standard(&format!("t{round}"), &refs);
        tracker.put(&t, &sched()).unwrap();

        let mut set = JoinSet::new();
        for name in &names {
            let tracker = Arc::clone(&tracker);
            let t = t.clone();
            let n = node(name);
            set.spawn(async move { tracker.try_start(&n, &t).await });
        }

        let mut accepted = 0;
        let mut lost = 0;
        while let Some(res) = set.join_next().await {
            match res.unwrap() {
                StartDecision::Accepted { .. } => accepted += 1,
                StartDecision::AlreadyStartedElsewhere => lost += 1,
                StartDecision::SourceNotReady => panic!("standard transfer never waits for a source"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(lost, 7);
        // Every loser was a holder and got told
        tracker.settle().await;
        let told = nodes
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::AlreadyStarted(..)))
            .count();
        assert_eq!(told, 7);
    }
}

#[tokio::test]
async fn test_retried_start_is_idempotent() {
    let (tracker, _) = tracker();
    let t = standard("t1", &["a", "b"]);
    tracker.put(&t, &sched()).unwrap();

    assert!(tracker.try_start(&node("a"), &t).await.is_accepted());
    // The answer got lost, node a asks again
    assert!(tracker.try_start(&node("a"), &t).await.is_accepted());
    // Node b still loses
    assert_eq!(
        tracker.try_start(&node("b"), &t).await,
        StartDecision::AlreadyStartedElsewhere
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_window_expires() {
    let (tracker, _) = tracker();
    let t = standard("t1", &["a"]);
    tracker.put(&t, &sched()).unwrap();
    assert!(tracker.try_start(&node("a"), &t).await.is_accepted());

    // Still inside the previous bucket
    tokio::time::advance(Duration::from_secs(15)).await;
    assert!(tracker.try_start(&node("a"), &t).await.is_accepted());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(
        tracker.try_start(&node("a"), &t).await,
        StartDecision::AlreadyStartedElsewhere
    );
}

#[tokio::test]
async fn test_destination_waits_for_source() {
    let (tracker, nodes) = tracker();
    let (source, dest) = copy("c1", "s", &["d1", "d2"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    assert!(tracker.is_source_pending(&source.id));

    assert_eq!(
        tracker.try_start(&node("d1"), &dest).await,
        StartDecision::SourceNotReady
    );
    assert_eq!(
        tracker.try_start(&node("d2"), &dest).await,
        StartDecision::SourceNotReady
    );

    assert!(tracker.try_start(&node("s"), &source).await.is_accepted());
    assert!(tracker.is_source_running(&source.id));
    tracker.settle().await;
    let mut ready: Vec<Call> = nodes
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::SourceReady(..)))
        .collect();
    ready.sort_by_key(|c| format!("{c:?}"));
    assert_eq!(
        ready,
        vec![
            Call::SourceReady(node("d1"), dest.id.clone()),
            Call::SourceReady(node("d2"), dest.id.clone()),
        ]
    );
    assert!(tracker
        .list_queued_for_node(&node("d1"))
        .iter()
        .all(|q| q.source_ready));

    assert_eq!(
        tracker.try_start(&node("d2"), &dest).await,
        StartDecision::Accepted {
            source_node: Some(node("s"))
        }
    );
    assert_eq!(
        tracker.try_start(&node("d1"), &dest).await,
        StartDecision::AlreadyStartedElsewhere
    );
}

#[tokio::test]
async fn test_source_start_retry_and_cancelled_source() {
    let (tracker, _) = tracker();
    let (source, dest) = copy("c1", "s", &["d1"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();

    assert!(tracker.try_start(&node("s"), &source).await.is_accepted());
    // Retry from the same node is fine, another node is refused
    assert!(tracker.try_start(&node("s"), &source).await.is_accepted());
    assert_eq!(
        tracker.try_start(&node("x"), &source).await,
        StartDecision::AlreadyStartedElsewhere
    );

    let (source2, _) = copy("c2", "s", &["d1"]);
    tracker.put(&source2, &sched()).unwrap();
    tracker.cancel(&[source2.id.clone()]).await;
    assert_eq!(
        tracker.try_start(&node("s"), &source2).await,
        StartDecision::AlreadyStartedElsewhere
    );
}

#[tokio::test]
async fn test_source_put_back_clears_stale_running_entry() {
    let (tracker, _) = tracker();
    let (source, dest) = copy("c1", "s", &["d1"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    assert!(tracker.try_start(&node("s"), &source).await.is_accepted());

    // The source node never got the answer and puts the source back
    tracker.put(&source, &sched()).unwrap();
    assert!(!tracker.is_source_running(&source.id));
    assert!(tracker.is_source_pending(&source.id));
    assert_eq!(
        tracker.try_start(&node("d1"), &dest).await,
        StartDecision::SourceNotReady
    );
}

#[test]
fn test_destination_needs_a_source() {
    let (tracker, _) = tracker();
    let (_, dest) = copy("c1", "s", &["d1"]);
    assert!(matches!(
        tracker.put(&dest, &sched()),
        Err(SchedError::SourceMissing(_))
    ));
}

#[test]
fn test_destination_never_queued_on_source_node() {
    let (tracker, _) = tracker();
    let (source, dest) = copy("c1", "s", &["s", "d1"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    assert_eq!(tracker.holders(&dest.id), vec![node("d1")]);
}

#[tokio::test]
async fn test_finish_copy_releases_source() {
    let (tracker, nodes) = tracker();
    let (source, dest) = copy("c1", "s", &["d1"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    tracker.try_start(&node("s"), &source).await;
    tracker.try_start(&node("d1"), &dest).await;

    assert!(tracker.finish_d2d(&source.id).await);
    assert!(!tracker.is_source_running(&source.id));
    assert!(nodes
        .calls()
        .contains(&Call::CopyFinished(node("s"), source.id.clone())));

    // Second finish is a handled race, not an error
    assert!(!tracker.finish_d2d(&source.id).await);
}

#[tokio::test]
async fn test_cancel_reports_nodes_to_withdraw_from() {
    let (tracker, nodes) = tracker();
    let t1 = standard("t1", &["a", "b"]);
    let t2 = standard("t2", &["b"]);
    tracker.put(&t1, &sched()).unwrap();
    tracker.put(&t2, &sched()).unwrap();

    let mut per_node = tracker.cancel(&[t1.id.clone(), t2.id.clone()]).await;
    for ids in per_node.values_mut() {
        ids.sort();
    }
    assert_eq!(per_node.get(&node("a")), Some(&vec![t1.id.clone()]));
    assert_eq!(
        per_node.get(&node("b")),
        Some(&vec![t1.id.clone(), t2.id.clone()])
    );
    assert_eq!(tracker.stats(), PlacementStats::default());
    // Cancel alone does not talk to nodes
    assert!(nodes.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_with_running_source_ends_it() {
    let (tracker, nodes) = tracker();
    let (source, dest) = copy("c1", "s", &["d1"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    tracker.try_start(&node("s"), &source).await;

    let per_node = tracker.cancel_and_withdraw(&[dest.id.clone()]).await;
    assert_eq!(per_node.get(&node("d1")), Some(&vec![dest.id.clone()]));
    assert!(!per_node.contains_key(&node("s")));
    let calls = nodes.calls();
    assert!(calls.contains(&Call::CopyFinished(node("s"), source.id.clone())));
    assert!(calls.contains(&Call::Withdraw(node("d1"), vec![dest.id.clone()])));
    assert!(!tracker.is_source_running(&source.id));
}

#[tokio::test]
async fn test_cancel_for_node_with_filter() {
    let (tracker, _) = tracker();
    let mut t1 = standard("t1", &["a", "b"]);
    t1.service_class = "gold".to_string();
    let t2 = standard("t2", &["a"]);
    tracker.put(&t1, &sched()).unwrap();
    tracker.put(&t2, &sched()).unwrap();

    let per_node = tracker
        .cancel_for_node(&node("a"), |q| q.transfer.service_class == "gold")
        .await;
    assert_eq!(per_node.len(), 2);
    assert!(tracker.holders(&t1.id).is_empty());
    assert_eq!(tracker.holders(&t2.id), vec![node("a")]);
}

#[test]
fn test_offer_failed_until_exhausted() {
    let (tracker, _) = tracker();
    let t = standard("t1", &["a", "b"]);
    tracker.put(&t, &sched()).unwrap();

    assert!(!tracker.offer_failed(&t.id, &node("a")));
    assert_eq!(tracker.holders(&t.id), vec![node("b")]);
    assert!(tracker.offer_failed(&t.id, &node("b")));
    assert_eq!(tracker.stats().queued_entries, 0);
    // Unknown transfer: nothing to fail
    assert!(!tracker.offer_failed(&t.id, &node("b")));
}

#[tokio::test]
async fn test_node_cancelled_terminal_only_for_last_holder() {
    let (tracker, nodes) = tracker();
    let t = standard("t1", &["a", "b"]);
    tracker.put(&t, &sched()).unwrap();

    assert!(!tracker.node_cancelled(&t.id, &node("a")).await);
    assert!(!tracker.node_cancelled(&t.id, &node("a")).await);
    assert!(tracker.node_cancelled(&t.id, &node("b")).await);
    assert!(nodes.calls().is_empty());
}

#[tokio::test]
async fn test_node_cancelled_source_drops_destinations() {
    let (tracker, nodes) = tracker();
    let (source, dest) = copy("c1", "s", &["d1", "d2"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();

    assert!(tracker.node_cancelled(&source.id, &node("s")).await);
    assert!(tracker.holders(&dest.id).is_empty());
    let withdrawn: Vec<Call> = nodes
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Withdraw(..)))
        .collect();
    assert_eq!(withdrawn.len(), 2);
}

#[tokio::test]
async fn test_notification_failure_does_not_block_others() {
    let (tracker, nodes) = tracker();
    nodes.unreachable.lock().insert(node("b"));
    let t = standard("t1", &["a", "b", "c"]);
    tracker.put(&t, &sched()).unwrap();

    assert!(tracker.try_start(&node("a"), &t).await.is_accepted());
    tracker.settle().await;
    assert_eq!(
        nodes.calls(),
        vec![Call::AlreadyStarted(node("c"), t.id.clone())]
    );
}

#[tokio::test]
async fn test_resync_lists_queued_legs_only() {
    let (tracker, _) = tracker();
    let (source, dest) = copy("c1", "s", &["d1"]);
    let t = standard("t1", &["s"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    tracker.put(&t, &sched()).unwrap();
    assert_eq!(tracker.list_queued_for_node(&node("s")).len(), 2);

    tracker.try_start(&node("s"), &source).await;
    let queued = tracker.list_queued_for_node(&node("s"));
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id(), &t.id);
    assert_eq!(tracker.list_running_sources(Some(&node("s"))).len(), 1);
    assert!(tracker.list_running_sources(Some(&node("d1"))).is_empty());
}

#[test]
fn test_pending_lists_each_leg_with_holders() {
    let (tracker, _) = tracker();
    let (source, dest) = copy("c1", "s", &["d2", "d1"]);
    tracker.put(&standard("a1", &["n1"]), &sched()).unwrap();
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();

    let pending = tracker.pending();
    let listed: Vec<(String, TransferKind, Vec<NodeId>)> = pending
        .into_iter()
        .map(|p| (p.queued.id().to_string(), p.queued.kind(), p.nodes))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("a1".to_string(), TransferKind::Standard, vec![node("n1")]),
            ("c1".to_string(), TransferKind::D2dSource, vec![node("s")]),
            ("c1".to_string(), TransferKind::D2dDest, vec![node("d1"), node("d2")]),
        ]
    );
}

#[derive(Default)]
struct StalledNodes;

#[async_trait]
impl NodeClient for StalledNodes {
    async fn offer(&self, _: &NodeId, _: QueuedTransfer) -> Result<()> {
        Ok(())
    }

    async fn withdraw(&self, _: &NodeId, _: Vec<TransferId>) -> Result<()> {
        Ok(())
    }

    async fn notify_source_ready(&self, _: &NodeId, _: &TransferId) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    async fn notify_already_started(&self, _: &NodeId, _: &TransferId) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    async fn notify_copy_finished(&self, _: &NodeId, _: &TransferId) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_winner_answered_before_slow_losers() {
    let tracker = PlacementTracker::new(PlacementConfig::default(), Arc::new(StalledNodes)).unwrap();
    let t = standard("t1", &["a", "b"]);
    tracker.put(&t, &sched()).unwrap();

    let answer = tokio::time::timeout(
        Duration::from_millis(100),
        ManagerClient::try_start(&tracker, &node("a"), &t),
    )
    .await;
    assert!(matches!(answer, Ok(Ok(StartDecision::Accepted { .. }))));

    let (source, dest) = copy("c1", "s", &["d1"]);
    tracker.put(&source, &sched()).unwrap();
    tracker.put(&dest, &sched()).unwrap();
    let answer = tokio::time::timeout(
        Duration::from_millis(100),
        tracker.try_start(&node("s"), &source),
    )
    .await;
    assert!(matches!(answer, Ok(StartDecision::Accepted { .. })));

    // The stalled notifications give up on their own timeout
    tracker.settle().await;
}
