//! Remote interfaces
//!
//! The transport between the manager and the nodes, the persistent work
//! source and process supervision all live outside this crate. The core only
//! depends on the narrow contracts below. Every call may fail on its own and
//! callers bound each one with [`with_timeout`].

use crate::types::{
    NodeId, QueuedTransfer, ScheduleRequest, SchedulerId, StartDecision, Transfer, TransferId,
    TransferOutcome,
};
use crate::{Result, SchedError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Calls from the manager to a node
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Queue a transfer on the node
    async fn offer(&self, node: &NodeId, transfer: QueuedTransfer) -> Result<()>;

    /// Drop transfers from the node, queued or running
    async fn withdraw(&self, node: &NodeId, ids: Vec<TransferId>) -> Result<()>;

    /// The source of a copy started; the node may start its destination leg
    async fn notify_source_ready(&self, node: &NodeId, id: &TransferId) -> Result<()>;

    /// Another node won the start race for this transfer
    async fn notify_already_started(&self, node: &NodeId, id: &TransferId) -> Result<()>;

    /// The destination of a copy finished; the source leg on this node is over
    async fn notify_copy_finished(&self, node: &NodeId, id: &TransferId) -> Result<()>;
}

/// Calls from a node to the central placement tracker
#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// Ask permission to start a queued transfer
    async fn try_start(&self, node: &NodeId, transfer: &Transfer) -> Result<StartDecision>;

    /// The destination leg of a copy finished on the calling node
    async fn finish_copy(&self, id: &TransferId) -> Result<()>;

    /// Transfers the manager believes are queued on the node
    async fn list_queued(&self, node: &NodeId) -> Result<Vec<QueuedTransfer>>;
}

/// Calls from a node to the dispatcher owning a transfer
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Running transfers ended (completed, failed, killed)
    async fn report_outcomes(
        &self,
        scheduler: &SchedulerId,
        outcomes: Vec<TransferOutcome>,
    ) -> Result<()>;

    /// Queued transfers dropped by `node` before they could start
    ///
    /// Other candidates may still run them; only the last holder's report
    /// is terminal.
    async fn report_cancelled(
        &self,
        scheduler: &SchedulerId,
        node: &NodeId,
        outcomes: Vec<TransferOutcome>,
    ) -> Result<()>;
}

/// The persistent store yielding pending work and recording outcomes
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Wait up to `wait` for the next pending request
    async fn next_request(&self, wait: Duration) -> Result<Option<ScheduleRequest>>;

    /// Record a batch of outcomes
    async fn record_outcomes(&self, outcomes: &[TransferOutcome]) -> Result<()>;

    /// Re-establish the store connection after a connectivity failure
    async fn reconnect(&self) -> Result<()>;
}

/// Bound a remote call, mapping an elapsed timer to [`SchedError::Timeout`]
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(SchedError::Timeout(limit.as_millis() as u64)),
    }
}
