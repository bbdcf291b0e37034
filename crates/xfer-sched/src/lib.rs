//! Central Transfer Scheduling for Tape/Disk Storage Nodes
//!
//! This crate holds the manager side of transfer scheduling: pending work is
//! pulled from a work source, speculatively offered to every candidate node,
//! and the placement tracker guarantees that exactly one node ends up running
//! each transfer.
//!
//! # Key Components
//!
//! - **Types**: transfers, queued transfers, start decisions, outcomes
//! - **Remote Interfaces**: seams towards nodes, the work source and owning dispatchers
//! - **Recent Starts**: two-bucket memory distinguishing races from retried starts
//! - **Placement Tracker**: where each transfer is offered, start races, D2D handshake
//! - **Dispatcher**: poll loop, worker pool, rate limit and batched outcome writer
//! - **Node Directory**: node to pool mapping for per-pool monitoring queries

pub mod directory;
pub mod dispatch;
pub mod placement;
pub mod recent;
pub mod remote;
pub mod types;

pub use directory::{NodeDirectory, PoolDirectoryCache, UNKNOWN_POOL};
pub use dispatch::{
    Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, NodeOfferStats, RateLimiter,
};
pub use placement::{
    PendingTransfer, PlacementConfig, PlacementStats, PlacementTracker, RunningSource,
};
pub use recent::RecentStarts;
pub use remote::{with_timeout, ManagerClient, NodeClient, SchedulerClient, WorkSource};
pub use types::{
    NodeId, OutcomeKind, Placement, QueuedTransfer, ReplicationClass, ScheduleRequest,
    SchedulerId, StartDecision, Transfer, TransferId, TransferKind, TransferOutcome,
};

use thiserror::Error;

/// Scheduler error types
///
/// Race outcomes are not errors; they travel as [`StartDecision`].
#[derive(Debug, Error)]
pub enum SchedError {
    /// Remote call failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote call did not answer in time
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The persistent work source cannot be reached
    #[error("Work source unavailable: {0}")]
    StoreUnavailable(String),

    /// Malformed transfer
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// D2D destination registered with no source pending or running
    #[error("No source for disk copy {0}")]
    SourceMissing(TransferId),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Outcome writer stopped
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl SchedError {
    /// Whether the error means the work source connection is gone
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Whether the error is a timed out remote call
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type for xfer-sched operations
pub type Result<T> = std::result::Result<T, SchedError>;
