//! Core data structures shared by the manager and the nodes
//!
//! Transfers are immutable once created. The wrappers around them
//! (`QueuedTransfer`, `StartDecision`, `TransferOutcome`) carry the state that
//! changes as a transfer moves from offered to queued to running to ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Unique identifier of a transfer
    ///
    /// Both legs of a disk-to-disk copy share the same identifier.
    TransferId
);

string_id!(
    /// Identifier of a storage node
    NodeId
);

string_id!(
    /// Identifier of the dispatcher instance that owns a transfer
    SchedulerId
);

/// Kind of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Regular client transfer
    Standard,
    /// Read leg of a disk-to-disk copy
    D2dSource,
    /// Write leg of a disk-to-disk copy
    D2dDest,
}

impl TransferKind {
    /// Whether this is one leg of a disk-to-disk copy
    #[must_use]
    pub const fn is_d2d(self) -> bool {
        matches!(self, Self::D2dSource | Self::D2dDest)
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::D2dSource => "d2dsrc",
            Self::D2dDest => "d2ddst",
        })
    }
}

/// Who asked for a disk-to-disk copy
///
/// Only meaningful for the D2D kinds. Internal copies are background
/// rebalancing and run as backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicationClass {
    /// Triggered by a user request
    #[default]
    User,
    /// Background rebalancing
    Internal,
}

/// A candidate node and the mountpoint the transfer would use there
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub node: NodeId,
    pub mountpoint: String,
}

impl Placement {
    pub fn new(node: impl Into<NodeId>, mountpoint: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            mountpoint: mountpoint.into(),
        }
    }
}

/// One unit of scheduled data movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub kind: TransferKind,
    pub replication: ReplicationClass,
    pub file_id: String,
    pub service_class: String,
    pub protocol: String,
    pub creation_time: DateTime<Utc>,
    pub submission_time: DateTime<Utc>,
    /// Ranked candidates. Exactly one entry for a D2D source.
    pub candidates: Vec<Placement>,
}

impl Transfer {
    /// Create a standard transfer created and submitted now
    pub fn standard(
        id: impl Into<TransferId>,
        protocol: impl Into<String>,
        service_class: impl Into<String>,
        candidates: Vec<Placement>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind: TransferKind::Standard,
            replication: ReplicationClass::User,
            file_id: String::new(),
            service_class: service_class.into(),
            protocol: protocol.into(),
            creation_time: now,
            submission_time: now,
            candidates,
        }
    }

    /// Builder: set the kind
    #[must_use]
    pub fn with_kind(mut self, kind: TransferKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder: set the replication class
    #[must_use]
    pub fn with_replication(mut self, replication: ReplicationClass) -> Self {
        self.replication = replication;
        self
    }

    /// Builder: set the file identity
    #[must_use]
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    /// Builder: set the creation time
    #[must_use]
    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = creation_time;
        self
    }

    /// Builder: replace the candidates
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<Placement>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Whether this transfer runs as backfill on a node
    ///
    /// Only internal-class disk-to-disk legs are backfill; standard transfers
    /// and user-triggered copies are regular work.
    #[must_use]
    pub fn is_backfill(&self) -> bool {
        self.kind.is_d2d() && self.replication == ReplicationClass::Internal
    }

    /// Mountpoint this transfer targets on the given node, if it is a candidate there
    #[must_use]
    pub fn mountpoint_on(&self, node: &NodeId) -> Option<&str> {
        self.candidates
            .iter()
            .find(|p| &p.node == node)
            .map(|p| p.mountpoint.as_str())
    }

    /// Time elapsed since the transfer was created
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.creation_time).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A transfer waiting on a node (or registered centrally) together with its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTransfer {
    pub transfer: Transfer,
    pub scheduler: SchedulerId,
    /// For a D2D destination: whether the paired source has started
    pub source_ready: bool,
}

impl QueuedTransfer {
    pub fn new(transfer: Transfer, scheduler: SchedulerId) -> Self {
        Self {
            transfer,
            scheduler,
            source_ready: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> &TransferId {
        &self.transfer.id
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> TransferKind {
        self.transfer.kind
    }
}

/// Pending work handed to the dispatcher by the work source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleRequest {
    /// A single client transfer, offered to all its candidates
    Standard(Transfer),
    /// A disk-to-disk copy: source leg on one node, destination fanned out
    DiskCopy {
        source: Transfer,
        destination: Transfer,
    },
}

impl ScheduleRequest {
    #[must_use]
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            Self::Standard(t) => &t.id,
            Self::DiskCopy { source, .. } => &source.id,
        }
    }
}

/// Answer to a node asking to start a transfer it holds queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartDecision {
    /// The caller won; for a D2D destination, `source_node` is where the source runs
    Accepted { source_node: Option<NodeId> },
    /// Another node won the race (or the transfer was cancelled); drop it
    AlreadyStartedElsewhere,
    /// D2D destination whose source has not started yet; retry later
    SourceNotReady,
}

impl StartDecision {
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Terminal or intermediate state reported for a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// Queued on at least one node
    Scheduled,
    /// No candidate accepted the transfer
    PlacementFailed,
    /// Process ended normally
    Completed { exit_code: Option<i32> },
    /// Process ended through a signal
    Killed { signal: i32 },
    /// Process exited with a non-zero status
    Failed { exit_code: i32 },
    /// Aged out while queued, or never picked up by its client
    TimedOut,
    /// Target mountpoint or node disabled while queued
    ResourceUnavailable,
}

impl OutcomeKind {
    /// Stable numeric code recorded by the work source
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::Scheduled | Self::Completed { .. } => 0,
            Self::PlacementFailed => 1001,
            Self::TimedOut => 1004,
            Self::ResourceUnavailable => 1010,
            Self::Killed { .. } | Self::Failed { .. } => 1015,
        }
    }

    /// Whether this outcome ends the life of the transfer
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

/// Outcome record flowing to the work source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub transfer_id: TransferId,
    /// Node that produced the outcome, when it came from a node
    pub node: Option<NodeId>,
    pub kind: OutcomeKind,
    pub message: String,
}

impl TransferOutcome {
    pub fn new(transfer_id: TransferId, kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            transfer_id,
            node: None,
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn from_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn scheduled(transfer_id: TransferId) -> Self {
        Self::new(transfer_id, OutcomeKind::Scheduled, "scheduled")
    }

    pub fn placement_failed(transfer_id: TransferId) -> Self {
        Self::new(
            transfer_id,
            OutcomeKind::PlacementFailed,
            "failed: no placement available",
        )
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}
