//! Node-Side Transfer Admission and Supervision
//!
//! Everything one storage node runs to take part in transfer scheduling:
//!
//! - **Admission Queue**: priority, main and backfill ordering with
//!   slot-gated backfill and queue timeouts
//! - **Running Transfers**: exit detection, adopted movers, outcome reports
//! - **Executor**: the seam towards the mover processes
//! - **Agent**: inbound manager calls and the dequeue / start loop

pub mod admission;
pub mod agent;
pub mod executor;
pub mod running;

pub use admission::{AdmissionConfig, LocalAdmissionQueue, QueueSnapshot, SlotGauge};
pub use agent::{AgentConfig, NodeAgent, TickOutcome};
pub use executor::{
    ChildHandle, CommandExecutor, ExitState, ProcInspector, ProcessExecutor, ProcessHandle,
    ProcessInspector,
};
pub use running::{RunningConfig, RunningSummary, RunningTransferTracker};

use thiserror::Error;
use xfer_sched::SchedError;

/// Node error types
#[derive(Debug, Error)]
pub enum NodeError {
    /// Remote call or scheduling failure
    #[error(transparent)]
    Sched(#[from] SchedError),

    /// Mover could not be launched
    #[error("Failed to spawn mover: {0}")]
    Spawn(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
