//! Transfer scheduling for tape/disk storage nodes
//!
//! Wires the component crates together from one [`XferConfig`]:
//!
//! - [`build_dispatcher`] assembles the manager side (placement tracker and
//!   dispatcher) around a work source and a transport towards the nodes
//! - [`build_node`] assembles one node (admission queue, running transfers
//!   and agent) around a transport towards the manager and the dispatchers
//! - [`init_logging`] installs the configured subscriber
//!
//! Transports, the work source and the mover command line are supplied by
//! the embedding daemon through the traits re-exported below.

pub use xfer_config as config;
pub use xfer_node as node;
pub use xfer_sched as sched;
pub use xfer_telemetry as telemetry;

pub use xfer_config::{ConfigLoader, ManagerConfig, NodeConfig, XferConfig};
pub use xfer_node::{NodeAgent, ProcessExecutor, ProcessInspector};
pub use xfer_sched::{
    Dispatcher, ManagerClient, NodeClient, NodeDirectory, SchedulerClient, WorkSource,
};

use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use xfer_node::{LocalAdmissionQueue, RunningTransferTracker};
use xfer_sched::{NodeId, PlacementTracker};

/// Errors raised while assembling the services
#[derive(Debug, Error)]
pub enum XferError {
    #[error(transparent)]
    Config(#[from] xfer_config::ConfigError),

    #[error(transparent)]
    Telemetry(#[from] xfer_telemetry::TelemetryError),

    #[error(transparent)]
    Sched(#[from] xfer_sched::SchedError),

    #[error(transparent)]
    Node(#[from] xfer_node::NodeError),
}

pub type Result<T> = std::result::Result<T, XferError>;

/// Install the global subscriber described by the `[log]` section
pub fn init_logging(config: &XferConfig) -> Result<()> {
    let log = config.log.to_telemetry()?;
    xfer_telemetry::init_logging(&log)?;
    Ok(())
}

/// Build the manager side: one placement tracker and the dispatcher using it
///
/// The returned dispatcher is idle until [`Dispatcher::start`] is called.
/// It also serves as the [`SchedulerClient`] nodes report to, and its
/// tracker as their [`ManagerClient`]. Without a `directory` the per-pool
/// listings put every transfer in one unknown pool.
pub fn build_dispatcher(
    config: &ManagerConfig,
    nodes: Arc<dyn NodeClient>,
    source: Arc<dyn WorkSource>,
    directory: Option<Arc<dyn NodeDirectory>>,
) -> Result<Arc<Dispatcher>> {
    let tracker = Arc::new(PlacementTracker::new(
        config.placement.clone(),
        Arc::clone(&nodes),
    )?);
    let mut dispatcher = Dispatcher::new(config.dispatcher.clone(), tracker, nodes, source)?;
    if let Some(directory) = directory {
        dispatcher = dispatcher.with_directory(directory);
    }
    info!(scheduler = %dispatcher.id(), "Manager assembled");
    Ok(Arc::new(dispatcher))
}

/// Build one node agent
///
/// The admission queue gates backfill on the running tracker's weighted
/// slot usage.
pub fn build_node(
    config: &NodeConfig,
    manager: Arc<dyn ManagerClient>,
    schedulers: Arc<dyn SchedulerClient>,
    executor: Arc<dyn ProcessExecutor>,
    inspector: Arc<dyn ProcessInspector>,
) -> Result<Arc<NodeAgent>> {
    let node = NodeId::new(config.agent.node_id.clone());
    let running = Arc::new(RunningTransferTracker::new(
        config.running.clone(),
        node.clone(),
        inspector,
        Arc::clone(&manager),
        Arc::clone(&schedulers),
    )?);
    let queue = Arc::new(LocalAdmissionQueue::new(
        config.admission.clone(),
        node.clone(),
        running.clone(),
    )?);
    let agent = NodeAgent::new(
        config.agent.clone(),
        queue,
        running,
        manager,
        schedulers,
        executor,
    )?;
    info!(node = %node, slots = config.admission.total_slots, "Node assembled");
    Ok(Arc::new(agent))
}
