//! Node pool directory
//!
//! Monitoring groups pending transfers by the disk pool of the nodes holding
//! them. The node to pool mapping belongs to the deployment's catalogue and is
//! read through [`NodeDirectory`]. [`PoolDirectoryCache`] keeps the last answer
//! for one dispatcher and reloads it once it is older than its maximum age or
//! after [`PoolDirectoryCache::clear`].

use crate::types::NodeId;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Pool label for nodes the directory does not know
///
/// A node may leave the catalogue while transfers are still queued on it.
pub const UNKNOWN_POOL: &str = "???";

/// Source of the node to pool mapping
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Pool of every known node
    async fn load(&self) -> Result<HashMap<NodeId, String>>;
}

#[derive(Debug)]
struct Snapshot {
    pools: Arc<HashMap<NodeId, String>>,
    loaded_at: Instant,
}

/// Cached view of a [`NodeDirectory`], refreshed on demand
pub struct PoolDirectoryCache {
    directory: Arc<dyn NodeDirectory>,
    max_age: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl std::fmt::Debug for PoolDirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDirectoryCache")
            .field("max_age", &self.max_age)
            .field("cached", &self.snapshot.read().as_ref().map(|s| s.pools.len()))
            .finish()
    }
}

impl PoolDirectoryCache {
    pub fn new(directory: Arc<dyn NodeDirectory>, max_age: Duration) -> Self {
        Self {
            directory,
            max_age,
            snapshot: RwLock::new(None),
        }
    }

    /// Current mapping, loading it when absent or stale
    ///
    /// A failed reload keeps serving the previous mapping if there is one.
    pub async fn pools(&self) -> Result<Arc<HashMap<NodeId, String>>> {
        if let Some(fresh) = self.fresh() {
            return Ok(fresh);
        }

        match self.directory.load().await {
            Ok(pools) => {
                debug!(nodes = pools.len(), "Node directory reloaded");
                let pools = Arc::new(pools);
                *self.snapshot.write() = Some(Snapshot {
                    pools: Arc::clone(&pools),
                    loaded_at: Instant::now(),
                });
                Ok(pools)
            }
            Err(e) => match self.cached() {
                Some(stale) => {
                    warn!(error = %e, "Node directory reload failed, serving stale mapping");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    fn fresh(&self) -> Option<Arc<HashMap<NodeId, String>>> {
        let snapshot = self.snapshot.read();
        snapshot
            .as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.max_age)
            .map(|s| Arc::clone(&s.pools))
    }

    fn cached(&self) -> Option<Arc<HashMap<NodeId, String>>> {
        self.snapshot.read().as_ref().map(|s| Arc::clone(&s.pools))
    }

    /// Pool of one node, [`UNKNOWN_POOL`] if the directory does not list it
    pub async fn pool_of(&self, node: &NodeId) -> Result<String> {
        let pools = self.pools().await?;
        Ok(pools
            .get(node)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_POOL.to_string()))
    }

    /// Forget the cached mapping; the next lookup reloads it
    pub fn clear(&self) {
        *self.snapshot.write() = None;
    }
}
