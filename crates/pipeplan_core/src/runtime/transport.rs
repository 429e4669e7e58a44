use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use pipeplan_error::{OptionExt, Result};
use tracing::trace;

use crate::hash_set::{HashSetManager, HashSetName, JoinHashSet};
use crate::stage::Stage;

/// Moves stages and hash sets between workers.
pub trait Transport: Send + Sync + Debug {
    /// Send a stage to a worker ahead of executing it. Returns the stage as
    /// the worker received it, which is what the worker executes.
    fn send_stage(&self, worker: usize, stage: &Stage) -> Result<Stage>;

    /// Deliver a serialized hash set to a worker's manager.
    fn ship_serialized_hash_set(&self, worker: usize, name: HashSetName, bytes: Bytes)
    -> Result<()>;
}

/// Transport between workers in the same process.
///
/// Stages and hash sets are still serialized so that everything crossing a
/// worker boundary goes through the same encoding a remote transport would
/// use.
#[derive(Debug, Default)]
pub struct LocalTransport {
    managers: Vec<Arc<HashSetManager>>,
    stages_sent: AtomicU64,
    bytes_shipped: AtomicU64,
}

impl LocalTransport {
    /// Create a transport delivering to the given per-worker managers, indexed
    /// by worker id.
    pub fn new(managers: Vec<Arc<HashSetManager>>) -> Self {
        LocalTransport {
            managers,
            stages_sent: AtomicU64::new(0),
            bytes_shipped: AtomicU64::new(0),
        }
    }

    pub fn stages_sent(&self) -> u64 {
        self.stages_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_shipped(&self) -> u64 {
        self.bytes_shipped.load(Ordering::Relaxed)
    }
}

impl Transport for LocalTransport {
    fn send_stage(&self, worker: usize, stage: &Stage) -> Result<Stage> {
        self.managers.get(worker).required(format!("worker {worker}"))?;
        let encoded = serde_json::to_vec(stage)?;
        let received: Stage = serde_json::from_slice(&encoded)?;
        self.stages_sent.fetch_add(1, Ordering::Relaxed);
        trace!(worker, stage = %stage.id, bytes = encoded.len(), "sent stage");
        Ok(received)
    }

    fn ship_serialized_hash_set(
        &self,
        worker: usize,
        name: HashSetName,
        bytes: Bytes,
    ) -> Result<()> {
        let manager = self.managers.get(worker).required(format!("worker {worker}"))?;
        let set = JoinHashSet::from_bytes(&bytes)?;
        self.bytes_shipped
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        trace!(worker, %name, bytes = bytes.len(), "shipped hash set");
        manager.add(name, set)
    }
}
