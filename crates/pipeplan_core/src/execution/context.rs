use super::functions::FunctionRegistry;
use super::storage::MemorySetStore;
use crate::hash_set::HashSetManager;
use crate::runtime::transport::Transport;
use crate::stage::StageId;

/// Everything an operator may touch while executing a stage on one worker.
///
/// The hash set manager belongs to the executing worker. Nothing is reached
/// through globals.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub stage: StageId,
    /// Worker executing the stage, also the partition it reads.
    pub worker: usize,
    pub num_workers: usize,
    pub batch_size: usize,
    pub tolerate_record_errors: bool,
    pub hash_sets: &'a HashSetManager,
    pub store: &'a MemorySetStore,
    pub transport: &'a dyn Transport,
    pub functions: &'a FunctionRegistry,
}
