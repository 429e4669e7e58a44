use crate::partition::PartitionPolicyKind;

/// Configuration for physical optimization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Job that intermediate sets are named within.
    pub job_id: String,
    /// Join inputs estimated below this many bytes may be broadcast.
    pub broadcast_threshold: u64,
}

/// Configuration for executing stages on a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Number of workers (and partitions per set).
    pub partitions: usize,
    /// Threads in the worker pool.
    pub threads: usize,
    /// Target batch size.
    pub batch_size: usize,
    /// Count failing records and report a degraded stage instead of failing.
    pub tolerate_record_errors: bool,
    /// Policy used when loading sets into the cluster.
    pub ingestion_policy: PartitionPolicyKind,
    /// Seed for the random ingestion policy.
    pub seed: u64,
}
