use pipeplan_error::Result;
use tracing::debug;

use super::Sink;
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::scalar::Row;
use crate::logical::SetIdentifier;
use crate::partition::{PartitionPolicy, PartitionPolicyKind};

/// Hash partitions rows on key columns, writing each bucket to the matching
/// partition of the output set.
///
/// Every worker hashes with the same fixed seeds, so rows with equal keys land
/// in the same partition no matter which worker produced them.
#[derive(Debug)]
pub struct RepartitionSink {
    set: SetIdentifier,
    columns: Vec<String>,
    keys: Vec<usize>,
    rows: Vec<Row>,
    rows_written: u64,
}

impl RepartitionSink {
    pub fn new(set: SetIdentifier, columns: Vec<String>, keys: Vec<usize>) -> Self {
        RepartitionSink {
            set,
            columns,
            keys,
            rows: Vec::new(),
            rows_written: 0,
        }
    }
}

impl Sink for RepartitionSink {
    fn name(&self) -> &'static str {
        "Repartition"
    }

    fn push_batch(&mut self, _ctx: &ExecutionContext, batch: Batch) -> Result<()> {
        self.rows.extend(batch.into_rows());
        Ok(())
    }

    fn finalize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let rows = std::mem::take(&mut self.rows);
        self.rows_written = rows.len() as u64;

        let mut policy = PartitionPolicy::try_new(PartitionPolicyKind::Hash, 0)?;
        let buckets = policy.partition_rows(rows, &self.keys, ctx.num_workers)?;
        for (partition, rows) in buckets.into_iter().enumerate() {
            ctx.store.append(&self.set, &self.columns, partition, rows)?;
        }

        debug!(
            stage = %ctx.stage,
            worker = ctx.worker,
            set = %self.set,
            rows = self.rows_written,
            "repartitioned rows"
        );
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }
}
