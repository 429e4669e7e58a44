use pipeplan_error::Result;
use tracing::debug;

use super::Sink;
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::scalar::Row;
use crate::logical::SetIdentifier;

/// Writes rows into the executing worker's partition of a set.
#[derive(Debug)]
pub struct MaterializeSink {
    set: SetIdentifier,
    columns: Vec<String>,
    rows: Vec<Row>,
    rows_written: u64,
}

impl MaterializeSink {
    pub fn new(set: SetIdentifier, columns: Vec<String>) -> Self {
        MaterializeSink {
            set,
            columns,
            rows: Vec::new(),
            rows_written: 0,
        }
    }
}

impl Sink for MaterializeSink {
    fn name(&self) -> &'static str {
        "Materialize"
    }

    fn push_batch(&mut self, _ctx: &ExecutionContext, batch: Batch) -> Result<()> {
        self.rows.extend(batch.into_rows());
        Ok(())
    }

    fn finalize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let rows = std::mem::take(&mut self.rows);
        self.rows_written = rows.len() as u64;
        ctx.store
            .append(&self.set, &self.columns, ctx.worker, rows)?;
        debug!(
            stage = %ctx.stage,
            worker = ctx.worker,
            set = %self.set,
            rows = self.rows_written,
            "materialized partition"
        );
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }
}
