pub mod aggregate;
pub mod compute;
pub mod filter;
pub mod hash_build;
pub mod hash_probe;
pub mod materialize;
pub mod repartition;

use std::collections::VecDeque;
use std::fmt::Debug;

use pipeplan_error::{PlanError, Result, internal, malformed};
use tracing::trace;

use super::batch::Batch;
use super::context::ExecutionContext;
use super::scalar::{Row, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExecute {
    /// Operator wrote rows to the output batch.
    ///
    /// The output should be pushed downstream and the operator polled again.
    HasMore,
    /// Operator consumed its input without producing more output. Push the
    /// next input batch.
    NeedsMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFinalize {
    /// Operator finalized, no more output.
    Finalized,
    /// This operator needs to be drained.
    ///
    /// `fill_next_output_batch` will be called until it returns `NeedsMore`.
    NeedsDrain,
}

/// A streaming operator inside a pipeline.
///
/// Input is loaded one batch at a time. The pipeline fills output batches
/// until the operator reports it needs more input, so a single input batch may
/// produce any number of output batches.
pub trait Operator: Send + Debug {
    fn name(&self) -> &'static str;

    /// Called once before any input is loaded.
    fn initialize(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Load the next input batch. Only called once the previous batch has
    /// been fully consumed.
    fn load_input_batch(&mut self, batch: Batch) -> Result<()>;

    fn fill_next_output_batch(
        &mut self,
        ctx: &ExecutionContext,
        output: &mut Batch,
    ) -> Result<PollExecute>;

    /// Called once all input has been loaded and consumed.
    fn finalize(&mut self, _ctx: &ExecutionContext) -> Result<PollFinalize> {
        Ok(PollFinalize::Finalized)
    }

    /// Number of records that failed and were skipped.
    fn record_errors(&self) -> u64 {
        0
    }
}

/// Terminal operator of a pipeline.
pub trait Sink: Send + Debug {
    fn name(&self) -> &'static str;

    fn initialize(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn push_batch(&mut self, ctx: &ExecutionContext, batch: Batch) -> Result<()>;

    /// Called once after the last batch. Results become visible here.
    fn finalize(&mut self, ctx: &ExecutionContext) -> Result<()>;

    fn rows_written(&self) -> u64;
}

/// Rows of the currently loaded input batch not yet consumed.
#[derive(Debug, Default)]
pub struct InputBuffer {
    rows: VecDeque<Row>,
}

impl InputBuffer {
    pub fn load(&mut self, batch: Batch) -> Result<()> {
        if !self.rows.is_empty() {
            return Err(internal!(
                "loaded input batch with {} rows still pending",
                self.rows.len()
            ));
        }
        self.rows.extend(batch.into_rows());
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Counts records that failed to evaluate.
///
/// When tolerated the error is counted and the record skipped, otherwise the
/// error fails the operator.
#[derive(Debug, Default)]
pub struct RecordErrors {
    tolerate: bool,
    count: u64,
}

impl RecordErrors {
    pub fn new(tolerate: bool) -> Self {
        RecordErrors { tolerate, count: 0 }
    }

    pub fn handle(&mut self, operator: &str, err: PlanError) -> Result<()> {
        if self.tolerate {
            self.count += 1;
            trace!(operator, %err, "skipping failed record");
            Ok(())
        } else {
            Err(err)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Positions of `wanted` columns in `available`.
pub fn column_indices<S: AsRef<str>>(available: &[String], wanted: &[S]) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|want| {
            let want = want.as_ref();
            available
                .iter()
                .position(|c| c == want)
                .ok_or_else(|| malformed!("column '{want}' not in [{}]", available.join(", ")))
        })
        .collect()
}

/// Pick values out of a row by position.
pub fn project(row: &[ScalarValue], indices: &[usize]) -> Row {
    indices.iter().map(|&idx| row[idx].clone()).collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::execution::functions::FunctionRegistry;
    use crate::execution::storage::MemorySetStore;
    use crate::hash_set::HashSetManager;
    use crate::runtime::transport::LocalTransport;
    use crate::stage::StageId;

    /// Owns the state borrowed by an execution context.
    #[derive(Debug)]
    pub struct TestEnv {
        pub hash_sets: HashSetManager,
        pub store: MemorySetStore,
        pub transport: LocalTransport,
        pub functions: FunctionRegistry,
        pub tolerate: bool,
        pub batch_size: usize,
    }

    impl TestEnv {
        pub fn new() -> Self {
            TestEnv {
                hash_sets: HashSetManager::new(),
                store: MemorySetStore::new(1),
                transport: LocalTransport::new(Vec::new()),
                functions: FunctionRegistry::with_builtins(),
                tolerate: false,
                batch_size: 2,
            }
        }

        pub fn context(&self) -> ExecutionContext<'_> {
            ExecutionContext {
                stage: StageId(0),
                worker: 0,
                num_workers: 1,
                batch_size: self.batch_size,
                tolerate_record_errors: self.tolerate,
                hash_sets: &self.hash_sets,
                store: &self.store,
                transport: &self.transport,
                functions: &self.functions,
            }
        }
    }

    /// Push rows through a single operator, returning everything it produced.
    pub fn run_operator(
        op: &mut dyn Operator,
        ctx: &ExecutionContext,
        rows: Vec<Row>,
    ) -> Result<Vec<Row>> {
        op.initialize(ctx)?;
        let mut out = Vec::new();
        for batch in crate::execution::batch::into_batches(rows, ctx.batch_size) {
            op.load_input_batch(batch)?;
            drain(op, ctx, &mut out)?;
        }
        if op.finalize(ctx)? == PollFinalize::NeedsDrain {
            drain(op, ctx, &mut out)?;
        }
        Ok(out)
    }

    fn drain(op: &mut dyn Operator, ctx: &ExecutionContext, out: &mut Vec<Row>) -> Result<()> {
        loop {
            let mut batch = Batch::new(ctx.batch_size);
            match op.fill_next_output_batch(ctx, &mut batch)? {
                PollExecute::HasMore => {
                    assert!(batch.num_rows() <= ctx.batch_size);
                    out.extend(batch.into_rows());
                }
                PollExecute::NeedsMore => {
                    assert!(batch.is_empty());
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_indices_by_name() {
        let available = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(vec![2, 0], column_indices(&available, &["c", "a"]).unwrap());
        column_indices(&available, &["d"]).unwrap_err();
    }

    #[test]
    fn record_errors_tolerated() {
        let mut errors = RecordErrors::new(true);
        errors
            .handle("test", PlanError::Execution("bad".to_string()))
            .unwrap();
        assert_eq!(1, errors.count());

        let mut errors = RecordErrors::new(false);
        errors
            .handle("test", PlanError::Execution("bad".to_string()))
            .unwrap_err();
    }

    #[test]
    fn input_buffer_rejects_overlapping_loads() {
        let mut buf = InputBuffer::default();
        let batch = Batch::try_from_rows(vec![vec![ScalarValue::Int64(1)]], 4).unwrap();
        buf.load(batch.clone()).unwrap();
        buf.load(batch).unwrap_err();
        assert!(buf.pop().is_some());
        assert!(buf.is_empty());
    }
}
