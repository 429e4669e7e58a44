use pipeplan_error::{OptionExt, Result, internal};
use tracing::{debug, trace};

use super::batch::{Batch, into_batches};
use super::context::ExecutionContext;
use super::functions::FunctionRegistry;
use super::operators::aggregate::HashAggregateOperator;
use super::operators::compute::ComputeOperator;
use super::operators::filter::FilterOperator;
use super::operators::hash_build::{HashBuildSink, HashSetTarget};
use super::operators::hash_probe::HashProbeOperator;
use super::operators::materialize::MaterializeSink;
use super::operators::repartition::RepartitionSink;
use super::operators::{Operator, PollExecute, PollFinalize, Sink, column_indices, project};
use crate::logical::ComputationKind;
use crate::stage::{Stage, StageId, StageSink, StageSource, StageStep};

/// Counts from executing a pipeline on one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub rows_read: u64,
    pub rows_written: u64,
    pub record_errors: u64,
}

/// A stage compiled into operators for execution on one worker.
///
/// Rows from the worker's partition of the source set are pushed through the
/// operators in order, ending at the sink.
#[derive(Debug)]
pub struct ExecutablePipeline {
    stage: StageId,
    source: StageSource,
    operators: Vec<Box<dyn Operator>>,
    sink: Box<dyn Sink>,
}

impl ExecutablePipeline {
    pub fn try_from_stage(stage: &Stage, functions: &FunctionRegistry) -> Result<Self> {
        let mut columns = stage.source.columns.clone();
        let mut operators: Vec<Box<dyn Operator>> = Vec::with_capacity(stage.steps.len());

        for step in &stage.steps {
            let (operator, output_columns): (Box<dyn Operator>, _) = match step {
                StageStep::Compute(comp) => {
                    let operator: Box<dyn Operator> = match comp.kind {
                        ComputationKind::Filter => {
                            Box::new(FilterOperator::try_new(comp, &columns)?)
                        }
                        _ => Box::new(ComputeOperator::try_new(comp, &columns, functions)?),
                    };
                    (operator, comp.output.columns.clone())
                }
                StageStep::Probe(probe) => (
                    Box::new(HashProbeOperator::try_new(probe, &columns)?),
                    probe.join.output.columns.clone(),
                ),
                StageStep::Aggregate(comp) => (
                    Box::new(HashAggregateOperator::try_new(comp, &columns)?),
                    comp.output.columns.clone(),
                ),
            };
            operators.push(operator);
            columns = output_columns;
        }

        let sink: Box<dyn Sink> = match &stage.sink {
            StageSink::Materialize { set } => Box::new(MaterializeSink::new(set.clone(), columns)),
            StageSink::Repartition { set, keys } => {
                let keys = column_indices(&columns, keys)?;
                Box::new(RepartitionSink::new(set.clone(), columns, keys))
            }
            StageSink::BroadcastHashSet {
                name,
                keys,
                columns: build_columns,
            } => Box::new(HashBuildSink::new(
                *name,
                HashSetTarget::Broadcast,
                column_indices(&columns, keys)?,
                column_indices(&columns, build_columns)?,
            )),
            StageSink::LocalHashSet {
                name,
                keys,
                columns: build_columns,
            } => Box::new(HashBuildSink::new(
                *name,
                HashSetTarget::Local,
                column_indices(&columns, keys)?,
                column_indices(&columns, build_columns)?,
            )),
        };

        Ok(ExecutablePipeline {
            stage: stage.id,
            source: stage.source.clone(),
            operators,
            sink,
        })
    }

    /// Run the pipeline to completion on the context's worker.
    pub fn execute(&mut self, ctx: &ExecutionContext) -> Result<PipelineOutcome> {
        if ctx.stage != self.stage {
            return Err(internal!(
                "pipeline for stage {} executed with context for stage {}",
                self.stage,
                ctx.stage
            ));
        }

        for operator in &mut self.operators {
            operator.initialize(ctx)?;
        }
        self.sink.initialize(ctx)?;

        let stored_columns = ctx.store.columns(&self.source.set).required(&self.source.set)?;
        let source_projection = column_indices(&stored_columns, &self.source.columns)?;
        let rows = ctx.store.read_partition(&self.source.set, ctx.worker)?;
        let rows_read = rows.len() as u64;
        trace!(
            stage = %self.stage,
            worker = ctx.worker,
            set = %self.source.set,
            rows = rows_read,
            "reading source partition"
        );

        let rows = rows
            .into_iter()
            .map(|row| project(&row, &source_projection))
            .collect();
        for batch in into_batches(rows, ctx.batch_size) {
            self.push_from(ctx, 0, batch)?;
        }

        for idx in 0..self.operators.len() {
            if self.operators[idx].finalize(ctx)? == PollFinalize::NeedsDrain {
                self.pull_from(ctx, idx)?;
            }
        }
        self.sink.finalize(ctx)?;

        let outcome = PipelineOutcome {
            rows_read,
            rows_written: self.sink.rows_written(),
            record_errors: self.operators.iter().map(|op| op.record_errors()).sum(),
        };
        debug!(
            stage = %self.stage,
            worker = ctx.worker,
            rows_read = outcome.rows_read,
            rows_written = outcome.rows_written,
            record_errors = outcome.record_errors,
            "pipeline finished"
        );

        Ok(outcome)
    }

    /// Push a batch into the operator at `idx`, or the sink past the last
    /// operator.
    fn push_from(&mut self, ctx: &ExecutionContext, idx: usize, batch: Batch) -> Result<()> {
        if idx == self.operators.len() {
            return self.sink.push_batch(ctx, batch);
        }
        self.operators[idx].load_input_batch(batch)?;
        self.pull_from(ctx, idx)
    }

    /// Pull output from the operator at `idx` until it needs more input.
    fn pull_from(&mut self, ctx: &ExecutionContext, idx: usize) -> Result<()> {
        loop {
            let mut output = Batch::new(ctx.batch_size);
            match self.operators[idx].fill_next_output_batch(ctx, &mut output)? {
                PollExecute::HasMore => self.push_from(ctx, idx + 1, output)?,
                PollExecute::NeedsMore => return Ok(()),
            }
        }
    }
}
