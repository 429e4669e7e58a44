use std::collections::VecDeque;
use std::sync::Arc;

use pipeplan_error::{OptionExt, PlanError, Result, internal};
use tracing::debug;

use super::{InputBuffer, Operator, PollExecute, column_indices, project};
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::scalar::{Row, ScalarValue, encode_join_key};
use crate::hash_set::JoinHashSet;
use crate::stage::{HashSetRef, JoinSide, ProbeStep};

/// Probes a hash set with rows from the streamed side of a join.
///
/// Matches are buffered so a probe row with many matches can span several
/// output batches.
#[derive(Debug)]
pub struct HashProbeOperator {
    hash_set: HashSetRef,
    build_side: JoinSide,
    probe_keys: Vec<usize>,
    probe_projection: Vec<usize>,
    /// Hash sets to probe, populated on initialize. Broadcast joins probe one
    /// part per building worker.
    tables: Vec<Arc<JoinHashSet>>,
    input: InputBuffer,
    pending: VecDeque<Row>,
}

impl HashProbeOperator {
    pub fn try_new(step: &ProbeStep, input_columns: &[String]) -> Result<Self> {
        let probe = match step.build_side.other() {
            JoinSide::Left => step.join.left_input()?,
            JoinSide::Right => step.join.right_input()?,
        };
        Ok(HashProbeOperator {
            hash_set: step.hash_set,
            build_side: step.build_side,
            probe_keys: column_indices(input_columns, &probe.apply_to)?,
            probe_projection: column_indices(input_columns, &probe.columns)?,
            tables: Vec::new(),
            input: InputBuffer::default(),
            pending: VecDeque::new(),
        })
    }
}

/// Concatenate build and probe values in join output order.
fn join_row(build_side: JoinSide, build: &[ScalarValue], probe: &[ScalarValue]) -> Row {
    let mut out = Vec::with_capacity(build.len() + probe.len());
    match build_side {
        JoinSide::Left => {
            out.extend_from_slice(build);
            out.extend_from_slice(probe);
        }
        JoinSide::Right => {
            out.extend_from_slice(probe);
            out.extend_from_slice(build);
        }
    }
    out
}

impl Operator for HashProbeOperator {
    fn name(&self) -> &'static str {
        "HashProbe"
    }

    fn initialize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.tables = match self.hash_set {
            HashSetRef::Local(name) => vec![ctx.hash_sets.get(&name).required(name)?],
            HashSetRef::Broadcast(name) => {
                let parts = ctx.hash_sets.parts(&name);
                if parts.is_empty() {
                    return Err(PlanError::not_found(name));
                }
                if parts.len() != ctx.num_workers {
                    return Err(internal!(
                        "hash set {name} has {} parts, expected {}",
                        parts.len(),
                        ctx.num_workers
                    ));
                }
                parts
            }
        };
        debug!(
            stage = %ctx.stage,
            worker = ctx.worker,
            hash_set = %self.hash_set.name(),
            parts = self.tables.len(),
            "probing hash set"
        );
        Ok(())
    }

    fn load_input_batch(&mut self, batch: Batch) -> Result<()> {
        self.input.load(batch)
    }

    fn fill_next_output_batch(
        &mut self,
        _ctx: &ExecutionContext,
        output: &mut Batch,
    ) -> Result<PollExecute> {
        while !output.is_full() {
            if let Some(row) = self.pending.pop_front() {
                output.push(row)?;
                continue;
            }

            let Some(row) = self.input.pop() else {
                break;
            };
            let Some(key) = encode_join_key(&row, &self.probe_keys) else {
                continue;
            };
            let probe = project(&row, &self.probe_projection);
            for table in &self.tables {
                if let Some(matches) = table.get(&key) {
                    for build in matches {
                        self.pending
                            .push_back(join_row(self.build_side, build, &probe));
                    }
                }
            }
        }

        if output.is_empty() {
            Ok(PollExecute::NeedsMore)
        } else {
            Ok(PollExecute::HasMore)
        }
    }
}
