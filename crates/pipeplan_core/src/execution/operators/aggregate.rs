use std::cmp::Ordering;
use std::collections::VecDeque;

use pipeplan_error::{PlanError, Result};
use tracing::debug;

use super::{
    InputBuffer,
    Operator,
    PollExecute,
    PollFinalize,
    RecordErrors,
    column_indices,
    project,
};
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::scalar::{Row, ScalarValue, encode_group_key};
use crate::logical::{AggregateFunction, AtomicComputation, PARAM_VALUE};

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum {
        int: i64,
        float: f64,
        saw_float: bool,
        seen: bool,
    },
    /// Min keeps values that compare `Less`, max keeps `Greater`.
    Extreme {
        keep: Ordering,
        value: Option<ScalarValue>,
    },
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Sum => Accumulator::Sum {
                int: 0,
                float: 0.0,
                saw_float: false,
                seen: false,
            },
            AggregateFunction::Min => Accumulator::Extreme {
                keep: Ordering::Less,
                value: None,
            },
            AggregateFunction::Max => Accumulator::Extreme {
                keep: Ordering::Greater,
                value: None,
            },
        }
    }

    /// Update with a value. Nulls are ignored by everything except count
    /// without a value column.
    fn update(&mut self, value: Option<&ScalarValue>) -> Result<()> {
        match self {
            Accumulator::Count(count) => {
                if !value.is_some_and(|v| v.is_null()) {
                    *count += 1;
                }
            }
            Accumulator::Sum {
                int,
                float,
                saw_float,
                seen,
            } => match value {
                None | Some(ScalarValue::Null) => (),
                Some(ScalarValue::Int64(v)) => {
                    *int = int.checked_add(*v).ok_or_else(|| {
                        PlanError::Execution("integer overflow in sum".to_string())
                    })?;
                    *seen = true;
                }
                Some(ScalarValue::Float64(v)) => {
                    *float += v;
                    *saw_float = true;
                    *seen = true;
                }
                Some(other) => {
                    return Err(PlanError::Execution(format!(
                        "cannot sum {} value",
                        other.datatype_name()
                    )));
                }
            },
            Accumulator::Extreme { keep, value: best } => {
                let Some(value) = value.filter(|v| !v.is_null()) else {
                    return Ok(());
                };
                match best {
                    None => *best = Some(value.clone()),
                    Some(current) => match value.compare(current) {
                        Some(ord) if ord == *keep => *best = Some(value.clone()),
                        Some(_) => (),
                        None => {
                            return Err(PlanError::Execution(format!(
                                "cannot compare {} with {}",
                                value.datatype_name(),
                                current.datatype_name()
                            )));
                        }
                    },
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> ScalarValue {
        match self {
            Accumulator::Count(count) => ScalarValue::Int64(count),
            Accumulator::Sum { seen: false, .. } => ScalarValue::Null,
            Accumulator::Sum {
                int,
                float,
                saw_float: true,
                ..
            } => ScalarValue::Float64(float + int as f64),
            Accumulator::Sum { int, .. } => ScalarValue::Int64(int),
            Accumulator::Extreme { value, .. } => value.unwrap_or(ScalarValue::Null),
        }
    }
}

#[derive(Debug)]
struct Group {
    keys: Row,
    accumulator: Accumulator,
}

/// Hash aggregate over the rows of one partition.
///
/// Input is repartitioned by the group keys before reaching this operator, so
/// every group is complete within a partition. Output rows are the group keys
/// followed by the aggregate value, ordered by encoded key.
#[derive(Debug)]
pub struct HashAggregateOperator {
    computation: String,
    function: AggregateFunction,
    keys: Vec<usize>,
    value: Option<usize>,
    groups: hashbrown::HashMap<Vec<u8>, Group>,
    input: InputBuffer,
    /// Output rows once finalized.
    drain: Option<VecDeque<Row>>,
    errors: RecordErrors,
}

impl HashAggregateOperator {
    pub fn try_new(comp: &AtomicComputation, input_columns: &[String]) -> Result<Self> {
        let input = comp.input()?;
        let function = comp.aggregate_function()?;
        let value = match comp.param(PARAM_VALUE) {
            Some(value) => Some(column_indices(input_columns, &[value])?[0]),
            None => None,
        };

        Ok(HashAggregateOperator {
            computation: comp.name.clone(),
            function,
            keys: column_indices(input_columns, &input.apply_to)?,
            value,
            groups: hashbrown::HashMap::new(),
            input: InputBuffer::default(),
            drain: None,
            errors: RecordErrors::default(),
        })
    }
}

impl Operator for HashAggregateOperator {
    fn name(&self) -> &'static str {
        "HashAggregate"
    }

    fn initialize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.errors = RecordErrors::new(ctx.tolerate_record_errors);
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
        if let Some(drain) = &mut self.drain {
            while !output.is_full() {
                let Some(row) = drain.pop_front() else {
                    break;
                };
                output.push(row)?;
            }
            return if output.is_empty() {
                Ok(PollExecute::NeedsMore)
            } else {
                Ok(PollExecute::HasMore)
            };
        }

        while let Some(row) = self.input.pop() {
            let key = encode_group_key(&row, &self.keys);
            let function = self.function;
            let group = self.groups.entry(key).or_insert_with(|| Group {
                keys: project(&row, &self.keys),
                accumulator: Accumulator::new(function),
            });
            let value = self.value.map(|idx| &row[idx]);
            if let Err(err) = group.accumulator.update(value) {
                self.errors.handle(&self.computation, err)?;
            }
        }

        Ok(PollExecute::NeedsMore)
    }

    fn finalize(&mut self, ctx: &ExecutionContext) -> Result<PollFinalize> {
        let mut groups: Vec<_> = self.groups.drain().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(
            stage = %ctx.stage,
            worker = ctx.worker,
            groups = groups.len(),
            function = %self.function,
            "finalized aggregate"
        );

        let rows = groups
            .into_iter()
            .map(|(_, group)| {
                let mut row = group.keys;
                row.push(group.accumulator.finish());
                row
            })
            .collect();
        self.drain = Some(rows);

        Ok(PollFinalize::NeedsDrain)
    }

    fn record_errors(&self) -> u64 {
        self.errors.count()
    }
}
