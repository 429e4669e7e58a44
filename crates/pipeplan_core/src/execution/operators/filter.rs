use pipeplan_error::{PlanError, Result, malformed};

use super::{InputBuffer, Operator, PollExecute, RecordErrors, column_indices, project};
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::scalar::ScalarValue;
use crate::logical::AtomicComputation;

/// Keeps rows whose predicate column is true. Null and false drop the row.
#[derive(Debug)]
pub struct FilterOperator {
    computation: String,
    predicate: usize,
    projection: Vec<usize>,
    input: InputBuffer,
    errors: RecordErrors,
}

impl FilterOperator {
    pub fn try_new(comp: &AtomicComputation, input_columns: &[String]) -> Result<Self> {
        let input = comp.input()?;
        let predicate = match column_indices(input_columns, &input.apply_to)?.as_slice() {
            [predicate] => *predicate,
            other => {
                return Err(malformed!(
                    "filter '{}' needs one predicate column, has {}",
                    comp.name,
                    other.len()
                ));
            }
        };
        let projection = column_indices(input_columns, &input.columns)?;

        Ok(FilterOperator {
            computation: comp.name.clone(),
            predicate,
            projection,
            input: InputBuffer::default(),
            errors: RecordErrors::default(),
        })
    }
}

impl Operator for FilterOperator {
    fn name(&self) -> &'static str {
        "Filter"
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
        while !output.is_full() {
            let Some(row) = self.input.pop() else {
                break;
            };

            let keep = match &row[self.predicate] {
                ScalarValue::Boolean(b) => *b,
                ScalarValue::Null => false,
                other => {
                    let err = PlanError::Execution(format!(
                        "filter '{}' predicate evaluated to {}, expected boolean",
                        self.computation,
                        other.datatype_name()
                    ));
                    self.errors.handle(&self.computation, err)?;
                    false
                }
            };

            if keep {
                output.push(project(&row, &self.projection))?;
            }
        }

        if output.is_empty() {
            Ok(PollExecute::NeedsMore)
        } else {
            Ok(PollExecute::HasMore)
        }
    }

    fn record_errors(&self) -> u64 {
        self.errors.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::testutil::{TestEnv, run_operator};
    use crate::logical::{PlanBuilder, SetIdentifier};

    fn filter_op() -> FilterOperator {
        let plan = PlanBuilder::new()
            .scan("s", SetIdentifier::new("db", "a"), &["x", "keep"])
            .filter("f", "s", "keep")
            .build()
            .unwrap();
        FilterOperator::try_new(
            &plan.computations()[1],
            &["x".to_string(), "keep".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn drops_false_and_null() {
        let env = TestEnv::new();
        let rows = vec![
            vec![ScalarValue::Int64(1), ScalarValue::Boolean(true)],
            vec![ScalarValue::Int64(2), ScalarValue::Boolean(false)],
            vec![ScalarValue::Int64(3), ScalarValue::Null],
            vec![ScalarValue::Int64(4), ScalarValue::Boolean(true)],
            vec![ScalarValue::Int64(5), ScalarValue::Boolean(true)],
        ];
        let mut op = filter_op();
        let out = run_operator(&mut op, &env.context(), rows).unwrap();
        assert_eq!(
            vec![
                vec![ScalarValue::Int64(1)],
                vec![ScalarValue::Int64(4)],
                vec![ScalarValue::Int64(5)],
            ],
            out
        );
    }

    #[test]
    fn non_boolean_predicate() {
        let rows = vec![vec![ScalarValue::Int64(1), ScalarValue::Int64(1)]];

        let env = TestEnv::new();
        let mut op = filter_op();
        run_operator(&mut op, &env.context(), rows.clone()).unwrap_err();

        let mut env = TestEnv::new();
        env.tolerate = true;
        let mut op = filter_op();
        let out = run_operator(&mut op, &env.context(), rows).unwrap();
        assert!(out.is_empty());
        assert_eq!(1, op.record_errors());
    }
}
