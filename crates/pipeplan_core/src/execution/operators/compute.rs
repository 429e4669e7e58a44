use std::fmt;

use pipeplan_error::{OptionExt, Result, internal};

use super::{
    InputBuffer,
    Operator,
    PollExecute,
    RecordErrors,
    column_indices,
    project,
};
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::functions::{FunctionRegistry, ScalarFunction};
use crate::logical::{AtomicComputation, ComputationKind};

/// Evaluates a lambda, method, or attribute against each row and appends the
/// result as a new column.
///
/// Also used without a function to project rows for a write.
pub struct ComputeOperator {
    computation: String,
    /// Input columns carried to the output, in output order.
    projection: Vec<usize>,
    /// Columns passed to the function.
    arguments: Vec<usize>,
    function: Option<ScalarFunction>,
    input: InputBuffer,
    errors: RecordErrors,
}

impl fmt::Debug for ComputeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeOperator")
            .field("computation", &self.computation)
            .field("projection", &self.projection)
            .field("arguments", &self.arguments)
            .field("has_function", &self.function.is_some())
            .finish_non_exhaustive()
    }
}

impl ComputeOperator {
    /// Create an operator for `comp` reading rows with the given columns.
    pub fn try_new(
        comp: &AtomicComputation,
        input_columns: &[String],
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        let input = comp.input()?;
        let projection = column_indices(input_columns, &input.columns)?;

        let (arguments, function) = match comp.kind {
            ComputationKind::ApplyLambda
            | ComputationKind::ApplyMethod
            | ComputationKind::HoistAttribute => {
                let name = comp.function_name()?;
                let function = functions.get(name).required(name)?;
                (column_indices(input_columns, &input.apply_to)?, Some(function))
            }
            ComputationKind::WriteSet { .. } => (Vec::new(), None),
            _ => {
                return Err(internal!(
                    "{} is not handled by the compute operator",
                    comp.kind.name()
                ));
            }
        };

        Ok(ComputeOperator {
            computation: comp.name.clone(),
            projection,
            arguments,
            function,
            input: InputBuffer::default(),
            errors: RecordErrors::default(),
        })
    }
}

impl Operator for ComputeOperator {
    fn name(&self) -> &'static str {
        "Compute"
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

            let mut out = project(&row, &self.projection);
            if let Some(function) = &self.function {
                let args = project(&row, &self.arguments);
                match function(&args) {
                    Ok(value) => out.push(value),
                    Err(err) => {
                        self.errors.handle(&self.computation, err)?;
                        continue;
                    }
                }
            }
            output.push(out)?;
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
