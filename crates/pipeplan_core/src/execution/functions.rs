use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use pipeplan_error::{PlanError, Result};

use super::scalar::ScalarValue;

/// A function applied to the `apply_to` columns of a row.
pub type ScalarFunction = Arc<dyn Fn(&[ScalarValue]) -> Result<ScalarValue> + Send + Sync>;

/// Lambdas, methods, and attributes referenced by name from computations.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, ScalarFunction>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the builtin functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, function) in builtins() {
            registry.functions.insert(name.to_string(), function);
        }
        registry
    }

    /// Register a function. Names are unique.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<()>
    where
        F: Fn(&[ScalarValue]) -> Result<ScalarValue> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(PlanError::already_exists(format!("function '{name}'")));
        }
        self.functions.insert(name, Arc::new(function));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ScalarFunction> {
        self.functions.get(name).cloned()
    }
}

fn builtins() -> Vec<(&'static str, ScalarFunction)> {
    vec![
        ("identity", Arc::new(identity) as ScalarFunction),
        ("is_not_null", Arc::new(is_not_null) as ScalarFunction),
        ("add", Arc::new(add) as ScalarFunction),
        ("eq", Arc::new(eq) as ScalarFunction),
        ("length", Arc::new(length) as ScalarFunction),
        ("concat", Arc::new(concat) as ScalarFunction),
    ]
}

fn identity(args: &[ScalarValue]) -> Result<ScalarValue> {
    args.first()
        .cloned()
        .ok_or_else(|| PlanError::Execution("identity expects one argument".to_string()))
}

fn is_not_null(args: &[ScalarValue]) -> Result<ScalarValue> {
    Ok(ScalarValue::Boolean(args.iter().all(|a| !a.is_null())))
}

/// Sum of numeric arguments. Null if any argument is null.
fn add(args: &[ScalarValue]) -> Result<ScalarValue> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(ScalarValue::Null);
    }
    if args.iter().all(|a| matches!(a, ScalarValue::Int64(_))) {
        let mut sum: i64 = 0;
        for arg in args {
            sum = sum
                .checked_add(arg.try_as_i64()?)
                .ok_or_else(|| PlanError::Execution("integer overflow in add".to_string()))?;
        }
        return Ok(ScalarValue::Int64(sum));
    }
    let mut sum = 0.0;
    for arg in args {
        sum += arg.try_as_f64()?;
    }
    Ok(ScalarValue::Float64(sum))
}

fn eq(args: &[ScalarValue]) -> Result<ScalarValue> {
    match args {
        [a, b] => Ok(ScalarValue::Boolean(
            a.compare(b) == Some(std::cmp::Ordering::Equal),
        )),
        _ => Err(PlanError::Execution("eq expects two arguments".to_string())),
    }
}

fn length(args: &[ScalarValue]) -> Result<ScalarValue> {
    match args {
        [ScalarValue::Null] => Ok(ScalarValue::Null),
        [ScalarValue::Binary(b)] => Ok(ScalarValue::Int64(b.len() as i64)),
        [v] => Ok(ScalarValue::Int64(v.try_as_str()?.chars().count() as i64)),
        _ => Err(PlanError::Execution("length expects one argument".to_string())),
    }
}

fn concat(args: &[ScalarValue]) -> Result<ScalarValue> {
    let mut out = String::new();
    for arg in args {
        if !arg.is_null() {
            out.push_str(&arg.to_string());
        }
    }
    Ok(ScalarValue::Utf8(out))
}
