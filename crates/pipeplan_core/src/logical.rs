//! Logical plan input.
//!
//! A logical plan is a DAG of atomic computations over named tuple sets. Plans
//! are produced externally (usually deserialized from json) and are read-only
//! once validated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use pipeplan_error::{PlanError, Result, malformed};
use serde::{Deserialize, Serialize};

/// Identifies a persisted or intermediate dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetIdentifier {
    pub database: String,
    pub set: String,
}

impl SetIdentifier {
    pub fn new(database: impl Into<String>, set: impl Into<String>) -> Self {
        SetIdentifier {
            database: database.into(),
            set: set.into(),
        }
    }
}

impl fmt::Display for SetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.database, self.set)
    }
}

/// Names a tuple set along with the columns retained from it and the columns a
/// computation is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleSpec {
    pub set_name: String,
    pub columns: Vec<String>,
    /// Columns the computation reads. For joins and partitions these are the
    /// key columns, for filters the single boolean predicate column.
    #[serde(default)]
    pub apply_to: Vec<String>,
}

impl TupleSpec {
    pub fn new<S: AsRef<str>>(set_name: impl Into<String>, columns: &[S]) -> Self {
        TupleSpec {
            set_name: set_name.into(),
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            apply_to: Vec::new(),
        }
    }

    pub fn with_apply_to<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.apply_to = columns.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }
}

impl fmt::Display for TupleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.set_name, self.columns.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ComputationKind {
    /// Read a stored set.
    ScanSet { set: SetIdentifier },
    /// Write the input to a stored set.
    WriteSet { set: SetIdentifier },
    /// Apply a registered lambda, appending its result as a new column.
    ApplyLambda,
    /// Call a method on the input, appending the result.
    ApplyMethod,
    /// Pull an attribute out of the input, appending it.
    HoistAttribute,
    /// Keep rows where the predicate column is true.
    Filter,
    /// Equi-join two tuple sets.
    Join,
    /// Group by the key columns and compute a single aggregate.
    Aggregate,
    /// Redistribute the input across workers by hashing the key columns.
    Partition,
}

impl ComputationKind {
    /// Streaming computations can be fused with their producer.
    pub const fn is_streaming(&self) -> bool {
        matches!(
            self,
            ComputationKind::ApplyLambda
                | ComputationKind::ApplyMethod
                | ComputationKind::HoistAttribute
                | ComputationKind::Filter
        )
    }

    /// Blocking computations always start a new pipeline node.
    pub const fn is_blocking(&self) -> bool {
        matches!(
            self,
            ComputationKind::Join | ComputationKind::Aggregate | ComputationKind::Partition
        )
    }

    pub const fn expected_inputs(&self) -> usize {
        match self {
            ComputationKind::ScanSet { .. } => 0,
            ComputationKind::Join => 2,
            _ => 1,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            ComputationKind::ScanSet { .. } => "SCAN",
            ComputationKind::WriteSet { .. } => "OUTPUT",
            ComputationKind::ApplyLambda => "APPLY",
            ComputationKind::ApplyMethod => "METHOD",
            ComputationKind::HoistAttribute => "HOIST",
            ComputationKind::Filter => "FILTER",
            ComputationKind::Join => "JOIN",
            ComputationKind::Aggregate => "AGGREGATE",
            ComputationKind::Partition => "PARTITION",
        }
    }
}

/// Aggregate functions supported by aggregate computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
}

impl AggregateFunction {
    pub const fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// If this function reads a value column.
    pub const fn needs_value(&self) -> bool {
        !matches!(self, AggregateFunction::Count)
    }
}

impl FromStr for AggregateFunction {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "count" => AggregateFunction::Count,
            "sum" => AggregateFunction::Sum,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            other => return Err(malformed!("unknown aggregate function '{other}'")),
        })
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parameter holding the lambda name for `ApplyLambda`.
pub const PARAM_LAMBDA: &str = "lambda";
/// Parameter holding the method name for `ApplyMethod`.
pub const PARAM_METHOD: &str = "method";
/// Parameter holding the attribute name for `HoistAttribute`.
pub const PARAM_ATTRIBUTE: &str = "attribute";
/// Parameter holding the aggregate function name.
pub const PARAM_AGGREGATE: &str = "aggregate";
/// Parameter holding the column an aggregate reads.
pub const PARAM_VALUE: &str = "value";

/// A single logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicComputation {
    /// Name of the computation, informational.
    pub name: String,
    #[serde(flatten)]
    pub kind: ComputationKind,
    /// Inputs, in order. Joins have a left and right input.
    #[serde(default)]
    pub inputs: Vec<TupleSpec>,
    pub output: TupleSpec,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl AtomicComputation {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn required_param(&self, key: &str) -> Result<&str> {
        self.param(key).ok_or_else(|| {
            malformed!(
                "computation '{}' producing '{}' missing parameter '{key}'",
                self.name,
                self.output.set_name
            )
        })
    }

    /// Get the only input of a single input computation.
    pub fn input(&self) -> Result<&TupleSpec> {
        match self.inputs.as_slice() {
            [input] => Ok(input),
            other => Err(malformed!(
                "computation '{}' expected a single input, has {}",
                self.name,
                other.len()
            )),
        }
    }

    pub fn left_input(&self) -> Result<&TupleSpec> {
        self.join_inputs().map(|(left, _)| left)
    }

    pub fn right_input(&self) -> Result<&TupleSpec> {
        self.join_inputs().map(|(_, right)| right)
    }

    fn join_inputs(&self) -> Result<(&TupleSpec, &TupleSpec)> {
        match self.inputs.as_slice() {
            [left, right] => Ok((left, right)),
            other => Err(malformed!(
                "join '{}' expected two inputs, has {}",
                self.name,
                other.len()
            )),
        }
    }

    pub fn aggregate_function(&self) -> Result<AggregateFunction> {
        self.required_param(PARAM_AGGREGATE)?.parse()
    }

    /// Name of the function applied by apply, method, and hoist computations.
    pub fn function_name(&self) -> Result<&str> {
        match self.kind {
            ComputationKind::ApplyLambda => self.required_param(PARAM_LAMBDA),
            ComputationKind::ApplyMethod => self.required_param(PARAM_METHOD),
            ComputationKind::HoistAttribute => self.required_param(PARAM_ATTRIBUTE),
            _ => Err(malformed!(
                "computation '{}' of kind {} does not apply a function",
                self.name,
                self.kind.name()
            )),
        }
    }
}

impl fmt::Display for AtomicComputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <= {}(", self.output, self.kind.name())?;
        for (idx, input) in self.inputs.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{input}")?;
        }
        match &self.kind {
            ComputationKind::ScanSet { set } | ComputationKind::WriteSet { set } => {
                if !self.inputs.is_empty() {
                    write!(f, ", ")?;
                }
                write!(f, "'{set}'")?;
            }
            _ => (),
        }
        write!(f, ", '{}')", self.name)
    }
}

/// An immutable, validated DAG of atomic computations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalPlan {
    computations: Vec<AtomicComputation>,
    #[serde(skip)]
    by_output: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct PlanFile {
    computations: Vec<AtomicComputation>,
}

impl LogicalPlan {
    /// Validate and create a plan.
    ///
    /// Computations must be declared after the computations producing their
    /// inputs.
    pub fn try_new(computations: Vec<AtomicComputation>) -> Result<Self> {
        let mut by_output: HashMap<String, usize> = HashMap::with_capacity(computations.len());

        for (idx, comp) in computations.iter().enumerate() {
            validate_computation(comp, &computations, &by_output)?;
            if by_output.insert(comp.output.set_name.clone(), idx).is_some() {
                return Err(malformed!(
                    "tuple set '{}' is produced more than once",
                    comp.output.set_name
                ));
            }
        }

        Ok(LogicalPlan {
            computations,
            by_output,
        })
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let file: PlanFile = serde_json::from_str(s)?;
        Self::try_new(file.computations)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// All computations in declaration order.
    pub fn computations(&self) -> &[AtomicComputation] {
        &self.computations
    }

    pub fn computation_by_output_name(&self, name: &str) -> Option<&AtomicComputation> {
        self.by_output.get(name).map(|&idx| &self.computations[idx])
    }

    /// Index of the computation producing `name`.
    pub fn producer_index(&self, name: &str) -> Option<usize> {
        self.by_output.get(name).copied()
    }

    /// Consumer edges for every computation.
    ///
    /// A computation reading the same tuple set twice (a self join) has two
    /// edges.
    pub fn consumer_edges(&self) -> Vec<Vec<usize>> {
        let mut consumers = vec![Vec::new(); self.computations.len()];
        for (idx, comp) in self.computations.iter().enumerate() {
            for input in &comp.inputs {
                if let Some(&producer) = self.by_output.get(&input.set_name) {
                    consumers[producer].push(idx);
                }
            }
        }
        consumers
    }
}

fn validate_computation(
    comp: &AtomicComputation,
    computations: &[AtomicComputation],
    by_output: &HashMap<String, usize>,
) -> Result<()> {
    if comp.output.set_name.is_empty() {
        return Err(malformed!("computation '{}' has no output set name", comp.name));
    }
    ensure_unique_columns(&comp.output)?;

    if comp.inputs.len() != comp.kind.expected_inputs() {
        return Err(malformed!(
            "{} computation '{}' expects {} inputs, got {}",
            comp.kind.name(),
            comp.name,
            comp.kind.expected_inputs(),
            comp.inputs.len()
        ));
    }

    for input in &comp.inputs {
        let producer = by_output.get(&input.set_name).ok_or_else(|| {
            malformed!(
                "computation '{}' references undefined tuple set '{}'",
                comp.name,
                input.set_name
            )
        })?;
        let available = &computations[*producer].output.columns;
        for col in input.columns.iter().chain(&input.apply_to) {
            if !available.contains(col) {
                return Err(malformed!(
                    "column '{col}' is not available in tuple set '{}'",
                    input.set_name
                ));
            }
        }
    }

    let out_len = comp.output.columns.len();
    match &comp.kind {
        ComputationKind::ScanSet { .. } => (),
        ComputationKind::WriteSet { .. } => {
            let input = comp.input()?;
            expect_width(comp, input.columns.len())?;
        }
        ComputationKind::ApplyLambda
        | ComputationKind::ApplyMethod
        | ComputationKind::HoistAttribute => {
            comp.function_name()?;
            let input = comp.input()?;
            if input.apply_to.is_empty() {
                return Err(malformed!(
                    "computation '{}' is not applied to any columns",
                    comp.name
                ));
            }
            expect_width(comp, input.columns.len() + 1)?;
        }
        ComputationKind::Filter => {
            let input = comp.input()?;
            if input.apply_to.len() != 1 {
                return Err(malformed!(
                    "filter '{}' needs exactly one predicate column",
                    comp.name
                ));
            }
            expect_width(comp, input.columns.len())?;
        }
        ComputationKind::Join => {
            let left = comp.left_input()?;
            let right = comp.right_input()?;
            if left.apply_to.is_empty() || left.apply_to.len() != right.apply_to.len() {
                return Err(malformed!(
                    "join '{}' has mismatched key columns: {} vs {}",
                    comp.name,
                    left.apply_to.len(),
                    right.apply_to.len()
                ));
            }
            expect_width(comp, left.columns.len() + right.columns.len())?;
        }
        ComputationKind::Aggregate => {
            let input = comp.input()?;
            let func = comp.aggregate_function()?;
            if func.needs_value() {
                let value = comp.required_param(PARAM_VALUE)?;
                let producer = &computations[by_output[&input.set_name]];
                if !producer.output.columns.iter().any(|c| c == value) {
                    return Err(malformed!(
                        "aggregate '{}' value column '{value}' is not available in '{}'",
                        comp.name,
                        input.set_name
                    ));
                }
            }
            expect_width(comp, input.apply_to.len() + 1)?;
        }
        ComputationKind::Partition => {
            let input = comp.input()?;
            if input.apply_to.is_empty() {
                return Err(malformed!("partition '{}' has no key columns", comp.name));
            }
            expect_width(comp, input.columns.len())?;
        }
    }

    if out_len == 0 && !matches!(comp.kind, ComputationKind::ScanSet { .. }) {
        return Err(malformed!("computation '{}' produces no columns", comp.name));
    }

    Ok(())
}

fn expect_width(comp: &AtomicComputation, expected: usize) -> Result<()> {
    if comp.output.columns.len() != expected {
        return Err(malformed!(
            "computation '{}' should produce {expected} columns, declares {}",
            comp.name,
            comp.output.columns.len()
        ));
    }
    Ok(())
}

fn ensure_unique_columns(spec: &TupleSpec) -> Result<()> {
    let mut seen = HashSet::with_capacity(spec.columns.len());
    for col in &spec.columns {
        if !seen.insert(col.as_str()) {
            return Err(malformed!(
                "duplicate column '{col}' in tuple set '{}'",
                spec.set_name
            ));
        }
    }
    Ok(())
}

/// Incrementally builds a logical plan.
///
/// Input projections retain every column of the producer, which covers most
/// plans written by hand.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    computations: Vec<AtomicComputation>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(mut self, output: &str, set: SetIdentifier, columns: &[&str]) -> Self {
        self.computations.push(AtomicComputation {
            name: format!("scan_{output}"),
            kind: ComputationKind::ScanSet { set },
            inputs: Vec::new(),
            output: TupleSpec::new(output, columns),
            params: BTreeMap::new(),
        });
        self
    }

    pub fn apply(
        self,
        output: &str,
        input: &str,
        apply_to: &[&str],
        column: &str,
        lambda: &str,
    ) -> Self {
        self.function(
            ComputationKind::ApplyLambda,
            PARAM_LAMBDA,
            output,
            input,
            apply_to,
            column,
            lambda,
        )
    }

    pub fn method(
        self,
        output: &str,
        input: &str,
        apply_to: &[&str],
        column: &str,
        method: &str,
    ) -> Self {
        self.function(
            ComputationKind::ApplyMethod,
            PARAM_METHOD,
            output,
            input,
            apply_to,
            column,
            method,
        )
    }

    pub fn hoist(
        self,
        output: &str,
        input: &str,
        apply_to: &[&str],
        column: &str,
        attribute: &str,
    ) -> Self {
        self.function(
            ComputationKind::HoistAttribute,
            PARAM_ATTRIBUTE,
            output,
            input,
            apply_to,
            column,
            attribute,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn function(
        mut self,
        kind: ComputationKind,
        param: &str,
        output: &str,
        input: &str,
        apply_to: &[&str],
        column: &str,
        function: &str,
    ) -> Self {
        let columns = self.columns_of(input);
        let mut out_cols = columns.clone();
        out_cols.push(column.to_string());

        self.computations.push(AtomicComputation {
            name: format!("{}_{output}", kind.name().to_lowercase()),
            kind,
            inputs: vec![TupleSpec::new(input, &columns).with_apply_to(apply_to)],
            output: TupleSpec::new(output, &out_cols),
            params: BTreeMap::from([(param.to_string(), function.to_string())]),
        });
        self
    }

    /// Filter on a boolean column. The predicate column is dropped from the
    /// output.
    pub fn filter(mut self, output: &str, input: &str, predicate: &str) -> Self {
        let columns: Vec<String> = self
            .columns_of(input)
            .into_iter()
            .filter(|c| c != predicate)
            .collect();

        self.computations.push(AtomicComputation {
            name: format!("filter_{output}"),
            kind: ComputationKind::Filter,
            inputs: vec![TupleSpec::new(input, &columns).with_apply_to(&[predicate])],
            output: TupleSpec::new(output, &columns),
            params: BTreeMap::new(),
        });
        self
    }

    pub fn join(
        mut self,
        output: &str,
        left: &str,
        left_keys: &[&str],
        right: &str,
        right_keys: &[&str],
    ) -> Self {
        let left_cols = self.columns_of(left);
        let right_cols = self.columns_of(right);
        let out_cols: Vec<String> = left_cols.iter().chain(&right_cols).cloned().collect();

        self.computations.push(AtomicComputation {
            name: format!("join_{output}"),
            kind: ComputationKind::Join,
            inputs: vec![
                TupleSpec::new(left, &left_cols).with_apply_to(left_keys),
                TupleSpec::new(right, &right_cols).with_apply_to(right_keys),
            ],
            output: TupleSpec::new(output, &out_cols),
            params: BTreeMap::new(),
        });
        self
    }

    pub fn aggregate(
        mut self,
        output: &str,
        input: &str,
        keys: &[&str],
        function: AggregateFunction,
        value: Option<&str>,
        column: &str,
    ) -> Self {
        let columns = self.columns_of(input);
        let mut out_cols: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        out_cols.push(column.to_string());

        let mut params = BTreeMap::from([(
            PARAM_AGGREGATE.to_string(),
            function.name().to_string(),
        )]);
        if let Some(value) = value {
            params.insert(PARAM_VALUE.to_string(), value.to_string());
        }

        self.computations.push(AtomicComputation {
            name: format!("aggregate_{output}"),
            kind: ComputationKind::Aggregate,
            inputs: vec![TupleSpec::new(input, &columns).with_apply_to(keys)],
            output: TupleSpec::new(output, &out_cols),
            params,
        });
        self
    }

    /// Repartition the input on `keys`, keeping every column.
    pub fn partition(mut self, output: &str, input: &str, keys: &[&str]) -> Self {
        let columns = self.columns_of(input);
        self.computations.push(AtomicComputation {
            name: format!("partition_{output}"),
            kind: ComputationKind::Partition,
            inputs: vec![TupleSpec::new(input, &columns).with_apply_to(keys)],
            output: TupleSpec::new(output, &columns),
            params: BTreeMap::new(),
        });
        self
    }

    pub fn write(mut self, output: &str, input: &str, set: SetIdentifier) -> Self {
        let columns = self.columns_of(input);
        self.computations.push(AtomicComputation {
            name: format!("write_{output}"),
            kind: ComputationKind::WriteSet { set },
            inputs: vec![TupleSpec::new(input, &columns)],
            output: TupleSpec::new(output, &columns),
            params: BTreeMap::new(),
        });
        self
    }

    /// Push an arbitrary computation.
    pub fn push(mut self, computation: AtomicComputation) -> Self {
        self.computations.push(computation);
        self
    }

    pub fn build(self) -> Result<LogicalPlan> {
        LogicalPlan::try_new(self.computations)
    }

    fn columns_of(&self, set_name: &str) -> Vec<String> {
        self.computations
            .iter()
            .find(|c| c.output.set_name == set_name)
            .map(|c| c.output.columns.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(name: &str) -> SetIdentifier {
        SetIdentifier::new("db", name)
    }

    #[test]
    fn build_simple_plan() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id", "v"])
            .apply("a1", "a", &["v"], "is_big", "is_big")
            .filter("a2", "a1", "is_big")
            .write("out", "a2", set("out"))
            .build()
            .unwrap();

        assert_eq!(4, plan.computations().len());
        let filter = plan.computation_by_output_name("a2").unwrap();
        assert_eq!(ComputationKind::Filter, filter.kind);
        assert_eq!(vec!["id", "v"], filter.output.columns);
        assert!(plan.computation_by_output_name("missing").is_none());
    }

    #[test]
    fn undefined_tuple_set_is_malformed() {
        let err = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .filter("b", "nope", "id")
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)), "{err}");
    }

    #[test]
    fn duplicate_output_is_malformed() {
        let err = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .scan("a", set("b"), &["id"])
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)));
    }

    #[test]
    fn apply_to_must_be_available() {
        let err = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .apply("b", "a", &["missing"], "x", "f")
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)));
    }

    #[test]
    fn join_key_mismatch_is_malformed() {
        let err = PlanBuilder::new()
            .scan("a", set("a"), &["a_id"])
            .scan("b", set("b"), &["b_id", "b_x"])
            .join("j", "a", &["a_id"], "b", &["b_id", "b_x"])
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)));
    }

    #[test]
    fn self_join_has_two_edges() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .push(AtomicComputation {
                name: "self".to_string(),
                kind: ComputationKind::Join,
                inputs: vec![
                    TupleSpec::new("a", &["id"]).with_apply_to(&["id"]),
                    TupleSpec::new("a", &["id"]).with_apply_to(&["id"]),
                ],
                output: TupleSpec::new("j", &["l_id", "r_id"]),
                params: BTreeMap::new(),
            })
            .build()
            .unwrap();

        assert_eq!(vec![vec![1, 1], vec![]], plan.consumer_edges());
    }

    #[test]
    fn plan_from_json() {
        let json = r#"{
            "computations": [
                {
                    "name": "scan_a",
                    "op": "scan_set",
                    "set": {"database": "db", "set": "a"},
                    "output": {"set_name": "a", "columns": ["id", "v"]}
                },
                {
                    "name": "agg",
                    "op": "aggregate",
                    "inputs": [{"set_name": "a", "columns": ["id", "v"], "apply_to": ["id"]}],
                    "output": {"set_name": "b", "columns": ["id", "total"]},
                    "params": {"aggregate": "sum", "value": "v"}
                }
            ]
        }"#;

        let plan = LogicalPlan::from_json(json).unwrap();
        let agg = plan.computation_by_output_name("b").unwrap();
        assert_eq!(AggregateFunction::Sum, agg.aggregate_function().unwrap());
        assert_eq!(
            ComputationKind::ScanSet { set: set("a") },
            plan.computations()[0].kind
        );
    }

    #[test]
    fn unknown_aggregate_is_malformed() {
        let err = "median".parse::<AggregateFunction>().unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)));
    }

    #[test]
    fn partition_needs_keys() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id", "v"])
            .partition("p", "a", &["id"])
            .build()
            .unwrap();
        let partition = plan.computation_by_output_name("p").unwrap();
        assert!(partition.kind.is_blocking());
        assert_eq!(vec!["id", "v"], partition.output.columns);

        let err = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .partition("p", "a", &[])
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)), "{err}");
    }
}
