//! Explain output for generated stages.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use pipeplan_error::Result;
use serde::{Deserialize, Serialize};

use crate::stage::{HashSetRef, Stage, StageSink, StageStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainFormat {
    Text,
    Json,
}

/// A single line of explain output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainEntry {
    pub name: String,
    /// Btree for consistent ordering.
    pub items: BTreeMap<String, String>,
}

impl ExplainEntry {
    pub fn new(name: impl Into<String>) -> Self {
        ExplainEntry {
            name: name.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.items.insert(key.into(), value.to_string());
        self
    }

    pub fn with_values<S: fmt::Display>(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let values: Vec<_> = values.into_iter().map(|v| v.to_string()).collect();
        self.items
            .insert(key.into(), format!("[{}]", values.join(", ")));
        self
    }
}

impl fmt::Display for ExplainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.items.is_empty() {
            write!(f, " (")?;
            for (idx, (k, v)) in self.items.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k} = {v}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

pub fn format_stages(stages: &[Stage], format: ExplainFormat) -> Result<String> {
    match format {
        ExplainFormat::Text => Ok(explain_stages(stages)),
        ExplainFormat::Json => explain_json(stages),
    }
}

/// Render stages as indented text, one block per stage with the source on top
/// and the sink at the bottom.
pub fn explain_stages(stages: &[Stage]) -> String {
    let mut buf = String::new();
    for stage in stages {
        // Writing to a string can't fail.
        let _ = writeln!(buf, "{}", stage_entry(stage));
        let _ = writeln!(
            buf,
            "  {}",
            ExplainEntry::new("Source")
                .with_value("set", &stage.source.set)
                .with_values("columns", &stage.source.columns)
        );
        for step in &stage.steps {
            let _ = writeln!(buf, "  {}", step_entry(step));
        }
        let _ = writeln!(buf, "  {}", sink_entry(&stage.sink));
    }
    buf
}

pub fn explain_json(stages: &[Stage]) -> Result<String> {
    Ok(serde_json::to_string_pretty(stages)?)
}

fn stage_entry(stage: &Stage) -> ExplainEntry {
    ExplainEntry::new(format!("Stage {}", stage.id))
        .with_value("algorithm", stage.algorithm)
        .with_values("dependencies", &stage.dependencies)
        .with_values("nodes", &stage.nodes)
}

fn step_entry(step: &StageStep) -> ExplainEntry {
    match step {
        StageStep::Compute(comp) => ExplainEntry::new(comp.kind.name())
            .with_value("output", &comp.output.set_name)
            .with_values("apply_to", comp.inputs.iter().flat_map(|i| &i.apply_to))
            .with_values(
                "params",
                comp.params.iter().map(|(k, v)| format!("{k}={v}")),
            ),
        StageStep::Probe(probe) => {
            let (kind, name) = match probe.hash_set {
                HashSetRef::Local(name) => ("local", name),
                HashSetRef::Broadcast(name) => ("broadcast", name),
            };
            ExplainEntry::new("HashProbe")
                .with_value("hash_set", name)
                .with_value("kind", kind)
                .with_value("build_side", probe.build_side)
                .with_value("output", &probe.join.output.set_name)
        }
        StageStep::Aggregate(comp) => ExplainEntry::new("HashAggregate")
            .with_value("output", &comp.output.set_name)
            .with_values("keys", comp.inputs.iter().flat_map(|i| &i.apply_to))
            .with_values(
                "params",
                comp.params.iter().map(|(k, v)| format!("{k}={v}")),
            ),
    }
}

fn sink_entry(sink: &StageSink) -> ExplainEntry {
    match sink {
        StageSink::Materialize { set } => ExplainEntry::new("Materialize").with_value("set", set),
        StageSink::Repartition { set, keys } => ExplainEntry::new("Repartition")
            .with_value("set", set)
            .with_values("keys", keys),
        StageSink::BroadcastHashSet { name, keys, .. } => ExplainEntry::new("BroadcastHashSet")
            .with_value("name", name)
            .with_values("keys", keys),
        StageSink::LocalHashSet { name, keys, .. } => ExplainEntry::new("LocalHashSet")
            .with_value("name", name)
            .with_values("keys", keys),
    }
}
