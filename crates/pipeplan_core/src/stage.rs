//! Executable stages emitted by the optimizer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::NodeId;
use crate::hash_set::HashSetName;
use crate::logical::{AtomicComputation, SetIdentifier};

/// Identifier for a stage.
///
/// Allocated from a single counter per optimization pass. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl StageId {
    pub const fn next(self) -> StageId {
        StageId(self.0 + 1)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical algorithm used to realize a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmKind {
    StraightPipeline,
    BroadcastJoin,
    ShuffledHashJoin,
    Aggregation,
    ShuffleSet,
}

impl AlgorithmKind {
    pub const fn name(&self) -> &'static str {
        match self {
            AlgorithmKind::StraightPipeline => "StraightPipeline",
            AlgorithmKind::BroadcastJoin => "BroadcastJoin",
            AlgorithmKind::ShuffledHashJoin => "ShuffledHashJoin",
            AlgorithmKind::Aggregation => "Aggregation",
            AlgorithmKind::ShuffleSet => "ShuffleSet",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Side of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    pub const fn other(self) -> JoinSide {
        match self {
            JoinSide::Left => JoinSide::Right,
            JoinSide::Right => JoinSide::Left,
        }
    }

    /// Index of this side in a join computation's inputs.
    pub const fn input_idx(self) -> usize {
        match self {
            JoinSide::Left => 0,
            JoinSide::Right => 1,
        }
    }
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinSide::Left => write!(f, "left"),
            JoinSide::Right => write!(f, "right"),
        }
    }
}

/// Set a stage reads from. Each worker reads its own partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSource {
    pub set: SetIdentifier,
    pub columns: Vec<String>,
}

/// Hash set read by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashSetRef {
    /// Hash set built on the same worker from its partition of the build side.
    Local(HashSetName),
    /// Parts shipped by every worker of the build stage. The probe reads all of
    /// them.
    Broadcast(HashSetName),
}

impl HashSetRef {
    pub const fn name(&self) -> HashSetName {
        match self {
            HashSetRef::Local(name) | HashSetRef::Broadcast(name) => *name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeStep {
    pub hash_set: HashSetRef,
    /// The join computation being realized.
    pub join: AtomicComputation,
    /// Side the hash set was built from. Input batches come from the other
    /// side.
    pub build_side: JoinSide,
}

/// One operator in a stage's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageStep {
    /// Streaming computation (apply, method, hoist, filter).
    Compute(AtomicComputation),
    Probe(ProbeStep),
    Aggregate(AtomicComputation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageSink {
    /// Write rows into the worker's partition of a set.
    Materialize { set: SetIdentifier },
    /// Hash partition rows by key across all workers.
    Repartition {
        set: SetIdentifier,
        keys: Vec<String>,
    },
    /// Build a hash set from this worker's rows and ship it to every worker.
    BroadcastHashSet {
        name: HashSetName,
        keys: Vec<String>,
        columns: Vec<String>,
    },
    /// Build a hash set kept on this worker.
    LocalHashSet {
        name: HashSetName,
        keys: Vec<String>,
        columns: Vec<String>,
    },
}

/// A schedulable unit of physical execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub algorithm: AlgorithmKind,
    /// Pipeline nodes realized (fully or partially) by this stage.
    pub nodes: Vec<NodeId>,
    /// Stages that must complete before this one starts. All smaller than
    /// `id`.
    pub dependencies: Vec<StageId>,
    pub source: StageSource,
    pub steps: Vec<StageStep>,
    pub sink: StageSink,
}

impl Stage {
    /// Set written by this stage, if any.
    pub fn output_set(&self) -> Option<&SetIdentifier> {
        match &self.sink {
            StageSink::Materialize { set } | StageSink::Repartition { set, .. } => Some(set),
            StageSink::BroadcastHashSet { .. } | StageSink::LocalHashSet { .. } => None,
        }
    }

    /// Hash set built by this stage, if any.
    pub fn built_hash_set(&self) -> Option<HashSetName> {
        match &self.sink {
            StageSink::BroadcastHashSet { name, .. } | StageSink::LocalHashSet { name, .. } => {
                Some(*name)
            }
            _ => None,
        }
    }

    /// Hash sets probed by this stage.
    pub fn probed_hash_sets(&self) -> impl Iterator<Item = HashSetRef> + '_ {
        self.steps.iter().filter_map(|step| match step {
            StageStep::Probe(probe) => Some(probe.hash_set),
            _ => None,
        })
    }

    /// Computations executed by this stage's steps, in order.
    pub fn computations(&self) -> impl Iterator<Item = &AtomicComputation> + '_ {
        self.steps.iter().map(|step| match step {
            StageStep::Compute(comp) | StageStep::Aggregate(comp) => comp,
            StageStep::Probe(probe) => &probe.join,
        })
    }
}
