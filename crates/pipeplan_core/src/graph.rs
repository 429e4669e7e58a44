//! Pipeline node graph.
//!
//! Groups the atomic computations of a logical plan into pipeline nodes that
//! can each run as a single streaming pass, and tracks which nodes have been
//! realized by a stage.

use std::collections::HashMap;
use std::fmt;

use pipeplan_error::{PlanError, Result, internal, malformed};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::logical::{AtomicComputation, ComputationKind, LogicalPlan, SetIdentifier};
use crate::stage::{AlgorithmKind, StageId};

/// Identifier for a pipeline node. Ordered by plan declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineNodeKind {
    /// A scan or a continuation followed by streaming computations.
    Straight,
    /// A single join computation.
    Join,
    /// A single aggregate computation.
    Aggregation,
    /// A single partition computation.
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unexecuted,
    /// Claimed by an algorithm, stage not yet recorded.
    Claimed { algorithm: AlgorithmKind },
    Executed { stage: StageId },
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: NodeId,
    pub kind: PipelineNodeKind,
    /// Computations fused into this node, in order.
    pub computations: Vec<AtomicComputation>,
    pub input_sets: Vec<SetIdentifier>,
    /// Set holding the node's output once materialized.
    pub output_set: SetIdentifier,
    pub output_columns: Vec<String>,
    /// Producing nodes. A join lists its left then right producer.
    pub producers: Vec<NodeId>,
    /// Consumer edges. A self join appears twice.
    pub consumers: Vec<NodeId>,
    /// Node writing the set this node scans. Must execute before this node
    /// but is not a data edge.
    pub writer: Option<NodeId>,
    state: NodeState,
}

impl PipelineNode {
    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.state, NodeState::Executed { .. })
    }

    pub fn is_unexecuted(&self) -> bool {
        matches!(self.state, NodeState::Unexecuted)
    }

    pub fn executed_stage(&self) -> Option<StageId> {
        match self.state {
            NodeState::Executed { stage } => Some(stage),
            _ => None,
        }
    }

    /// The scanned set if this node starts with a scan.
    pub fn scanned_set(&self) -> Option<&SetIdentifier> {
        match self.computations.first().map(|c| &c.kind) {
            Some(ComputationKind::ScanSet { set }) => Some(set),
            _ => None,
        }
    }

    /// Nodes that must execute before this one.
    pub fn upstream(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.producers.iter().copied().chain(self.writer)
    }

    pub fn last_computation(&self) -> Result<&AtomicComputation> {
        self.computations
            .last()
            .ok_or_else(|| internal!("pipeline node {} has no computations", self.id))
    }

    /// The single computation of a join, aggregation, or partition node.
    pub fn blocking_computation(&self) -> Result<&AtomicComputation> {
        match (self.kind, self.computations.as_slice()) {
            (
                PipelineNodeKind::Join | PipelineNodeKind::Aggregation | PipelineNodeKind::Partition,
                [comp],
            ) => Ok(comp),
            _ => Err(internal!(
                "pipeline node {} is not a blocking node",
                self.id
            )),
        }
    }
}

/// Where a straight node reads from and the computations it runs.
#[derive(Debug, Clone)]
pub struct StraightSource<'a> {
    pub set: SetIdentifier,
    pub columns: Vec<String>,
    /// Computations to run, excluding a leading scan.
    pub steps: &'a [AtomicComputation],
    /// Producer read from, none for scans.
    pub producer: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct PipelineNodeGraph {
    nodes: Vec<PipelineNode>,
}

impl PipelineNodeGraph {
    /// Build the graph from a logical plan.
    ///
    /// Streaming computations are fused into their producer's node when the
    /// producer is the last computation of a straight node and has no other
    /// consumer. Joins, aggregations, and partitions always start a new node.
    /// Writes end a node.
    ///
    /// Intermediate outputs are named within `job_id`.
    pub fn build_from(plan: &LogicalPlan, job_id: &str) -> Result<Self> {
        let comps = plan.computations();
        let edges = plan.consumer_edges();

        let mut nodes: Vec<PipelineNode> = Vec::new();
        // Computation idx -> node idx.
        let mut node_of: Vec<usize> = Vec::with_capacity(comps.len());
        // Node idx -> idx of its last computation.
        let mut last_of: Vec<usize> = Vec::new();

        for (idx, comp) in comps.iter().enumerate() {
            let producers = comp
                .inputs
                .iter()
                .map(|input| {
                    plan.producer_index(&input.set_name)
                        .filter(|&p| p < idx)
                        .ok_or_else(|| {
                            malformed!(
                                "computation '{}' references undefined tuple set '{}'",
                                comp.name,
                                input.set_name
                            )
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            let fuse_into = match (&comp.kind, producers.as_slice()) {
                (kind, &[producer])
                    if kind.is_streaming() || matches!(kind, ComputationKind::WriteSet { .. }) =>
                {
                    let node_idx = node_of[producer];
                    let fusable = nodes[node_idx].kind == PipelineNodeKind::Straight
                        && last_of[node_idx] == producer
                        && edges[producer].len() == 1
                        && !matches!(comps[producer].kind, ComputationKind::WriteSet { .. });
                    fusable.then_some(node_idx)
                }
                _ => None,
            };

            match fuse_into {
                Some(node_idx) => {
                    nodes[node_idx].computations.push(comp.clone());
                    last_of[node_idx] = idx;
                    node_of.push(node_idx);
                }
                None => {
                    let kind = match comp.kind {
                        ComputationKind::Join => PipelineNodeKind::Join,
                        ComputationKind::Aggregate => PipelineNodeKind::Aggregation,
                        ComputationKind::Partition => PipelineNodeKind::Partition,
                        _ => PipelineNodeKind::Straight,
                    };
                    let id = NodeId(nodes.len());
                    nodes.push(PipelineNode {
                        id,
                        kind,
                        computations: vec![comp.clone()],
                        input_sets: Vec::new(),
                        output_set: SetIdentifier::new(job_id, &comp.output.set_name),
                        output_columns: Vec::new(),
                        producers: producers.iter().map(|&p| NodeId(node_of[p])).collect(),
                        consumers: Vec::new(),
                        writer: None,
                        state: NodeState::Unexecuted,
                    });
                    last_of.push(idx);
                    node_of.push(id.0);
                }
            }
        }

        for idx in 0..nodes.len() {
            let last = nodes[idx].last_computation()?.clone();
            nodes[idx].output_set = match &last.kind {
                ComputationKind::WriteSet { set } => set.clone(),
                _ => SetIdentifier::new(job_id, &last.output.set_name),
            };
            nodes[idx].output_columns = last.output.columns.clone();

            let producers = nodes[idx].producers.clone();
            for producer in &producers {
                nodes[producer.0].consumers.push(NodeId(idx));
            }
        }

        for idx in 0..nodes.len() {
            let input_sets = match nodes[idx].scanned_set() {
                Some(set) => vec![set.clone()],
                None => nodes[idx]
                    .producers
                    .iter()
                    .map(|p| nodes[p.0].output_set.clone())
                    .collect(),
            };
            nodes[idx].input_sets = input_sets;
        }

        let mut writers: HashMap<SetIdentifier, NodeId> = HashMap::new();
        for node in &nodes {
            if let ComputationKind::WriteSet { set } = &node.last_computation()?.kind
                && let Some(other) = writers.insert(set.clone(), node.id)
            {
                return Err(malformed!(
                    "set '{set}' is written by both {other} and {}",
                    node.id
                ));
            }
        }
        for node in &mut nodes {
            let writer = node.scanned_set().and_then(|set| writers.get(set)).copied();
            node.writer = writer;
        }
        check_execution_order(&nodes)?;

        trace!(num_nodes = nodes.len(), "built pipeline node graph");

        Ok(PipelineNodeGraph { nodes })
    }

    pub fn nodes(&self) -> &[PipelineNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&PipelineNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| internal!("missing pipeline node {id}"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_fully_executed(&self) -> bool {
        self.nodes.iter().all(|n| n.is_executed())
    }

    /// Unexecuted, unclaimed nodes whose producers and writer have all been
    /// executed, in declaration order.
    pub fn frontier(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_unexecuted())
            .filter(|n| n.upstream().all(|p| self.nodes[p.0].is_executed()))
            .map(|n| n.id)
            .collect()
    }

    /// Where a straight node reads from.
    pub fn straight_source(&self, id: NodeId) -> Result<StraightSource<'_>> {
        let node = self.node(id)?;
        if node.kind != PipelineNodeKind::Straight {
            return Err(internal!("pipeline node {id} is not a straight node"));
        }

        if let Some(set) = node.scanned_set() {
            let scan = &node.computations[0];
            return Ok(StraightSource {
                set: set.clone(),
                columns: scan.output.columns.clone(),
                steps: &node.computations[1..],
                producer: None,
            });
        }

        let producer = match node.producers.as_slice() {
            [producer] => self.node(*producer)?,
            other => {
                return Err(internal!(
                    "straight node {id} has {} producers",
                    other.len()
                ));
            }
        };

        Ok(StraightSource {
            set: producer.output_set.clone(),
            columns: producer.output_columns.clone(),
            steps: &node.computations,
            producer: Some(producer.id),
        })
    }

    /// The straight node fused after `id`, if `id` has exactly one consumer
    /// edge and that consumer is a straight node.
    pub fn fusable_continuation(&self, id: NodeId) -> Option<NodeId> {
        let node = self.nodes.get(id.0)?;
        match node.consumers.as_slice() {
            [consumer] => {
                let consumer = &self.nodes[consumer.0];
                (consumer.kind == PipelineNodeKind::Straight && consumer.is_unexecuted())
                    .then_some(consumer.id)
            }
            _ => None,
        }
    }

    /// Claim nodes for an algorithm. All or nothing.
    pub fn claim(&mut self, ids: &[NodeId], algorithm: AlgorithmKind) -> Result<()> {
        for (idx, id) in ids.iter().enumerate() {
            let node = self.node(*id)?;
            match node.state {
                NodeState::Unexecuted => (),
                NodeState::Claimed { algorithm: other } => {
                    return Err(PlanError::AlreadyClaimed {
                        node: id.0,
                        claimed_by: other.to_string(),
                    });
                }
                NodeState::Executed { stage } => {
                    return Err(PlanError::AlreadyClaimed {
                        node: id.0,
                        claimed_by: format!("stage {stage}"),
                    });
                }
            }
            if ids[..idx].contains(id) {
                return Err(PlanError::AlreadyClaimed {
                    node: id.0,
                    claimed_by: algorithm.to_string(),
                });
            }
        }

        for id in ids {
            self.nodes[id.0].state = NodeState::Claimed { algorithm };
        }

        Ok(())
    }

    /// Mark a node as executed by `stage`.
    ///
    /// Errors if the node was already executed.
    pub fn mark_executed(&mut self, id: NodeId, stage: StageId) -> Result<()> {
        self.mark_executed_all(&[(id, stage)])
    }

    /// Mark a set of nodes executed as one unit. Either all nodes transition or
    /// none do.
    pub fn mark_executed_all(&mut self, claims: &[(NodeId, StageId)]) -> Result<()> {
        for (idx, (id, stage)) in claims.iter().enumerate() {
            let node = self.node(*id)?;
            if let NodeState::Executed { stage: previous } = node.state {
                return Err(PlanError::AlreadyExecuted {
                    node: id.0,
                    stage: stage.0,
                    previous: previous.0,
                });
            }
            if let Some((_, previous)) = claims[..idx].iter().find(|(other, _)| other == id) {
                return Err(PlanError::AlreadyExecuted {
                    node: id.0,
                    stage: stage.0,
                    previous: previous.0,
                });
            }
        }

        for (id, stage) in claims {
            trace!(node = %id, stage = %stage, "marking node executed");
            self.nodes[id.0].state = NodeState::Executed { stage: *stage };
        }

        Ok(())
    }
}

/// Error if some node can never run because it scans a set written downstream
/// of itself.
fn check_execution_order(nodes: &[PipelineNode]) -> Result<()> {
    let mut ordered = vec![false; nodes.len()];
    loop {
        let mut progressed = false;
        for node in nodes {
            if !ordered[node.id.0] && node.upstream().all(|p| ordered[p.0]) {
                ordered[node.id.0] = true;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    match nodes.iter().find(|n| !ordered[n.id.0]) {
        Some(node) => Err(malformed!(
            "pipeline node {} can't run before the set it reads is written",
            node.id
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::PlanBuilder;

    fn set(name: &str) -> SetIdentifier {
        SetIdentifier::new("db", name)
    }

    fn join_plan() -> LogicalPlan {
        PlanBuilder::new()
            .scan("a", set("a"), &["a_id", "a_v"])
            .apply("a1", "a", &["a_v"], "a_flag", "is_big")
            .filter("a2", "a1", "a_flag")
            .scan("b", set("b"), &["b_id"])
            .join("j", "a2", &["a_id"], "b", &["b_id"])
            .apply("j1", "j", &["a_v"], "j_flag", "is_big")
            .write("out", "j1", set("out"))
            .build()
            .unwrap()
    }

    #[test]
    fn fuses_streaming_after_scan() {
        let graph = PipelineNodeGraph::build_from(&join_plan(), "job").unwrap();
        assert_eq!(4, graph.len());

        let a = graph.node(NodeId(0)).unwrap();
        assert_eq!(PipelineNodeKind::Straight, a.kind);
        assert_eq!(3, a.computations.len());
        assert_eq!(vec![set("a")], a.input_sets);
        assert_eq!(SetIdentifier::new("job", "a2"), a.output_set);

        let j = graph.node(NodeId(2)).unwrap();
        assert_eq!(PipelineNodeKind::Join, j.kind);
        assert_eq!(vec![NodeId(0), NodeId(1)], j.producers);
        assert_eq!(vec![NodeId(3)], j.consumers);

        let cont = graph.node(NodeId(3)).unwrap();
        assert_eq!(2, cont.computations.len());
        assert_eq!(set("out"), cont.output_set);
        assert_eq!(vec![SetIdentifier::new("job", "j")], cont.input_sets);
    }

    #[test]
    fn multiple_consumers_break_node() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id", "v"])
            .apply("b", "a", &["v"], "x", "f")
            .apply("c", "a", &["v"], "y", "f")
            .build()
            .unwrap();
        let graph = PipelineNodeGraph::build_from(&plan, "job").unwrap();
        assert_eq!(3, graph.len());
        assert_eq!(vec![NodeId(1), NodeId(2)], graph.node(NodeId(0)).unwrap().consumers);
    }

    #[test]
    fn frontier_follows_execution() {
        let mut graph = PipelineNodeGraph::build_from(&join_plan(), "job").unwrap();
        assert_eq!(vec![NodeId(0), NodeId(1)], graph.frontier());

        graph.mark_executed(NodeId(0), StageId(0)).unwrap();
        assert_eq!(vec![NodeId(1)], graph.frontier());

        graph.mark_executed(NodeId(1), StageId(1)).unwrap();
        assert_eq!(vec![NodeId(2)], graph.frontier());
    }

    #[test]
    fn mark_executed_twice_fails() {
        let mut graph = PipelineNodeGraph::build_from(&join_plan(), "job").unwrap();
        graph.mark_executed(NodeId(1), StageId(0)).unwrap();
        let err = graph.mark_executed(NodeId(1), StageId(1)).unwrap_err();
        assert!(matches!(
            err,
            PlanError::AlreadyExecuted {
                node: 1,
                stage: 1,
                previous: 0
            }
        ));
        assert!(!graph.frontier().contains(&NodeId(1)));
    }

    #[test]
    fn mark_executed_all_is_atomic() {
        let mut graph = PipelineNodeGraph::build_from(&join_plan(), "job").unwrap();
        graph.mark_executed(NodeId(1), StageId(0)).unwrap();

        let err = graph
            .mark_executed_all(&[(NodeId(0), StageId(1)), (NodeId(1), StageId(1))])
            .unwrap_err();
        assert!(matches!(err, PlanError::AlreadyExecuted { .. }));
        assert!(graph.node(NodeId(0)).unwrap().is_unexecuted());
    }

    #[test]
    fn claim_excludes_from_frontier() {
        let mut graph = PipelineNodeGraph::build_from(&join_plan(), "job").unwrap();
        graph
            .claim(&[NodeId(0)], AlgorithmKind::BroadcastJoin)
            .unwrap();
        assert_eq!(vec![NodeId(1)], graph.frontier());

        let err = graph
            .claim(&[NodeId(1), NodeId(0)], AlgorithmKind::ShuffledHashJoin)
            .unwrap_err();
        assert!(matches!(err, PlanError::AlreadyClaimed { node: 0, .. }));
        assert!(graph.node(NodeId(1)).unwrap().is_unexecuted());
    }

    #[test]
    fn continuation_of_join() {
        let graph = PipelineNodeGraph::build_from(&join_plan(), "job").unwrap();
        assert_eq!(Some(NodeId(3)), graph.fusable_continuation(NodeId(2)));
        assert_eq!(None, graph.fusable_continuation(NodeId(3)));

        let source = graph.straight_source(NodeId(3)).unwrap();
        assert_eq!(SetIdentifier::new("job", "j"), source.set);
        assert_eq!(2, source.steps.len());
        assert_eq!(Some(NodeId(2)), source.producer);

        let source = graph.straight_source(NodeId(0)).unwrap();
        assert_eq!(set("a"), source.set);
        assert_eq!(2, source.steps.len());
    }

    #[test]
    fn write_ends_node() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .write("w", "a", set("w"))
            .apply("b", "w", &["id"], "x", "f")
            .build()
            .unwrap();
        let graph = PipelineNodeGraph::build_from(&plan, "job").unwrap();
        assert_eq!(2, graph.len());
        assert_eq!(vec![set("w")], graph.node(NodeId(1)).unwrap().input_sets);
    }

    #[test]
    fn scan_waits_for_writer_of_set() {
        // Scan of w is declared before the node writing w.
        let plan = PlanBuilder::new()
            .scan("w", set("w"), &["id"])
            .write("out", "w", set("out"))
            .scan("a", set("a"), &["id"])
            .write("w_out", "a", set("w"))
            .build()
            .unwrap();
        let mut graph = PipelineNodeGraph::build_from(&plan, "job").unwrap();
        assert_eq!(2, graph.len());

        let reader = graph.node(NodeId(0)).unwrap();
        assert_eq!(Some(NodeId(1)), reader.writer);
        assert!(reader.producers.is_empty());
        assert!(graph.node(NodeId(1)).unwrap().consumers.is_empty());

        assert_eq!(vec![NodeId(1)], graph.frontier());
        graph.mark_executed(NodeId(1), StageId(0)).unwrap();
        assert_eq!(vec![NodeId(0)], graph.frontier());
    }

    #[test]
    fn scan_of_own_output_is_malformed() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .write("out", "a", set("a"))
            .build()
            .unwrap();
        let err = PipelineNodeGraph::build_from(&plan, "job").unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)), "{err}");
    }

    #[test]
    fn scan_feeding_its_own_writer_is_malformed() {
        // x is scanned, joined, and the join result is written back to x.
        let plan = PlanBuilder::new()
            .scan("x", set("x"), &["x_id"])
            .scan("b", set("b"), &["b_id"])
            .join("j", "x", &["x_id"], "b", &["b_id"])
            .write("out", "j", set("x"))
            .build()
            .unwrap();
        let err = PipelineNodeGraph::build_from(&plan, "job").unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)), "{err}");
    }

    #[test]
    fn set_written_twice_is_malformed() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .write("w1", "a", set("w"))
            .scan("b", set("b"), &["id"])
            .write("w2", "b", set("w"))
            .build()
            .unwrap();
        let err = PipelineNodeGraph::build_from(&plan, "job").unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)), "{err}");
    }

    #[test]
    fn partition_starts_node() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["id"])
            .partition("p", "a", &["id"])
            .apply("b", "p", &["id"], "x", "f")
            .build()
            .unwrap();
        let graph = PipelineNodeGraph::build_from(&plan, "job").unwrap();
        assert_eq!(3, graph.len());

        let partition = graph.node(NodeId(1)).unwrap();
        assert_eq!(PipelineNodeKind::Partition, partition.kind);
        assert_eq!(SetIdentifier::new("job", "p"), partition.output_set);
        partition.blocking_computation().unwrap();

        let source = graph.straight_source(NodeId(2)).unwrap();
        assert_eq!(SetIdentifier::new("job", "p"), source.set);
    }
}
