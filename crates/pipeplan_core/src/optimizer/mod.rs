//! Physical optimization.
//!
//! Repeatedly picks an algorithm for the next part of the pipeline node graph
//! and generates the stages realizing it until every node has been executed.

pub mod algorithm;
pub mod cost;
pub mod join_strategy;

use std::collections::HashMap;

use algorithm::{GenerateContext, InputSource, PhysicalAlgorithm};
use cost::CostOracle;
use join_strategy::{JoinStrategy, select_join_strategy};
use pipeplan_error::{Result, internal, malformed};
use tracing::{debug, info, warn};

use crate::config::execution::OptimizerConfig;
use crate::graph::{NodeId, PipelineNodeGraph, PipelineNodeKind};
use crate::logical::{ComputationKind, LogicalPlan, SetIdentifier};
use crate::stage::{AlgorithmKind, JoinSide, Stage, StageId, StageSink};

/// Output of a full optimization pass.
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    /// Stages in dependency order. Ids are increasing.
    pub stages: Vec<Stage>,
    /// The graph with every node executed.
    pub graph: PipelineNodeGraph,
    /// Algorithms in the order they were selected.
    pub algorithms: Vec<PhysicalAlgorithm>,
}

#[derive(Debug, Clone)]
pub struct PhysicalOptimizer {
    config: OptimizerConfig,
}

impl PhysicalOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        PhysicalOptimizer { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Produce the stages for a plan.
    pub fn run(&self, plan: &LogicalPlan, oracle: &dyn CostOracle) -> Result<Vec<Stage>> {
        Ok(self.optimize(plan, oracle)?.stages)
    }

    pub fn optimize(&self, plan: &LogicalPlan, oracle: &dyn CostOracle) -> Result<PhysicalPlan> {
        let graph = PipelineNodeGraph::build_from(plan, &self.config.job_id)?;
        let mut state = OptimizerState {
            graph,
            oracle,
            derived: HashMap::new(),
            producers: HashMap::new(),
            next_stage_id: StageId(0),
        };

        let mut stages = Vec::new();
        let mut algorithms = Vec::new();

        while !state.graph.is_fully_executed() {
            let algorithm = state.select(self.config.broadcast_threshold)?;
            debug!(%algorithm, "selected physical algorithm");

            let generated = {
                let ctx = GenerateContext {
                    graph: &state.graph,
                    producers: &state.producers,
                    job_id: &self.config.job_id,
                };
                algorithm.generate(&ctx, state.next_stage_id)?
            };

            if generated.claims.is_empty() {
                return Err(internal!("{algorithm} realized no pipeline nodes"));
            }

            state.derive_estimate(&algorithm, &generated.stages)?;

            state
                .graph
                .claim(&generated.claimed_nodes(), algorithm.kind())?;
            state.graph.mark_executed_all(&generated.claims)?;

            for stage in &generated.stages {
                if let Some(set) = stage.output_set() {
                    state.producers.insert(set.clone(), stage.id);
                }
            }

            info!(
                %algorithm,
                first_stage = %state.next_stage_id,
                num_stages = generated.stages.len(),
                "generated stages"
            );

            state.next_stage_id = generated.next_stage_id;
            stages.extend(generated.stages);
            algorithms.push(algorithm);
        }

        Ok(PhysicalPlan {
            stages,
            graph: state.graph,
            algorithms,
        })
    }
}

#[derive(Debug)]
enum Selection {
    Selected(PhysicalAlgorithm),
    Deferred,
}

struct OptimizerState<'a> {
    graph: PipelineNodeGraph,
    oracle: &'a dyn CostOracle,
    /// Estimates for sets materialized during this pass.
    derived: HashMap<SetIdentifier, u64>,
    /// Stage that wrote each intermediate set.
    producers: HashMap<SetIdentifier, StageId>,
    next_stage_id: StageId,
}

impl OptimizerState<'_> {
    fn estimate(&self, set: &SetIdentifier) -> Result<u64> {
        match self.derived.get(set) {
            Some(size) => Ok(*size),
            None => self.oracle.estimate_size(set),
        }
    }

    fn input_estimate(&self, input: InputSource) -> Result<u64> {
        match input {
            InputSource::Stream(id) => {
                let source = self.graph.straight_source(id)?;
                self.estimate(&source.set)
            }
            InputSource::Materialized(id) => self.estimate(&self.graph.node(id)?.output_set),
        }
    }

    /// Estimate for an input, `None` if the set's cardinality is unknown. Any
    /// other estimation error is returned.
    fn known_estimate(&self, input: InputSource) -> Result<Option<u64>> {
        match self.input_estimate(input) {
            Ok(size) => Ok(Some(size)),
            Err(e) if e.is_unknown_cardinality() => {
                debug!(node = %input.node(), error = %e, "no size estimate for join input");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Pick the algorithm for the first frontier node that can make progress.
    ///
    /// A streamable straight node feeding a join waits until the join's other
    /// side is ready, so both can be considered together. If every frontier
    /// node is waiting, the first one is materialized on its own.
    fn select(&self, threshold: u64) -> Result<PhysicalAlgorithm> {
        let frontier = self.graph.frontier();
        if frontier.is_empty() {
            return Err(malformed!(
                "no pipeline node can be executed, plan contains a cycle or unreachable nodes"
            ));
        }

        for id in &frontier {
            if let Selection::Selected(algorithm) = self.select_for(*id, &frontier, threshold)? {
                return Ok(algorithm);
            }
        }

        debug!(?frontier, "all frontier nodes waiting on join inputs, materializing first");
        Ok(PhysicalAlgorithm::StraightPipeline { node: frontier[0] })
    }

    fn select_for(&self, id: NodeId, frontier: &[NodeId], threshold: u64) -> Result<Selection> {
        let node = self.graph.node(id)?;

        match node.kind {
            PipelineNodeKind::Join => {
                let (left, right) = join_producers(node.producers.as_slice(), id)?;
                let algorithm = self.join_algorithm(
                    id,
                    InputSource::Materialized(left),
                    InputSource::Materialized(right),
                    threshold,
                )?;
                Ok(Selection::Selected(algorithm))
            }
            PipelineNodeKind::Aggregation => {
                let input = InputSource::Materialized(single_producer(&node.producers, id)?);
                Ok(Selection::Selected(PhysicalAlgorithm::Aggregation {
                    node: id,
                    input,
                }))
            }
            PipelineNodeKind::Partition => {
                let input = InputSource::Materialized(single_producer(&node.producers, id)?);
                Ok(Selection::Selected(PhysicalAlgorithm::ShuffleSet { node: id, input }))
            }
            PipelineNodeKind::Straight => {
                let straight = PhysicalAlgorithm::StraightPipeline { node: id };
                if !self.is_streamable(id)? {
                    return Ok(Selection::Selected(straight));
                }

                let consumer = match node.consumers.as_slice() {
                    [consumer] => self.graph.node(*consumer)?,
                    _ => return Ok(Selection::Selected(straight)),
                };

                match consumer.kind {
                    PipelineNodeKind::Aggregation => {
                        Ok(Selection::Selected(PhysicalAlgorithm::Aggregation {
                            node: consumer.id,
                            input: InputSource::Stream(id),
                        }))
                    }
                    PipelineNodeKind::Partition => {
                        Ok(Selection::Selected(PhysicalAlgorithm::ShuffleSet {
                            node: consumer.id,
                            input: InputSource::Stream(id),
                        }))
                    }
                    PipelineNodeKind::Join => {
                        let join = consumer.id;
                        let (left, right) = join_producers(consumer.producers.as_slice(), join)?;
                        let (side, other) = if left == id {
                            (JoinSide::Left, right)
                        } else {
                            (JoinSide::Right, left)
                        };

                        let other_input = match self.ready_input(other, join, frontier)? {
                            Some(input) => input,
                            None => return Ok(Selection::Deferred),
                        };

                        let (left, right) = match side {
                            JoinSide::Left => (InputSource::Stream(id), other_input),
                            JoinSide::Right => (other_input, InputSource::Stream(id)),
                        };
                        Ok(Selection::Selected(
                            self.join_algorithm(join, left, right, threshold)?,
                        ))
                    }
                    PipelineNodeKind::Straight => Ok(Selection::Selected(straight)),
                }
            }
        }
    }

    /// How the other side of a join can be read right now, if at all.
    fn ready_input(
        &self,
        other: NodeId,
        join: NodeId,
        frontier: &[NodeId],
    ) -> Result<Option<InputSource>> {
        let node = self.graph.node(other)?;
        if node.is_executed() {
            return Ok(Some(InputSource::Materialized(other)));
        }

        let streamable = frontier.contains(&other)
            && node.kind == PipelineNodeKind::Straight
            && node.consumers == [join]
            && self.is_streamable(other)?;

        Ok(streamable.then_some(InputSource::Stream(other)))
    }

    /// Straight nodes that don't end in a write can run inline in the stage
    /// consuming them.
    fn is_streamable(&self, id: NodeId) -> Result<bool> {
        let node = self.graph.node(id)?;
        Ok(node.kind == PipelineNodeKind::Straight
            && !matches!(
                node.last_computation()?.kind,
                ComputationKind::WriteSet { .. }
            ))
    }

    fn join_algorithm(
        &self,
        join: NodeId,
        left: InputSource,
        right: InputSource,
        threshold: u64,
    ) -> Result<PhysicalAlgorithm> {
        let strategy = match (self.known_estimate(left)?, self.known_estimate(right)?) {
            (Some(left_size), Some(right_size)) => {
                let strategy = select_join_strategy(left_size, right_size, threshold);
                debug!(%join, left_size, right_size, threshold, ?strategy, "selected join strategy");
                strategy
            }
            _ => {
                warn!(%join, "missing size estimate, falling back to shuffled hash join");
                JoinStrategy::Shuffle {
                    build: JoinSide::Left,
                }
            }
        };

        Ok(match strategy {
            JoinStrategy::Broadcast { build } => PhysicalAlgorithm::BroadcastJoin {
                join,
                left,
                right,
                build,
            },
            JoinStrategy::Shuffle { build } => PhysicalAlgorithm::ShuffledHashJoin {
                join,
                left,
                right,
                build,
            },
        })
    }

    /// Record size estimates for the sets an algorithm materializes.
    fn derive_estimate(&mut self, algorithm: &PhysicalAlgorithm, stages: &[Stage]) -> Result<()> {
        let estimate = match *algorithm {
            PhysicalAlgorithm::StraightPipeline { node } => {
                self.input_estimate(InputSource::Stream(node)).ok()
            }
            PhysicalAlgorithm::BroadcastJoin { left, right, .. }
            | PhysicalAlgorithm::ShuffledHashJoin { left, right, .. } => {
                match (self.input_estimate(left), self.input_estimate(right)) {
                    (Ok(left), Ok(right)) => Some(left.max(right)),
                    _ => None,
                }
            }
            PhysicalAlgorithm::Aggregation { input, .. }
            | PhysicalAlgorithm::ShuffleSet { input, .. } => self.input_estimate(input).ok(),
        };

        let Some(estimate) = estimate else {
            return Ok(());
        };

        for stage in stages {
            let set = match &stage.sink {
                StageSink::Materialize { set } => set,
                StageSink::Repartition { set, .. }
                    if stage.algorithm == AlgorithmKind::ShuffleSet =>
                {
                    set
                }
                _ => continue,
            };
            debug!(set = %set, estimate, "derived size estimate");
            self.derived.insert(set.clone(), estimate);
        }

        Ok(())
    }
}

fn single_producer(producers: &[NodeId], node: NodeId) -> Result<NodeId> {
    match producers {
        [producer] => Ok(*producer),
        other => Err(internal!("{node} has {} producers", other.len())),
    }
}

fn join_producers(producers: &[NodeId], join: NodeId) -> Result<(NodeId, NodeId)> {
    match producers {
        [left, right] => Ok((*left, *right)),
        other => Err(internal!("join {join} has {} producers", other.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::{AggregateFunction, PlanBuilder};
    use crate::optimizer::cost::StaticCostOracle;
    use crate::stage::StageStep;

    const MB: u64 = 1024 * 1024;

    fn set(name: &str) -> SetIdentifier {
        SetIdentifier::new("db", name)
    }

    fn optimizer() -> PhysicalOptimizer {
        PhysicalOptimizer::new(OptimizerConfig {
            job_id: "job".to_string(),
            broadcast_threshold: 50 * MB,
        })
    }

    fn join_plan() -> LogicalPlan {
        PlanBuilder::new()
            .scan("a", set("a"), &["a_id", "a_v"])
            .scan("b", set("b"), &["b_id", "b_v"])
            .join("j", "a", &["a_id"], "b", &["b_id"])
            .write("out", "j", set("out"))
            .build()
            .unwrap()
    }

    #[test]
    fn scan_and_write_single_stage() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["v"])
            .apply("a2", "a", &["v"], "len", "length")
            .write("out", "a2", set("out"))
            .build()
            .unwrap();
        let stages = optimizer()
            .run(&plan, &StaticCostOracle::new())
            .unwrap();

        assert_eq!(1, stages.len());
        assert_eq!(AlgorithmKind::StraightPipeline, stages[0].algorithm);
        assert_eq!(Some(&set("out")), stages[0].output_set());
        assert_eq!(2, stages[0].steps.len());
    }

    #[test]
    fn small_left_broadcast() {
        let oracle = StaticCostOracle::new()
            .with_size(&set("a"), 10 * MB)
            .with_size(&set("b"), 500 * MB);
        let plan = optimizer().optimize(&join_plan(), &oracle).unwrap();

        assert_eq!(2, plan.stages.len());
        assert!(plan.graph.is_fully_executed());
        assert_eq!(
            vec![PhysicalAlgorithm::BroadcastJoin {
                join: NodeId(2),
                left: InputSource::Stream(NodeId(0)),
                right: InputSource::Stream(NodeId(1)),
                build: JoinSide::Left,
            }],
            plan.algorithms
        );
        assert_eq!(set("a"), plan.stages[0].source.set);
    }

    #[test]
    fn unknown_cardinality_shuffles() {
        let oracle = StaticCostOracle::new().with_size(&set("a"), 10 * MB);
        let stages = optimizer().run(&join_plan(), &oracle).unwrap();

        assert_eq!(4, stages.len());
        assert!(
            stages
                .iter()
                .all(|s| s.algorithm == AlgorithmKind::ShuffledHashJoin)
        );
    }

    #[test]
    fn waits_for_other_join_side() {
        // The right side ends in a write so it's materialized first, then the
        // left side streams into the join.
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["a_id"])
            .scan("b", set("b"), &["b_id"])
            .write("b_copy", "b", set("b_copy"))
            .join("j", "a", &["a_id"], "b_copy", &["b_id"])
            .build()
            .unwrap();
        let oracle = StaticCostOracle::new()
            .with_size(&set("a"), 100 * MB)
            .with_size(&set("b"), 10 * MB);
        let plan = optimizer().optimize(&plan, &oracle).unwrap();

        assert_eq!(
            PhysicalAlgorithm::StraightPipeline { node: NodeId(1) },
            plan.algorithms[0]
        );
        assert_eq!(
            PhysicalAlgorithm::BroadcastJoin {
                join: NodeId(2),
                left: InputSource::Stream(NodeId(0)),
                right: InputSource::Materialized(NodeId(1)),
                build: JoinSide::Right,
            },
            plan.algorithms[1]
        );
        let build = &plan.stages[1];
        assert_eq!(vec![StageId(0)], build.dependencies);
        let probe = &plan.stages[2];
        assert_eq!(vec![StageId(1)], probe.dependencies);
    }

    #[test]
    fn aggregation_streams_input() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["g", "v"])
            .aggregate("agg", "a", &["g"], AggregateFunction::Sum, Some("v"), "s")
            .write("out", "agg", set("out"))
            .build()
            .unwrap();
        let stages = optimizer().run(&plan, &StaticCostOracle::new()).unwrap();

        assert_eq!(2, stages.len());
        assert!(matches!(stages[1].steps[0], StageStep::Aggregate(_)));
        assert_eq!(Some(&set("out")), stages[1].output_set());
    }

    #[test]
    fn join_output_estimate_is_max_of_inputs() {
        // Second join reads the first join's output, estimated at 30MB, and
        // c at 200MB. 30MB is under the threshold so it's broadcast.
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["a_id"])
            .scan("b", set("b"), &["b_id"])
            .join("j1", "a", &["a_id"], "b", &["b_id"])
            .scan("c", set("c"), &["c_id"])
            .join("j2", "j1", &["a_id"], "c", &["c_id"])
            .build()
            .unwrap();
        let oracle = StaticCostOracle::new()
            .with_size(&set("a"), 10 * MB)
            .with_size(&set("b"), 30 * MB)
            .with_size(&set("c"), 200 * MB);
        let plan = optimizer().optimize(&plan, &oracle).unwrap();

        let last = plan.algorithms.last().unwrap();
        assert!(matches!(
            last,
            PhysicalAlgorithm::BroadcastJoin {
                build: JoinSide::Left,
                ..
            }
        ));
    }

    #[test]
    fn oracle_error_other_than_cardinality_propagates() {
        struct Broken;
        impl CostOracle for Broken {
            fn estimate_size(&self, _set: &SetIdentifier) -> Result<u64> {
                Err(internal!("oracle unavailable"))
            }
        }

        let err = optimizer().run(&join_plan(), &Broken).unwrap_err();
        assert!(matches!(err, pipeplan_error::PlanError::Internal(_)));
    }

    #[test]
    fn oracle_error_on_one_side_not_hidden_by_unknown_other_side() {
        // Left estimate fails outright, right has no estimate.
        struct Partial;
        impl CostOracle for Partial {
            fn estimate_size(&self, set: &SetIdentifier) -> Result<u64> {
                if set.set == "a" {
                    Err(internal!("oracle unavailable"))
                } else {
                    Err(pipeplan_error::PlanError::UnknownCardinality {
                        set: set.to_string(),
                    })
                }
            }
        }

        let err = optimizer().run(&join_plan(), &Partial).unwrap_err();
        assert!(matches!(err, pipeplan_error::PlanError::Internal(_)), "{err}");

        // Same with the sides swapped.
        let plan = PlanBuilder::new()
            .scan("b", set("b"), &["b_id"])
            .scan("a", set("a"), &["a_id"])
            .join("j", "b", &["b_id"], "a", &["a_id"])
            .build()
            .unwrap();
        let err = optimizer().run(&plan, &Partial).unwrap_err();
        assert!(matches!(err, pipeplan_error::PlanError::Internal(_)), "{err}");
    }

    #[test]
    fn partition_streams_input() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["g", "v"])
            .apply("a2", "a", &["v"], "len", "length")
            .partition("p", "a2", &["g"])
            .write("out", "p", set("out"))
            .build()
            .unwrap();
        let oracle = StaticCostOracle::new().with_size(&set("a"), 7 * MB);
        let mut plan = optimizer().optimize(&plan, &oracle).unwrap();

        assert_eq!(
            vec![
                PhysicalAlgorithm::ShuffleSet {
                    node: NodeId(1),
                    input: InputSource::Stream(NodeId(0)),
                },
                PhysicalAlgorithm::StraightPipeline { node: NodeId(2) },
            ],
            plan.algorithms
        );

        let write = plan.stages.pop().unwrap();
        let shuffle = plan.stages.pop().unwrap();
        assert_eq!(AlgorithmKind::ShuffleSet, shuffle.algorithm);
        assert_eq!(1, shuffle.steps.len());
        assert_eq!(
            StageSink::Repartition {
                set: SetIdentifier::new("job", "p"),
                keys: vec!["g".to_string()],
            },
            shuffle.sink
        );
        assert_eq!(SetIdentifier::new("job", "p"), write.source.set);
        assert_eq!(vec![shuffle.id], write.dependencies);
    }
}
