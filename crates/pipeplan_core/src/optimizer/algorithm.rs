use std::collections::HashMap;
use std::fmt;

use pipeplan_error::{Result, internal};
use serde::Serialize;

use crate::graph::{NodeId, PipelineNodeGraph};
use crate::hash_set::HashSetName;
use crate::logical::{AtomicComputation, SetIdentifier, TupleSpec};
use crate::stage::{
    AlgorithmKind,
    HashSetRef,
    JoinSide,
    ProbeStep,
    Stage,
    StageId,
    StageSink,
    StageSource,
    StageStep,
};

/// How an algorithm reads one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputSource {
    /// Run the unexecuted straight node inline, streaming its output.
    Stream(NodeId),
    /// Read the materialized output of an executed node.
    Materialized(NodeId),
}

impl InputSource {
    pub const fn node(&self) -> NodeId {
        match self {
            InputSource::Stream(id) | InputSource::Materialized(id) => *id,
        }
    }
}

/// A physical algorithm selected for part of the pipeline node graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhysicalAlgorithm {
    /// Run a straight node and materialize its output.
    StraightPipeline { node: NodeId },
    /// Build a hash set from one side, ship it to every worker, probe with the
    /// other side.
    BroadcastJoin {
        join: NodeId,
        left: InputSource,
        right: InputSource,
        build: JoinSide,
    },
    /// Repartition both sides on the join key, build and probe locally.
    ShuffledHashJoin {
        join: NodeId,
        left: InputSource,
        right: InputSource,
        build: JoinSide,
    },
    /// Repartition on the group key, aggregate each partition.
    Aggregation { node: NodeId, input: InputSource },
    /// Repartition the input on the partition keys.
    ShuffleSet { node: NodeId, input: InputSource },
}

/// Read-only state an algorithm generates stages from.
#[derive(Debug)]
pub struct GenerateContext<'a> {
    pub graph: &'a PipelineNodeGraph,
    /// Stage that materialized each intermediate set.
    pub producers: &'a HashMap<SetIdentifier, StageId>,
    pub job_id: &'a str,
}

/// Stages generated by an algorithm along with the nodes they realize.
///
/// The graph is not touched during generation. The caller claims and marks
/// the nodes once generation succeeds.
#[derive(Debug, Clone)]
pub struct Generated {
    pub stages: Vec<Stage>,
    /// Each realized node and the stage realizing it.
    pub claims: Vec<(NodeId, StageId)>,
    pub next_stage_id: StageId,
}

impl Generated {
    pub fn claimed_nodes(&self) -> Vec<NodeId> {
        self.claims.iter().map(|(node, _)| *node).collect()
    }
}

/// Source, leading steps, and streamed node for one input of an algorithm.
#[derive(Debug)]
struct InputPipeline {
    source: StageSource,
    steps: Vec<StageStep>,
    /// Columns after the steps run.
    output_columns: Vec<String>,
    streamed: Option<NodeId>,
    dependencies: Vec<StageId>,
}

/// Allocates stage ids and records which stage realizes each node.
#[derive(Debug)]
struct StageBuilder {
    kind: AlgorithmKind,
    next: StageId,
    stages: Vec<Stage>,
    claims: Vec<(NodeId, StageId)>,
}

impl StageBuilder {
    fn new(kind: AlgorithmKind, next: StageId) -> Self {
        StageBuilder {
            kind,
            next,
            stages: Vec::new(),
            claims: Vec::new(),
        }
    }

    fn allocate(&mut self) -> StageId {
        let id = self.next;
        self.next = id.next();
        id
    }

    fn push(
        &mut self,
        id: StageId,
        nodes: &[NodeId],
        mut dependencies: Vec<StageId>,
        source: StageSource,
        steps: Vec<StageStep>,
        sink: StageSink,
    ) {
        dependencies.sort();
        dependencies.dedup();
        self.claims.extend(nodes.iter().map(|node| (*node, id)));
        self.stages.push(Stage {
            id,
            algorithm: self.kind,
            nodes: nodes.to_vec(),
            dependencies,
            source,
            steps,
            sink,
        });
    }

    fn finish(self) -> Generated {
        Generated {
            stages: self.stages,
            claims: self.claims,
            next_stage_id: self.next,
        }
    }
}

impl PhysicalAlgorithm {
    pub const fn kind(&self) -> AlgorithmKind {
        match self {
            PhysicalAlgorithm::StraightPipeline { .. } => AlgorithmKind::StraightPipeline,
            PhysicalAlgorithm::BroadcastJoin { .. } => AlgorithmKind::BroadcastJoin,
            PhysicalAlgorithm::ShuffledHashJoin { .. } => AlgorithmKind::ShuffledHashJoin,
            PhysicalAlgorithm::Aggregation { .. } => AlgorithmKind::Aggregation,
            PhysicalAlgorithm::ShuffleSet { .. } => AlgorithmKind::ShuffleSet,
        }
    }

    /// Generate stages for this algorithm, allocating ids from `next`.
    pub fn generate(&self, ctx: &GenerateContext, next: StageId) -> Result<Generated> {
        let mut builder = StageBuilder::new(self.kind(), next);

        match *self {
            PhysicalAlgorithm::StraightPipeline { node } => {
                let input = input_pipeline(ctx, InputSource::Stream(node))?;
                let output_set = ctx.graph.node(node)?.output_set.clone();
                let id = builder.allocate();
                builder.push(
                    id,
                    &[node],
                    input.dependencies,
                    input.source,
                    input.steps,
                    StageSink::Materialize { set: output_set },
                );
            }
            PhysicalAlgorithm::BroadcastJoin {
                join,
                left,
                right,
                build,
            } => {
                let (build_input, probe_input) = sides(build, left, right);
                let join_comp = ctx.graph.node(join)?.blocking_computation()?;
                let build_spec = side_spec(join_comp, build)?;
                let build_pipe = input_pipeline(ctx, build_input)?;
                let probe_pipe = input_pipeline(ctx, probe_input)?;

                let build_id = builder.allocate();
                let name = HashSetName::new(build_id, join);
                builder.push(
                    build_id,
                    &build_pipe.streamed.into_iter().collect::<Vec<_>>(),
                    build_pipe.dependencies,
                    build_pipe.source,
                    build_pipe.steps,
                    StageSink::BroadcastHashSet {
                        name,
                        keys: build_spec.apply_to.clone(),
                        columns: build_spec.columns.clone(),
                    },
                );

                let probe_id = builder.allocate();
                let continuation = ctx.graph.fusable_continuation(join);
                let (tail_steps, output_set) = continuation_tail(ctx, join, continuation)?;
                let mut steps = probe_pipe.steps;
                steps.push(StageStep::Probe(ProbeStep {
                    hash_set: HashSetRef::Broadcast(name),
                    join: join_comp.clone(),
                    build_side: build,
                }));
                steps.extend(tail_steps);

                let mut nodes: Vec<NodeId> = probe_pipe.streamed.into_iter().collect();
                nodes.push(join);
                nodes.extend(continuation);
                let mut dependencies = probe_pipe.dependencies;
                dependencies.push(build_id);
                builder.push(
                    probe_id,
                    &nodes,
                    dependencies,
                    probe_pipe.source,
                    steps,
                    StageSink::Materialize { set: output_set },
                );
            }
            PhysicalAlgorithm::ShuffledHashJoin {
                join,
                left,
                right,
                build,
            } => {
                let (build_input, probe_input) = sides(build, left, right);
                let join_comp = ctx.graph.node(join)?.blocking_computation()?;
                let build_spec = side_spec(join_comp, build)?;
                let probe_spec = side_spec(join_comp, build.other())?;
                let build_pipe = input_pipeline(ctx, build_input)?;
                let probe_pipe = input_pipeline(ctx, probe_input)?;

                let build_set = repartition_set(ctx, join_comp, build);
                let build_columns = build_pipe.output_columns.clone();
                let build_part_id = builder.allocate();
                builder.push(
                    build_part_id,
                    &build_pipe.streamed.into_iter().collect::<Vec<_>>(),
                    build_pipe.dependencies,
                    build_pipe.source,
                    build_pipe.steps,
                    StageSink::Repartition {
                        set: build_set.clone(),
                        keys: build_spec.apply_to.clone(),
                    },
                );

                let probe_set = repartition_set(ctx, join_comp, build.other());
                let probe_columns = probe_pipe.output_columns.clone();
                let probe_part_id = builder.allocate();
                builder.push(
                    probe_part_id,
                    &probe_pipe.streamed.into_iter().collect::<Vec<_>>(),
                    probe_pipe.dependencies,
                    probe_pipe.source,
                    probe_pipe.steps,
                    StageSink::Repartition {
                        set: probe_set.clone(),
                        keys: probe_spec.apply_to.clone(),
                    },
                );

                let build_id = builder.allocate();
                let name = HashSetName::new(build_id, join);
                builder.push(
                    build_id,
                    &[],
                    vec![build_part_id],
                    StageSource {
                        set: build_set,
                        columns: build_columns,
                    },
                    Vec::new(),
                    StageSink::LocalHashSet {
                        name,
                        keys: build_spec.apply_to.clone(),
                        columns: build_spec.columns.clone(),
                    },
                );

                let probe_id = builder.allocate();
                let continuation = ctx.graph.fusable_continuation(join);
                let (tail_steps, output_set) = continuation_tail(ctx, join, continuation)?;
                let mut steps = vec![StageStep::Probe(ProbeStep {
                    hash_set: HashSetRef::Local(name),
                    join: join_comp.clone(),
                    build_side: build,
                })];
                steps.extend(tail_steps);

                let mut nodes = vec![join];
                nodes.extend(continuation);
                builder.push(
                    probe_id,
                    &nodes,
                    vec![probe_part_id, build_id],
                    StageSource {
                        set: probe_set,
                        columns: probe_columns,
                    },
                    steps,
                    StageSink::Materialize { set: output_set },
                );
            }
            PhysicalAlgorithm::Aggregation { node, input } => {
                let agg_comp = ctx.graph.node(node)?.blocking_computation()?;
                let input_pipe = input_pipeline(ctx, input)?;
                let data_set = SetIdentifier::new(
                    ctx.job_id,
                    format!("{}_aggregationData", agg_comp.output.set_name),
                );

                let part_id = builder.allocate();
                let input_columns = input_pipe.output_columns.clone();
                builder.push(
                    part_id,
                    &input_pipe.streamed.into_iter().collect::<Vec<_>>(),
                    input_pipe.dependencies,
                    input_pipe.source,
                    input_pipe.steps,
                    StageSink::Repartition {
                        set: data_set.clone(),
                        keys: agg_comp.input()?.apply_to.clone(),
                    },
                );

                let agg_id = builder.allocate();
                let continuation = ctx.graph.fusable_continuation(node);
                let (tail_steps, output_set) = continuation_tail(ctx, node, continuation)?;
                let mut steps = vec![StageStep::Aggregate(agg_comp.clone())];
                steps.extend(tail_steps);

                let mut nodes = vec![node];
                nodes.extend(continuation);
                builder.push(
                    agg_id,
                    &nodes,
                    vec![part_id],
                    StageSource {
                        set: data_set,
                        columns: input_columns,
                    },
                    steps,
                    StageSink::Materialize { set: output_set },
                );
            }
            PhysicalAlgorithm::ShuffleSet { node, input } => {
                let partition = ctx.graph.node(node)?;
                let keys = partition.blocking_computation()?.input()?.apply_to.clone();
                let input_pipe = input_pipeline(ctx, input)?;

                let mut nodes: Vec<NodeId> = input_pipe.streamed.into_iter().collect();
                nodes.push(node);
                let id = builder.allocate();
                builder.push(
                    id,
                    &nodes,
                    input_pipe.dependencies,
                    input_pipe.source,
                    input_pipe.steps,
                    StageSink::Repartition {
                        set: partition.output_set.clone(),
                        keys,
                    },
                );
            }
        }

        Ok(builder.finish())
    }
}

impl fmt::Display for PhysicalAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalAlgorithm::StraightPipeline { node } => write!(f, "StraightPipeline({node})"),
            PhysicalAlgorithm::BroadcastJoin {
                join, build, ..
            } => write!(f, "BroadcastJoin({join}, build={build})"),
            PhysicalAlgorithm::ShuffledHashJoin {
                join, build, ..
            } => write!(f, "ShuffledHashJoin({join}, build={build})"),
            PhysicalAlgorithm::Aggregation { node, .. } => write!(f, "Aggregation({node})"),
            PhysicalAlgorithm::ShuffleSet { node, .. } => write!(f, "ShuffleSet({node})"),
        }
    }
}

/// Split inputs into (build, probe).
fn sides(build: JoinSide, left: InputSource, right: InputSource) -> (InputSource, InputSource) {
    match build {
        JoinSide::Left => (left, right),
        JoinSide::Right => (right, left),
    }
}

fn side_spec(join: &AtomicComputation, side: JoinSide) -> Result<&TupleSpec> {
    match side {
        JoinSide::Left => join.left_input(),
        JoinSide::Right => join.right_input(),
    }
}

fn repartition_set(ctx: &GenerateContext, join: &AtomicComputation, side: JoinSide) -> SetIdentifier {
    SetIdentifier::new(
        ctx.job_id,
        format!("{}_{side}_repartitionData", join.output.set_name),
    )
}

fn input_pipeline(ctx: &GenerateContext, input: InputSource) -> Result<InputPipeline> {
    let dependency = |set: &SetIdentifier| ctx.producers.get(set).copied();

    match input {
        InputSource::Stream(id) => {
            let source = ctx.graph.straight_source(id)?;
            let node = ctx.graph.node(id)?;
            Ok(InputPipeline {
                dependencies: dependency(&source.set).into_iter().collect(),
                steps: source
                    .steps
                    .iter()
                    .map(|comp| StageStep::Compute(comp.clone()))
                    .collect(),
                source: StageSource {
                    set: source.set,
                    columns: source.columns,
                },
                output_columns: node.output_columns.clone(),
                streamed: Some(id),
            })
        }
        InputSource::Materialized(id) => {
            let node = ctx.graph.node(id)?;
            if !node.is_executed() {
                return Err(internal!("input {id} read as materialized before execution"));
            }
            Ok(InputPipeline {
                dependencies: dependency(&node.output_set).into_iter().collect(),
                source: StageSource {
                    set: node.output_set.clone(),
                    columns: node.output_columns.clone(),
                },
                steps: Vec::new(),
                output_columns: node.output_columns.clone(),
                streamed: None,
            })
        }
    }
}

/// Steps of the fused continuation, and the set the final stage writes.
fn continuation_tail(
    ctx: &GenerateContext,
    blocking: NodeId,
    continuation: Option<NodeId>,
) -> Result<(Vec<StageStep>, SetIdentifier)> {
    match continuation {
        Some(id) => {
            let node = ctx.graph.node(id)?;
            let steps = node
                .computations
                .iter()
                .map(|comp| StageStep::Compute(comp.clone()))
                .collect();
            Ok((steps, node.output_set.clone()))
        }
        None => Ok((Vec::new(), ctx.graph.node(blocking)?.output_set.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::{AggregateFunction, PlanBuilder};

    fn set(name: &str) -> SetIdentifier {
        SetIdentifier::new("db", name)
    }

    /// n0: scan a, n1: scan b, n2: join, n3: write.
    fn join_graph() -> PipelineNodeGraph {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["a_id", "a_v"])
            .scan("b", set("b"), &["b_id"])
            .join("j", "a", &["a_id"], "b", &["b_id"])
            .write("out", "j", set("out"))
            .build()
            .unwrap();
        PipelineNodeGraph::build_from(&plan, "job").unwrap()
    }

    fn generate(graph: &PipelineNodeGraph, algorithm: PhysicalAlgorithm) -> Generated {
        let producers = HashMap::new();
        let ctx = GenerateContext {
            graph,
            producers: &producers,
            job_id: "job",
        };
        algorithm.generate(&ctx, StageId(5)).unwrap()
    }

    #[test]
    fn broadcast_two_stages() {
        let graph = join_graph();
        let generated = generate(
            &graph,
            PhysicalAlgorithm::BroadcastJoin {
                join: NodeId(2),
                left: InputSource::Stream(NodeId(0)),
                right: InputSource::Stream(NodeId(1)),
                build: JoinSide::Left,
            },
        );

        assert_eq!(StageId(7), generated.next_stage_id);
        let [build, probe] = generated.stages.as_slice() else {
            panic!("expected two stages");
        };
        assert_eq!(StageId(5), build.id);
        assert_eq!(set("a"), build.source.set);
        assert!(build.dependencies.is_empty());
        assert_eq!(
            Some(HashSetName::new(StageId(5), NodeId(2))),
            build.built_hash_set()
        );

        assert_eq!(vec![StageId(5)], probe.dependencies);
        assert_eq!(set("b"), probe.source.set);
        assert_eq!(Some(&set("out")), probe.output_set());
        assert_eq!(vec![NodeId(1), NodeId(2), NodeId(3)], probe.nodes);
        assert_eq!(
            vec![
                (NodeId(0), StageId(5)),
                (NodeId(1), StageId(6)),
                (NodeId(2), StageId(6)),
                (NodeId(3), StageId(6)),
            ],
            generated.claims
        );
    }

    #[test]
    fn shuffle_four_stages() {
        let graph = join_graph();
        let generated = generate(
            &graph,
            PhysicalAlgorithm::ShuffledHashJoin {
                join: NodeId(2),
                left: InputSource::Stream(NodeId(0)),
                right: InputSource::Stream(NodeId(1)),
                build: JoinSide::Right,
            },
        );

        let ids: Vec<_> = generated.stages.iter().map(|s| s.id.0).collect();
        assert_eq!(vec![5, 6, 7, 8], ids);
        assert_eq!(
            Some(&SetIdentifier::new("job", "j_right_repartitionData")),
            generated.stages[0].output_set()
        );
        assert_eq!(
            Some(&SetIdentifier::new("job", "j_left_repartitionData")),
            generated.stages[1].output_set()
        );
        assert_eq!(vec![StageId(5)], generated.stages[2].dependencies);
        assert_eq!(
            vec![StageId(6), StageId(7)],
            generated.stages[3].dependencies
        );
        assert_eq!(
            vec![NodeId(2), NodeId(3)],
            generated.stages[3].nodes
        );
    }

    #[test]
    fn aggregation_two_stages() {
        let plan = PlanBuilder::new()
            .scan("a", set("a"), &["g", "v"])
            .aggregate("agg", "a", &["g"], AggregateFunction::Sum, Some("v"), "s")
            .build()
            .unwrap();
        let graph = PipelineNodeGraph::build_from(&plan, "job").unwrap();
        let generated = generate(
            &graph,
            PhysicalAlgorithm::Aggregation {
                node: NodeId(1),
                input: InputSource::Stream(NodeId(0)),
            },
        );

        assert_eq!(2, generated.stages.len());
        assert_eq!(
            Some(&SetIdentifier::new("job", "agg_aggregationData")),
            generated.stages[0].output_set()
        );
        assert_eq!(
            Some(&SetIdentifier::new("job", "agg")),
            generated.stages[1].output_set()
        );
    }

    #[test]
    fn materialized_input_requires_execution() {
        let graph = join_graph();
        let producers = HashMap::new();
        let ctx = GenerateContext {
            graph: &graph,
            producers: &producers,
            job_id: "job",
        };
        PhysicalAlgorithm::BroadcastJoin {
            join: NodeId(2),
            left: InputSource::Materialized(NodeId(0)),
            right: InputSource::Stream(NodeId(1)),
            build: JoinSide::Left,
        }
        .generate(&ctx, StageId(0))
        .unwrap_err();
    }
}
