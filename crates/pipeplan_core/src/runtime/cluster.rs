use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pipeplan_error::{PlanError, Result, internal};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::transport::{LocalTransport, Transport};
use super::worker::Worker;
use crate::config::execution::ExecutionConfig;
use crate::execution::context::ExecutionContext;
use crate::execution::functions::FunctionRegistry;
use crate::execution::pipeline::{ExecutablePipeline, PipelineOutcome};
use crate::execution::scalar::Row;
use crate::execution::storage::MemorySetStore;
use crate::logical::SetIdentifier;
use crate::partition::PartitionPolicy;
use crate::stage::{AlgorithmKind, Stage, StageId, StageSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    Completed,
    /// Completed, but some records failed and were skipped.
    Degraded { record_errors: u64 },
}

/// Result of a stage across all workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: StageId,
    pub algorithm: AlgorithmKind,
    pub status: StageStatus,
    pub rows_read: u64,
    pub rows_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    /// Reports in execution order.
    pub reports: Vec<StageReport>,
}

impl ExecutionSummary {
    pub fn report(&self, stage: StageId) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }

    pub fn is_degraded(&self) -> bool {
        self.reports
            .iter()
            .any(|r| matches!(r.status, StageStatus::Degraded { .. }))
    }
}

/// A fixed set of in-process workers executing stages in dependency order.
///
/// Each stage runs on every worker, with worker `i` reading partition `i` of
/// the stage's source set. Stages whose dependencies have completed run
/// together on the worker pool.
pub struct Cluster {
    config: ExecutionConfig,
    workers: Vec<Worker>,
    store: MemorySetStore,
    transport: Arc<dyn Transport>,
    functions: Arc<FunctionRegistry>,
    pool: ThreadPool,
    ingestion: Mutex<PartitionPolicy>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .field("num_workers", &self.workers.len())
            .field("num_threads", &self.pool.current_num_threads())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn try_new(config: ExecutionConfig, functions: FunctionRegistry) -> Result<Self> {
        let num_workers = config.partitions.max(1);
        let workers: Vec<_> = (0..num_workers).map(Worker::new).collect();
        let transport = LocalTransport::new(workers.iter().map(|w| w.hash_sets.clone()).collect());

        let pool = ThreadPoolBuilder::new()
            .thread_name(|idx| format!("pipeplan-worker-{idx}"))
            .num_threads(config.threads.max(1))
            .build()
            .map_err(|e| internal!("failed to build worker pool: {e}"))?;
        let ingestion = PartitionPolicy::try_new(config.ingestion_policy, config.seed)?;

        info!(
            workers = num_workers,
            threads = pool.current_num_threads(),
            ingestion = %ingestion.kind(),
            "created cluster"
        );

        Ok(Cluster {
            config,
            workers,
            store: MemorySetStore::new(num_workers),
            transport: Arc::new(transport),
            functions: Arc::new(functions),
            pool,
            ingestion: Mutex::new(ingestion),
        })
    }

    /// Replace the transport used between workers.
    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = transport;
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, id: usize) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn store(&self) -> &MemorySetStore {
        &self.store
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Load an input set, dispatching rows to workers with the ingestion
    /// policy. `key_columns` are only used by the hash policy.
    pub fn load_set(
        &self,
        set: &SetIdentifier,
        columns: Vec<String>,
        rows: Vec<Row>,
        key_columns: &[usize],
    ) -> Result<()> {
        let mut policy = self.ingestion.lock();
        self.store.load(set, columns, rows, &mut policy, key_columns)
    }

    /// Execute stages in dependency order.
    ///
    /// The first failure, in stage then worker order, is returned and no stage
    /// depending on it is started.
    pub fn execute(&self, stages: &[Stage]) -> Result<ExecutionSummary> {
        let ids: HashSet<StageId> = stages.iter().map(|s| s.id).collect();
        if ids.len() != stages.len() {
            return Err(internal!("duplicate stage ids"));
        }
        for stage in stages {
            if let Some(dep) = stage.dependencies.iter().find(|d| !ids.contains(d)) {
                return Err(internal!(
                    "stage {} depends on stage {dep} which is not being executed",
                    stage.id
                ));
            }
        }

        let mut remaining: Vec<&Stage> = stages.iter().collect();
        remaining.sort_by_key(|s| s.id);
        let mut completed: BTreeSet<StageId> = BTreeSet::new();
        let mut summary = ExecutionSummary::default();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<&Stage>, Vec<&Stage>) = remaining
                .into_iter()
                .partition(|s| s.dependencies.iter().all(|d| completed.contains(d)));
            if ready.is_empty() {
                let waiting: Vec<_> = rest.iter().map(|s| s.id.0).collect();
                return Err(internal!(
                    "stages {waiting:?} have dependencies that can never complete"
                ));
            }
            remaining = rest;

            let wave: Vec<_> = ready.iter().map(|s| s.id.0).collect();
            debug!(stages = ?wave, "executing wave");

            for (stage, outcomes) in ready.iter().zip(self.execute_wave(&ready)?) {
                let report = Self::report(stage, &outcomes);
                if let StageStatus::Degraded { record_errors } = report.status {
                    warn!(stage = %stage.id, record_errors, "stage completed with record errors");
                }
                info!(
                    stage = %stage.id,
                    algorithm = %stage.algorithm,
                    rows_read = report.rows_read,
                    rows_written = report.rows_written,
                    "stage completed"
                );
                summary.reports.push(report);
                completed.insert(stage.id);
            }
        }

        Ok(summary)
    }

    /// Run every stage in the wave on every worker. Returns per worker outcomes
    /// for each stage in wave order.
    fn execute_wave(&self, stages: &[&Stage]) -> Result<Vec<Vec<PipelineOutcome>>> {
        let tasks: Vec<(usize, &Worker)> = (0..stages.len())
            .flat_map(|idx| self.workers.iter().map(move |w| (idx, w)))
            .collect();

        let results: Vec<Result<PipelineOutcome>> = self.pool.install(|| {
            tasks
                .par_iter()
                .map(|(idx, worker)| self.execute_on_worker(stages[*idx], worker))
                .collect()
        });

        let mut outcomes = vec![Vec::with_capacity(self.workers.len()); stages.len()];
        for ((idx, worker), result) in tasks.iter().zip(results) {
            match result {
                Ok(outcome) => outcomes[*idx].push(outcome),
                Err(err) => {
                    let stage = stages[*idx].id;
                    error!(%stage, worker = worker.id, %err, "stage failed");
                    return Err(PlanError::StageFailed {
                        stage: stage.0,
                        worker: worker.id,
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(outcomes)
    }

    fn execute_on_worker(&self, stage: &Stage, worker: &Worker) -> Result<PipelineOutcome> {
        let stage = self.transport.send_stage(worker.id, stage)?;

        let ctx = ExecutionContext {
            stage: stage.id,
            worker: worker.id,
            num_workers: self.workers.len(),
            batch_size: self.config.batch_size.max(1),
            tolerate_record_errors: self.config.tolerate_record_errors,
            hash_sets: &worker.hash_sets,
            store: &self.store,
            transport: self.transport.as_ref(),
            functions: &self.functions,
        };
        let mut pipeline = ExecutablePipeline::try_from_stage(&stage, &self.functions)?;
        pipeline.execute(&ctx)
    }

    fn report(stage: &Stage, outcomes: &[PipelineOutcome]) -> StageReport {
        let record_errors: u64 = outcomes.iter().map(|o| o.record_errors).sum();
        StageReport {
            stage: stage.id,
            algorithm: stage.algorithm,
            status: if record_errors > 0 {
                StageStatus::Degraded { record_errors }
            } else {
                StageStatus::Completed
            },
            rows_read: outcomes.iter().map(|o| o.rows_read).sum(),
            rows_written: outcomes.iter().map(|o| o.rows_written).sum(),
        }
    }

    /// Remove hash sets and repartitioned intermediates created by the stages.
    ///
    /// Returns the number of hash sets removed across all workers.
    pub fn teardown(&self, stages: &[Stage]) -> usize {
        let mut removed = 0;
        for stage in stages {
            if let Some(name) = stage.built_hash_set() {
                for worker in &self.workers {
                    removed += worker.hash_sets.remove_all(&name);
                }
            }
            // A shuffle set's output is a plan node read by later jobs.
            if let StageSink::Repartition { set, .. } = &stage.sink
                && stage.algorithm != AlgorithmKind::ShuffleSet
            {
                self.store.remove(set);
            }
        }
        debug!(removed, "tore down stages");
        removed
    }

    /// Approximate hash set memory held by each worker.
    pub fn hash_set_memory(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|w| w.hash_sets.total_size())
            .collect()
    }
}
