use pipeplan_error::Result;
use tracing::debug;

use super::{Sink, project};
use crate::execution::batch::Batch;
use crate::execution::context::ExecutionContext;
use crate::execution::scalar::encode_join_key;
use crate::hash_set::{HashSetName, JoinHashSet};

/// Where a built hash set goes once complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSetTarget {
    /// Register with the executing worker's manager.
    Local,
    /// Ship a part to every worker, including this one.
    Broadcast,
}

/// Builds a join hash set from the build side of a join.
///
/// Rows with a null key never match and are not inserted.
#[derive(Debug)]
pub struct HashBuildSink {
    name: HashSetName,
    target: HashSetTarget,
    keys: Vec<usize>,
    projection: Vec<usize>,
    table: JoinHashSet,
    rows_written: u64,
}

impl HashBuildSink {
    pub fn new(
        name: HashSetName,
        target: HashSetTarget,
        keys: Vec<usize>,
        projection: Vec<usize>,
    ) -> Self {
        HashBuildSink {
            name,
            target,
            keys,
            projection,
            table: JoinHashSet::new(),
            rows_written: 0,
        }
    }
}

impl Sink for HashBuildSink {
    fn name(&self) -> &'static str {
        "HashBuild"
    }

    fn push_batch(&mut self, _ctx: &ExecutionContext, batch: Batch) -> Result<()> {
        for row in batch.rows() {
            if let Some(key) = encode_join_key(row, &self.keys) {
                self.table.insert(key, project(row, &self.projection));
            }
        }
        Ok(())
    }

    fn finalize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let table = std::mem::take(&mut self.table);
        self.rows_written = table.num_rows() as u64;

        match self.target {
            HashSetTarget::Local => {
                debug!(
                    stage = %ctx.stage,
                    worker = ctx.worker,
                    name = %self.name,
                    rows = self.rows_written,
                    "built local hash set"
                );
                ctx.hash_sets.add(self.name, table)?;
            }
            HashSetTarget::Broadcast => {
                let part = self.name.with_part(ctx.worker as u32);
                let bytes = table.to_bytes()?;
                debug!(
                    stage = %ctx.stage,
                    worker = ctx.worker,
                    name = %part,
                    rows = self.rows_written,
                    bytes = bytes.len(),
                    "broadcasting hash set"
                );
                for target in 0..ctx.num_workers {
                    ctx.transport
                        .ship_serialized_hash_set(target, part, bytes.clone())?;
                }
            }
        }

        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::execution::operators::testutil::TestEnv;
    use crate::execution::scalar::{ScalarValue, encode_group_key};
    use crate::graph::NodeId;
    use crate::hash_set::HashSetManager;
    use crate::runtime::transport::LocalTransport;
    use crate::stage::StageId;

    fn batch() -> Batch {
        Batch::try_from_rows(
            vec![
                vec![ScalarValue::Int64(1), ScalarValue::from("a")],
                vec![ScalarValue::Null, ScalarValue::from("b")],
                vec![ScalarValue::Int64(1), ScalarValue::from("c")],
            ],
            4,
        )
        .unwrap()
    }

    #[test]
    fn local_build_skips_null_keys() {
        let env = TestEnv::new();
        let ctx = env.context();
        let name = HashSetName::new(StageId(1), NodeId(3));
        let mut sink = HashBuildSink::new(name, HashSetTarget::Local, vec![0], vec![1, 0]);
        sink.push_batch(&ctx, batch()).unwrap();
        sink.finalize(&ctx).unwrap();

        assert_eq!(2, sink.rows_written());
        let set = env.hash_sets.get(&name).unwrap();
        let key = encode_group_key(&[ScalarValue::Int64(1)], &[0]);
        assert_eq!(
            &[
                vec![ScalarValue::from("a"), ScalarValue::Int64(1)],
                vec![ScalarValue::from("c"), ScalarValue::Int64(1)],
            ],
            set.get(&key).unwrap()
        );
    }

    #[test]
    fn broadcast_ships_to_every_worker() {
        let managers: Vec<_> = (0..3).map(|_| Arc::new(HashSetManager::new())).collect();
        let mut env = TestEnv::new();
        env.transport = LocalTransport::new(managers.clone());
        let mut ctx = env.context();
        ctx.worker = 2;
        ctx.num_workers = 3;

        let name = HashSetName::new(StageId(0), NodeId(1));
        let mut sink = HashBuildSink::new(name, HashSetTarget::Broadcast, vec![0], vec![0, 1]);
        sink.push_batch(&ctx, batch()).unwrap();
        sink.finalize(&ctx).unwrap();

        for manager in &managers {
            assert!(manager.get(&name.with_part(2)).is_some());
            assert_eq!(1, manager.parts(&name).len());
        }
        // Nothing registered on the context manager directly.
        assert!(env.hash_sets.is_empty());
    }

    #[test]
    fn duplicate_local_build_fails() {
        let env = TestEnv::new();
        let ctx = env.context();
        let name = HashSetName::new(StageId(1), NodeId(3));
        for attempt in 0..2 {
            let mut sink = HashBuildSink::new(name, HashSetTarget::Local, vec![0], vec![0]);
            sink.push_batch(&ctx, batch()).unwrap();
            let res = sink.finalize(&ctx);
            assert_eq!(attempt == 0, res.is_ok());
        }
    }
}
