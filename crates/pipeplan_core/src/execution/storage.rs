use pipeplan_error::{OptionExt, PlanError, Result, internal};
use tracing::debug;

use super::scalar::Row;
use crate::logical::SetIdentifier;
use crate::partition::PartitionPolicy;

/// A set split into one partition per worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSet {
    pub columns: Vec<String>,
    pub partitions: Vec<Vec<Row>>,
}

impl StoredSet {
    pub fn num_rows(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }
}

/// In-memory storage for input, intermediate, and output sets.
///
/// Every set has exactly `num_partitions` partitions. Worker `i` reads and
/// writes partition `i`, except repartition sinks which write to every
/// partition.
#[derive(Debug)]
pub struct MemorySetStore {
    num_partitions: usize,
    sets: scc::HashMap<SetIdentifier, StoredSet>,
}

impl MemorySetStore {
    pub fn new(num_partitions: usize) -> Self {
        MemorySetStore {
            num_partitions: num_partitions.max(1),
            sets: scc::HashMap::new(),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Create an empty set. Errors if it already exists.
    pub fn create(&self, set: &SetIdentifier, columns: Vec<String>) -> Result<()> {
        let stored = StoredSet {
            columns,
            partitions: vec![Vec::new(); self.num_partitions],
        };
        self.sets
            .insert(set.clone(), stored)
            .map_err(|_| PlanError::already_exists(set))
    }

    /// Append rows to a partition, creating the set if needed.
    pub fn append(
        &self,
        set: &SetIdentifier,
        columns: &[String],
        partition: usize,
        rows: Vec<Row>,
    ) -> Result<()> {
        if partition >= self.num_partitions {
            return Err(internal!(
                "partition {partition} out of range for {} partitions",
                self.num_partitions
            ));
        }

        let num_partitions = self.num_partitions;
        let mut entry = self.sets.entry(set.clone()).or_insert_with(|| StoredSet {
            columns: columns.to_vec(),
            partitions: vec![Vec::new(); num_partitions],
        });
        let stored = entry.get_mut();
        if stored.columns != columns {
            return Err(internal!(
                "column mismatch writing to {set}: [{}] vs [{}]",
                stored.columns.join(", "),
                columns.join(", ")
            ));
        }
        stored.partitions[partition].extend(rows);

        Ok(())
    }

    /// Load rows into a set, dispatching them across partitions with a
    /// policy.
    pub fn load(
        &self,
        set: &SetIdentifier,
        columns: Vec<String>,
        rows: Vec<Row>,
        policy: &mut PartitionPolicy,
        key_columns: &[usize],
    ) -> Result<()> {
        if let Some(row) = rows.iter().find(|r| r.len() != columns.len()) {
            return Err(PlanError::Execution(format!(
                "row with {} values loaded into {set} with {} columns",
                row.len(),
                columns.len()
            )));
        }

        let num_rows = rows.len();
        let buckets = policy.partition_rows(rows, key_columns, self.num_partitions)?;
        self.create(set, columns.clone())?;
        for (partition, rows) in buckets.into_iter().enumerate() {
            self.append(set, &columns, partition, rows)?;
        }
        debug!(%set, num_rows, policy = %policy.kind(), "loaded set");

        Ok(())
    }

    /// Read one partition of a set.
    pub fn read_partition(&self, set: &SetIdentifier, partition: usize) -> Result<Vec<Row>> {
        let entry = self.sets.get(set).required(set)?;
        entry
            .get()
            .partitions
            .get(partition)
            .cloned()
            .ok_or_else(|| internal!("partition {partition} out of range for {set}"))
    }

    pub fn columns(&self, set: &SetIdentifier) -> Option<Vec<String>> {
        self.sets.get(set).map(|entry| entry.get().columns.clone())
    }

    /// Snapshot of a set with all partitions.
    pub fn get(&self, set: &SetIdentifier) -> Option<StoredSet> {
        self.sets.get(set).map(|entry| entry.get().clone())
    }

    /// All rows of a set, partition by partition.
    pub fn rows(&self, set: &SetIdentifier) -> Option<Vec<Row>> {
        self.sets
            .get(set)
            .map(|entry| entry.get().partitions.concat())
    }

    pub fn contains(&self, set: &SetIdentifier) -> bool {
        self.sets.contains(set)
    }

    pub fn remove(&self, set: &SetIdentifier) -> bool {
        self.sets.remove(set).is_some()
    }
}
