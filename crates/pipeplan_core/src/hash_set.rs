//! Join hash sets and the per-worker manager owning them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use pipeplan_error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::execution::scalar::Row;
use crate::graph::NodeId;
use crate::stage::StageId;

/// Name of a hash set, derived from the stage building it and the logical join
/// node it serves.
///
/// Broadcast joins ship one part per building worker, identified by `part`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashSetName {
    pub stage: StageId,
    pub join_node: NodeId,
    pub part: Option<u32>,
}

impl HashSetName {
    pub const fn new(stage: StageId, join_node: NodeId) -> Self {
        HashSetName {
            stage,
            join_node,
            part: None,
        }
    }

    pub const fn with_part(self, part: u32) -> Self {
        HashSetName {
            part: Some(part),
            ..self
        }
    }

    /// The name without a part.
    pub const fn base(self) -> Self {
        HashSetName { part: None, ..self }
    }

    pub fn is_part_of(&self, base: &HashSetName) -> bool {
        self.stage == base.stage && self.join_node == base.join_node && self.part.is_some()
    }
}

impl fmt::Display for HashSetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hs_{}_{}", self.stage.0, self.join_node.0)?;
        if let Some(part) = self.part {
            write!(f, "_p{part}")?;
        }
        Ok(())
    }
}

type Table = hashbrown::HashMap<Vec<u8>, Vec<Row>, ahash::RandomState>;

fn new_table() -> Table {
    Table::with_hasher(ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    ))
}

/// Hash table mapping an encoded join key to the build rows with that key.
#[derive(Debug, Clone)]
pub struct JoinHashSet {
    table: Table,
    num_rows: usize,
    size_bytes: usize,
}

#[derive(Serialize, Deserialize)]
struct SerializedHashSet {
    entries: Vec<(Vec<u8>, Vec<Row>)>,
}

impl Default for JoinHashSet {
    fn default() -> Self {
        JoinHashSet {
            table: new_table(),
            num_rows: 0,
            size_bytes: 0,
        }
    }
}

impl JoinHashSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Vec<u8>, row: Row) {
        self.size_bytes += row.iter().map(|v| v.size_bytes()).sum::<usize>();
        self.num_rows += 1;
        match self.table.get_mut(&key) {
            Some(rows) => rows.push(row),
            None => {
                self.size_bytes += key.len();
                self.table.insert(key, vec![row]);
            }
        }
    }

    /// Rows matching `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[Row]> {
        self.table.get(key).map(|rows| rows.as_slice())
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_keys(&self) -> usize {
        self.table.len()
    }

    /// Approximate memory used by keys and rows.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Serialize for shipping to another worker. Entries are ordered by key so
    /// equal sets produce equal bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut entries: Vec<(Vec<u8>, Vec<Row>)> = self
            .table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let buf = serde_json::to_vec(&SerializedHashSet { entries })?;
        Ok(Bytes::from(buf))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let serialized: SerializedHashSet = serde_json::from_slice(bytes)?;
        let mut set = JoinHashSet::new();
        for (key, rows) in serialized.entries {
            for row in rows {
                set.insert(key.clone(), row);
            }
        }
        Ok(set)
    }
}

/// Owns the hash sets materialized on one worker.
///
/// Created at worker startup and passed explicitly to everything that needs
/// it. Sets are inserted once after a build completes, read during probes, and
/// removed during teardown.
#[derive(Debug, Default)]
pub struct HashSetManager {
    sets: RwLock<BTreeMap<HashSetName, Arc<JoinHashSet>>>,
}

impl HashSetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &HashSetName) -> Option<Arc<JoinHashSet>> {
        self.sets.read().get(name).cloned()
    }

    /// Register a completed hash set.
    ///
    /// Errors with `AlreadyExists` if the name is taken, the existing set is
    /// kept.
    pub fn add(&self, name: HashSetName, set: JoinHashSet) -> Result<()> {
        let mut sets = self.sets.write();
        if sets.contains_key(&name) {
            return Err(PlanError::already_exists(name));
        }
        debug!(%name, rows = set.num_rows(), bytes = set.size_bytes(), "adding hash set");
        sets.insert(name, Arc::new(set));
        Ok(())
    }

    /// Remove a hash set, returning it if it existed.
    pub fn remove(&self, name: &HashSetName) -> Option<Arc<JoinHashSet>> {
        let removed = self.sets.write().remove(name);
        if removed.is_some() {
            debug!(%name, "removed hash set");
        }
        removed
    }

    /// All parts of a broadcast hash set, ordered by part.
    pub fn parts(&self, base: &HashSetName) -> Vec<Arc<JoinHashSet>> {
        self.sets
            .read()
            .iter()
            .filter(|(name, _)| name.is_part_of(base))
            .map(|(_, set)| set.clone())
            .collect()
    }

    /// Remove a hash set and all of its parts. Returns the number removed.
    pub fn remove_all(&self, base: &HashSetName) -> usize {
        let base = base.base();
        let mut sets = self.sets.write();
        let before = sets.len();
        sets.retain(|name, _| !(*name == base || name.is_part_of(&base)));
        before - sets.len()
    }

    pub fn len(&self) -> usize {
        self.sets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }

    /// Approximate bytes used by all hash sets.
    pub fn total_size(&self) -> usize {
        self.sets.read().values().map(|s| s.size_bytes()).sum()
    }

    /// Approximate bytes used per hash set.
    pub fn sizes(&self) -> Vec<(HashSetName, usize)> {
        self.sets
            .read()
            .iter()
            .map(|(name, set)| (*name, set.size_bytes()))
            .collect()
    }

    /// Remove everything. Returns the number of sets removed.
    pub fn clear(&self) -> usize {
        let mut sets = self.sets.write();
        let n = sets.len();
        sets.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scalar::ScalarValue;

    fn name(stage: u32, node: usize) -> HashSetName {
        HashSetName::new(StageId(stage), NodeId(node))
    }

    fn set_with(key: &[u8], val: i64) -> JoinHashSet {
        let mut set = JoinHashSet::new();
        set.insert(key.to_vec(), vec![ScalarValue::Int64(val)]);
        set
    }

    #[test]
    fn name_display() {
        assert_eq!("hs_3_7", name(3, 7).to_string());
        assert_eq!("hs_3_7_p2", name(3, 7).with_part(2).to_string());
    }

    #[test]
    fn add_duplicate_keeps_original() {
        let manager = HashSetManager::new();
        manager.add(name(0, 1), set_with(b"k", 1)).unwrap();

        let err = manager.add(name(0, 1), set_with(b"k", 2)).unwrap_err();
        assert!(matches!(err, PlanError::AlreadyExists { .. }));

        let set = manager.get(&name(0, 1)).unwrap();
        assert_eq!(&[vec![ScalarValue::Int64(1)]], set.get(b"k").unwrap());
    }

    #[test]
    fn remove_then_get() {
        let manager = HashSetManager::new();
        manager.add(name(0, 1), set_with(b"k", 1)).unwrap();
        assert!(manager.remove(&name(0, 1)).is_some());
        assert!(manager.get(&name(0, 1)).is_none());
        assert!(manager.remove(&name(0, 1)).is_none());
    }

    #[test]
    fn parts_and_remove_all() {
        let manager = HashSetManager::new();
        let base = name(2, 4);
        manager.add(base.with_part(1), set_with(b"b", 2)).unwrap();
        manager.add(base.with_part(0), set_with(b"a", 1)).unwrap();
        manager.add(name(3, 4).with_part(0), set_with(b"c", 3)).unwrap();

        let parts = manager.parts(&base);
        assert_eq!(2, parts.len());
        assert!(parts[0].get(b"a").is_some());

        assert_eq!(2, manager.remove_all(&base));
        assert_eq!(1, manager.len());
    }

    #[test]
    fn sizes_reported() {
        let manager = HashSetManager::new();
        manager.add(name(0, 1), set_with(b"k", 1)).unwrap();
        assert!(manager.total_size() > 0);
        assert_eq!(manager.total_size(), manager.sizes()[0].1);
        assert_eq!(1, manager.clear());
        assert_eq!(0, manager.total_size());
    }

    #[test]
    fn serialize_hash_set() {
        let mut set = JoinHashSet::new();
        set.insert(b"a".to_vec(), vec!["x".into()]);
        set.insert(b"a".to_vec(), vec!["y".into()]);
        set.insert(b"b".to_vec(), vec![ScalarValue::Null]);

        let bytes = set.to_bytes().unwrap();
        let got = JoinHashSet::from_bytes(&bytes).unwrap();
        assert_eq!(3, got.num_rows());
        assert_eq!(2, got.num_keys());
        assert_eq!(2, got.get(b"a").unwrap().len());
        assert_eq!(bytes, got.to_bytes().unwrap());
    }
}
