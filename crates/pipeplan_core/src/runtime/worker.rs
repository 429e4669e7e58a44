use std::sync::Arc;

use crate::hash_set::HashSetManager;

/// A worker executing its partition of every stage.
///
/// Owns the hash set manager for the worker. The manager is created with the
/// worker and handed to each stage execution.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: usize,
    pub hash_sets: Arc<HashSetManager>,
}

impl Worker {
    pub fn new(id: usize) -> Self {
        Worker {
            id,
            hash_sets: Arc::new(HashSetManager::new()),
        }
    }
}
