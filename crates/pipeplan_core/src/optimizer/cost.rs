use std::collections::BTreeMap;

use pipeplan_error::{PlanError, Result};
use serde::{Deserialize, Serialize};

use crate::logical::SetIdentifier;

/// Source of size estimates for sets.
pub trait CostOracle {
    /// Estimated size of a set in bytes.
    ///
    /// Errors with `UnknownCardinality` if there's no estimate.
    fn estimate_size(&self, set: &SetIdentifier) -> Result<u64>;
}

/// Fixed estimates keyed by `database:set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticCostOracle {
    sizes: BTreeMap<String, u64>,
}

impl StaticCostOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, set: &SetIdentifier, bytes: u64) -> Self {
        self.insert(set, bytes);
        self
    }

    pub fn insert(&mut self, set: &SetIdentifier, bytes: u64) {
        self.sizes.insert(set.to_string(), bytes);
    }

    /// Load estimates from a JSON object mapping `database:set` to bytes.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

impl CostOracle for StaticCostOracle {
    fn estimate_size(&self, set: &SetIdentifier) -> Result<u64> {
        self.sizes
            .get(&set.to_string())
            .copied()
            .ok_or_else(|| PlanError::UnknownCardinality {
                set: set.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_missing() {
        let a = SetIdentifier::new("db", "a");
        let oracle = StaticCostOracle::new().with_size(&a, 42);
        assert_eq!(42, oracle.estimate_size(&a).unwrap());

        let err = oracle
            .estimate_size(&SetIdentifier::new("db", "b"))
            .unwrap_err();
        assert!(err.is_unknown_cardinality());
    }

    #[test]
    fn from_json() {
        let oracle = StaticCostOracle::from_json(r#"{"db:a": 10, "db:b": 20}"#).unwrap();
        assert_eq!(
            20,
            oracle
                .estimate_size(&SetIdentifier::new("db", "b"))
                .unwrap()
        );
    }
}
