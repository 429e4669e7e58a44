//! Partition policies mapping records to destination partitions.

use std::fmt;
use std::str::FromStr;

use pipeplan_error::{PlanError, Result, internal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::execution::scalar::{Row, encode_group_key};

/// Compute the partition to use for a given hash value.
pub const fn partition(hash: u64, partitions: usize) -> usize {
    ((hash as u128 * partitions as u128) >> 64) as usize
}

/// Requested partition policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicyKind {
    /// Random, or round robin when built with the `round-robin-default`
    /// feature.
    #[default]
    Default,
    Random,
    RoundRobin,
    /// Partition on a hash of the key. Used for shuffles.
    Hash,
    /// Reserved, not implemented.
    Fair,
}

impl PartitionPolicyKind {
    /// Resolve `Default` to a concrete policy.
    pub const fn resolve(self) -> PartitionPolicyKind {
        match self {
            PartitionPolicyKind::Default => {
                if cfg!(feature = "round-robin-default") {
                    PartitionPolicyKind::RoundRobin
                } else {
                    PartitionPolicyKind::Random
                }
            }
            other => other,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            PartitionPolicyKind::Default => "default",
            PartitionPolicyKind::Random => "random",
            PartitionPolicyKind::RoundRobin => "round_robin",
            PartitionPolicyKind::Hash => "hash",
            PartitionPolicyKind::Fair => "fair",
        }
    }
}

impl FromStr for PartitionPolicyKind {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "default" => PartitionPolicyKind::Default,
            "random" => PartitionPolicyKind::Random,
            "round_robin" => PartitionPolicyKind::RoundRobin,
            "hash" => PartitionPolicyKind::Hash,
            "fair" => PartitionPolicyKind::Fair,
            other => {
                return Err(PlanError::UnsupportedPolicy {
                    policy: other.to_string(),
                });
            }
        })
    }
}

impl fmt::Display for PartitionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Uniform random choice.
#[derive(Debug)]
pub struct RandomPolicy {
    rng: StdRng,
}

/// Cycles through partitions in order.
///
/// The counter belongs to this instance, separate instances never interfere.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next: usize,
}

/// Partitions on a hash of the key with fixed seeds, every instance maps a key
/// to the same partition.
#[derive(Debug, Clone)]
pub struct HashPolicy {
    state: ahash::RandomState,
}

impl Default for HashPolicy {
    fn default() -> Self {
        HashPolicy {
            state: ahash::RandomState::with_seeds(
                0x9e37_79b9_7f4a_7c15,
                0xbf58_476d_1ce4_e5b9,
                0x94d0_49bb_1331_11eb,
                0x2545_f491_4f6c_dd1d,
            ),
        }
    }
}

#[derive(Debug)]
pub enum PartitionPolicy {
    Random(RandomPolicy),
    RoundRobin(RoundRobinPolicy),
    Hash(HashPolicy),
}

impl PartitionPolicy {
    /// Create a policy. `seed` is used by the random policy so dispatch is
    /// reproducible.
    pub fn try_new(kind: PartitionPolicyKind, seed: u64) -> Result<Self> {
        Ok(match kind.resolve() {
            PartitionPolicyKind::Random => PartitionPolicy::Random(RandomPolicy {
                rng: StdRng::seed_from_u64(seed),
            }),
            PartitionPolicyKind::RoundRobin => {
                PartitionPolicy::RoundRobin(RoundRobinPolicy::default())
            }
            PartitionPolicyKind::Hash => PartitionPolicy::Hash(HashPolicy::default()),
            PartitionPolicyKind::Fair => {
                return Err(PlanError::UnsupportedPolicy {
                    policy: PartitionPolicyKind::Fair.to_string(),
                });
            }
            PartitionPolicyKind::Default => {
                return Err(internal!("default partition policy did not resolve"));
            }
        })
    }

    pub fn kind(&self) -> PartitionPolicyKind {
        match self {
            PartitionPolicy::Random(_) => PartitionPolicyKind::Random,
            PartitionPolicy::RoundRobin(_) => PartitionPolicyKind::RoundRobin,
            PartitionPolicy::Hash(_) => PartitionPolicyKind::Hash,
        }
    }

    /// Choose a partition in `[0, partition_count)` for a record with the
    /// given encoded key. Only the hash policy looks at the key.
    pub fn choose_partition(&mut self, key: &[u8], partition_count: usize) -> Result<usize> {
        if partition_count == 0 {
            return Err(internal!("cannot choose from zero partitions"));
        }

        Ok(match self {
            PartitionPolicy::Random(policy) => policy.rng.random_range(0..partition_count),
            PartitionPolicy::RoundRobin(policy) => {
                let idx = policy.next % partition_count;
                policy.next = (idx + 1) % partition_count;
                idx
            }
            PartitionPolicy::Hash(policy) => {
                partition(policy.state.hash_one(key), partition_count)
            }
        })
    }

    /// Split rows into one bucket per partition.
    ///
    /// `key_columns` are encoded as the partition key for each row.
    pub fn partition_rows(
        &mut self,
        rows: Vec<Row>,
        key_columns: &[usize],
        partition_count: usize,
    ) -> Result<Vec<Vec<Row>>> {
        let mut buckets: Vec<Vec<Row>> = vec![Vec::new(); partition_count];
        for row in rows {
            if let Some(&idx) = key_columns.iter().find(|&&idx| idx >= row.len()) {
                return Err(internal!(
                    "key column {idx} out of bounds for row with {} values",
                    row.len()
                ));
            }
            let key = encode_group_key(&row, key_columns);
            let idx = self.choose_partition(&key, partition_count)?;
            buckets[idx].push(row);
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scalar::ScalarValue;

    #[test]
    fn round_robin_in_order() {
        let mut policy = PartitionPolicy::try_new(PartitionPolicyKind::RoundRobin, 0).unwrap();
        let got: Vec<_> = (0..7)
            .map(|_| policy.choose_partition(b"", 3).unwrap())
            .collect();
        assert_eq!(vec![0, 1, 2, 0, 1, 2, 0], got);
    }

    #[test]
    fn round_robin_instances_independent() {
        let mut a = PartitionPolicy::try_new(PartitionPolicyKind::RoundRobin, 0).unwrap();
        let mut b = PartitionPolicy::try_new(PartitionPolicyKind::RoundRobin, 0).unwrap();
        assert_eq!(0, a.choose_partition(b"", 4).unwrap());
        assert_eq!(1, a.choose_partition(b"", 4).unwrap());
        assert_eq!(0, b.choose_partition(b"", 4).unwrap());
    }

    #[test]
    fn random_is_seeded() {
        let mut a = PartitionPolicy::try_new(PartitionPolicyKind::Random, 42).unwrap();
        let mut b = PartitionPolicy::try_new(PartitionPolicyKind::Random, 42).unwrap();
        for _ in 0..32 {
            let idx = a.choose_partition(b"", 5).unwrap();
            assert!(idx < 5);
            assert_eq!(idx, b.choose_partition(b"", 5).unwrap());
        }
    }

    #[test]
    fn hash_is_stable_across_instances() {
        let mut a = PartitionPolicy::try_new(PartitionPolicyKind::Hash, 0).unwrap();
        let mut b = PartitionPolicy::try_new(PartitionPolicyKind::Hash, 1).unwrap();
        let keys: [&[u8]; 4] = [b"a", b"bb", b"ccc", b""];
        for key in keys {
            assert_eq!(
                a.choose_partition(key, 7).unwrap(),
                b.choose_partition(key, 7).unwrap()
            );
        }
    }

    #[test]
    fn fair_unsupported() {
        let err = PartitionPolicy::try_new(PartitionPolicyKind::Fair, 0).unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedPolicy { .. }));
    }

    #[test]
    fn default_resolves() {
        let policy = PartitionPolicy::try_new(PartitionPolicyKind::Default, 0).unwrap();
        if cfg!(feature = "round-robin-default") {
            assert_eq!(PartitionPolicyKind::RoundRobin, policy.kind());
        } else {
            assert_eq!(PartitionPolicyKind::Random, policy.kind());
        }
    }

    #[test]
    fn zero_partitions_errors() {
        let mut policy = PartitionPolicy::try_new(PartitionPolicyKind::RoundRobin, 0).unwrap();
        policy.choose_partition(b"", 0).unwrap_err();
    }

    #[test]
    fn partition_rows_by_hash() {
        let mut policy = PartitionPolicy::try_new(PartitionPolicyKind::Hash, 0).unwrap();
        let rows: Vec<Row> = (0..100)
            .map(|v| vec![ScalarValue::Int64(v % 10), ScalarValue::Int64(v)])
            .collect();
        let buckets = policy.partition_rows(rows, &[0], 4).unwrap();
        assert_eq!(100, buckets.iter().map(|b| b.len()).sum::<usize>());

        // Rows with the same key land in the same bucket.
        for bucket in &buckets {
            for row in bucket {
                let others = buckets
                    .iter()
                    .filter(|b| !std::ptr::eq(*b, bucket))
                    .flatten()
                    .any(|r| r[0] == row[0]);
                assert!(!others);
            }
        }
    }

    #[test]
    fn parse_policy() {
        assert_eq!(
            PartitionPolicyKind::RoundRobin,
            "round_robin".parse().unwrap()
        );
        "weird".parse::<PartitionPolicyKind>().unwrap_err();
    }
}
