use serde::Serialize;

use crate::stage::JoinSide;

/// How a join is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinStrategy {
    /// Build a hash set from `build` on every worker and ship it everywhere.
    Broadcast { build: JoinSide },
    /// Repartition both sides on the join key and build locally from `build`.
    Shuffle { build: JoinSide },
}

/// Pick a join strategy from estimated input sizes.
///
/// A side is small if its estimate is strictly below the threshold. Exactly
/// one small side is broadcast. When both are small the smaller one is
/// broadcast. When neither is small both sides are shuffled, building from
/// the smaller one. Ties go to the left side.
pub fn select_join_strategy(left: u64, right: u64, threshold: u64) -> JoinStrategy {
    let smaller = if right < left {
        JoinSide::Right
    } else {
        JoinSide::Left
    };

    match (left < threshold, right < threshold) {
        (true, false) => JoinStrategy::Broadcast {
            build: JoinSide::Left,
        },
        (false, true) => JoinStrategy::Broadcast {
            build: JoinSide::Right,
        },
        (true, true) => JoinStrategy::Broadcast { build: smaller },
        (false, false) => JoinStrategy::Shuffle { build: smaller },
    }
}
