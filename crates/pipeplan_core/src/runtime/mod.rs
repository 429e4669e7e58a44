//! In-process workers executing stages.

pub mod cluster;
pub mod transport;
pub mod worker;

pub use cluster::{Cluster, ExecutionSummary, StageReport, StageStatus};
