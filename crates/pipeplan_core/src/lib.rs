//! Physical planning and pipelined execution of logical plans.
//!
//! A [`logical::LogicalPlan`] is grouped into pipeline nodes
//! ([`graph::PipelineNodeGraph`]), turned into dependency ordered
//! [`stage::Stage`]s by the [`optimizer::PhysicalOptimizer`], and executed on a
//! set of workers by the [`runtime::Cluster`].

pub mod config;
pub mod execution;
pub mod explain;
pub mod graph;
pub mod hash_set;
pub mod logical;
pub mod optimizer;
pub mod partition;
pub mod runtime;
pub mod stage;

pub use pipeplan_error::{PlanError, Result};
