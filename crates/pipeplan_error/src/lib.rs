//! Error type shared by the planner and the execution runtime.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Structural inconsistency in the logical plan. Fatal, no stages are
    /// emitted.
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// The cost oracle has no size estimate for a set.
    #[error("unknown cardinality for set '{set}'")]
    UnknownCardinality { set: String },

    /// A pipeline node was marked executed more than once.
    #[error("node {node} already executed by stage {previous}, attempted again by stage {stage}")]
    AlreadyExecuted {
        node: usize,
        stage: u32,
        previous: u32,
    },

    /// A pipeline node was claimed by more than one algorithm.
    #[error("node {node} already claimed by {claimed_by}")]
    AlreadyClaimed { node: usize, claimed_by: String },

    /// A named object was registered twice.
    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    #[error("unsupported partition policy: {policy}")]
    UnsupportedPolicy { policy: String },

    #[error("'{name}' not found")]
    NotFound { name: String },

    /// A stage failed on a worker. Dependent stages were not started.
    #[error("stage {stage} failed on worker {worker}: {source}")]
    StageFailed {
        stage: u32,
        worker: usize,
        source: Box<PlanError>,
    },

    /// Failure while executing an operator, usually a record level error.
    #[error("execution: {0}")]
    Execution(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PlanError> = std::result::Result<T, E>;

impl PlanError {
    pub fn not_found(name: impl fmt::Display) -> Self {
        PlanError::NotFound {
            name: name.to_string(),
        }
    }

    pub fn already_exists(name: impl fmt::Display) -> Self {
        PlanError::AlreadyExists {
            name: name.to_string(),
        }
    }

    /// Returns true if this error is a missing size estimate, which callers
    /// may recover from.
    pub fn is_unknown_cardinality(&self) -> bool {
        matches!(self, PlanError::UnknownCardinality { .. })
    }

    /// Returns the innermost error, skipping stage failure wrappers.
    pub fn root_cause(&self) -> &PlanError {
        match self {
            PlanError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Create an internal error with a formatted message.
#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::PlanError::Internal(std::format!($($arg)*))
    };
}

/// Create a malformed plan error with a formatted message.
#[macro_export]
macro_rules! malformed {
    ($($arg:tt)*) => {
        $crate::PlanError::MalformedPlan(std::format!($($arg)*))
    };
}

/// Extension trait for turning options into not found errors.
pub trait OptionExt<T> {
    fn required(self, name: impl fmt::Display) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, name: impl fmt::Display) -> Result<T> {
        self.ok_or_else(|| PlanError::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_stage_failure() {
        let err = PlanError::StageFailed {
            stage: 3,
            worker: 1,
            source: Box::new(PlanError::StageFailed {
                stage: 3,
                worker: 1,
                source: Box::new(PlanError::Execution("bad".to_string())),
            }),
        };
        assert!(matches!(err.root_cause(), PlanError::Execution(_)));
    }

    #[test]
    fn required_on_none() {
        let v: Option<i32> = None;
        let err = v.required("thing").unwrap_err();
        assert_eq!("'thing' not found", err.to_string());
    }

    #[test]
    fn internal_macro_formats() {
        let err = internal!("bad {}", 4);
        assert_eq!("internal: bad 4", err.to_string());
    }
}
