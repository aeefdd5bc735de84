//! Typed error hierarchy for the cadence orchestrator.
//!
//! `EngineError` covers the orchestration core and ingress entry points;
//! the HTTP layer maps its variants onto response codes. Infrastructure
//! plumbing (SQLite, task joins) travels as `anyhow::Error` and surfaces
//! through the transparent `Other` variant.

use thiserror::Error;
use uuid::Uuid;

use crate::store::models::{Stage, TaskKind, TaskStatus};

/// Errors from the orchestration engine and its ingress entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Release {id} not found")]
    ReleaseNotFound { id: Uuid },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Cycle {id} not found")]
    CycleNotFound { id: Uuid },

    #[error("Release {id} is already released")]
    AlreadyReleased { id: Uuid },

    #[error("Stage {stage} of release {id} is not complete")]
    StageNotComplete { id: Uuid, stage: Stage },

    #[error("Task {id} is {status}; retry is only allowed from failed")]
    RetryNotAllowed { id: Uuid, status: TaskStatus },

    #[error("Task {id} is {status}; skip is only allowed from failed")]
    SkipNotAllowed { id: Uuid, status: TaskStatus },

    #[error("Tasks of kind {kind} cannot be skipped")]
    NotSkippable { kind: TaskKind },

    #[error("Cycle {id} is {status}; only an in-progress cycle can be abandoned")]
    CycleNotActive { id: Uuid, status: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_retry_not_allowed_carries_status() {
        let id = Uuid::new_v4();
        let err = EngineError::RetryNotAllowed {
            id,
            status: TaskStatus::Completed,
        };
        assert!(err.to_string().contains("completed"));
        match err {
            EngineError::RetryNotAllowed { status, .. } => {
                assert_eq!(status, TaskStatus::Completed)
            }
            _ => panic!("Expected RetryNotAllowed"),
        }
    }

    #[test]
    fn engine_error_converts_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("db exploded").into();
        assert!(matches!(err, EngineError::Other(_)));
        assert!(err.to_string().contains("db exploded"));
    }

    #[test]
    fn engine_error_implements_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let err = EngineError::NotSkippable {
            kind: TaskKind::BranchFork,
        };
        assert_std_error(&err);
        assert!(err.to_string().contains("branch_fork"));
    }
}
