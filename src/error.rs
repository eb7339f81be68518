//! Error taxonomy for the control plane
//!
//! Errors raised by the dispatch engine, the aggregation pipeline and the
//! quantile protocol. Binary and I/O boundaries wrap these in `anyhow::Error`
//! with context, the same way the rest of the crate does.
//!
//! # Propagation
//!
//! - [`FedError::Config`] is fatal and raised before anything is dispatched.
//! - [`FedError::TaskAborted`] is a clean unwind, not a failure.
//! - [`FedError::ClientResult`] is logged and the contribution dropped; it never
//!   escalates on its own.
//! - [`FedError::Phase`] aborts the remaining pipeline.
//! - [`FedError::ProtocolInvariant`] rejects a result outright.

use crate::task::{ReturnCode, TaskId};
use thiserror::Error;

/// Control plane error
#[derive(Debug, Error)]
pub enum FedError {
    /// Invalid task or target configuration detected at schedule time
    #[error("configuration error: {0}")]
    Config(String),

    /// Cooperative cancellation reached this task or phase
    #[error("task '{task}' aborted")]
    TaskAborted { task: String },

    /// One client reported a non-OK return code
    #[error("client '{client}' returned {code} for task '{task}'")]
    ClientResult {
        client: String,
        task: String,
        code: ReturnCode,
    },

    /// A phase could not produce an aggregate
    #[error("phase '{phase}' failed: {reason}")]
    Phase { phase: String, reason: String },

    /// A client result does not belong to the round or feature set it claims
    #[error("protocol invariant violated by client '{client}': {detail}")]
    ProtocolInvariant { client: String, detail: String },

    /// Result submitted for a task that is not standing (finished or never scheduled)
    #[error("task {0} is not standing")]
    UnknownTask(TaskId),

    /// Result submitted by a client that holds no assignment for the task
    #[error("client '{client}' holds no assignment for task {task_id}")]
    NotAssigned { client: String, task_id: TaskId },

    /// Payload or result blob could not be encoded/decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl FedError {
    /// Build a phase error from anything displayable
    pub fn phase(phase: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Phase {
            phase: phase.into(),
            reason: reason.to_string(),
        }
    }

    pub fn client_result(client: impl Into<String>, task: impl Into<String>, code: ReturnCode) -> Self {
        Self::ClientResult {
            client: client.into(),
            task: task.into(),
            code,
        }
    }

    /// Whether this error is a cooperative cancellation rather than a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::TaskAborted { .. })
    }
}

impl From<bincode::Error> for FedError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Result type for engine-level operations
pub type FedResult<T> = std::result::Result<T, FedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_is_not_failure() {
        let err = FedError::TaskAborted { task: "client_stats".to_string() };
        assert!(err.is_aborted());
        assert!(!FedError::phase("aggregate_var", "no results").is_aborted());
    }

    #[test]
    fn test_display_includes_identity() {
        let err = FedError::client_result("site-2", "aggregate_var", ReturnCode::ExecutionException);
        let msg = err.to_string();
        assert!(msg.contains("site-2"));
        assert!(msg.contains("aggregate_var"));
        assert!(msg.contains("EXECUTION_EXCEPTION"));
    }
}
