//! Error taxonomy shared by the client-side router, the member-side engine and
//! the wire protocol.
//!
//! Every variant is `Clone` and serializable: an error raised on the executing
//! member travels back to the caller unchanged, and a completed future hands
//! the same error to every registered callback.

use crate::executor::types::TaskId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorError {
    /// Local validation failed before any remote interaction.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Admission gate saturated, or the executor/cluster is shut down.
    #[error("task rejected: {0}")]
    Rejected(String),

    /// The task body returned an error or panicked.
    #[error("task execution failed: {cause}")]
    Execution { cause: String },

    #[error("task cancelled")]
    Cancelled,

    /// The ring slot for this id now holds a later task.
    #[error("stale task id {0}: result overwritten by a later task")]
    StaleTaskId(TaskId),

    #[error("timed out waiting for task result")]
    Timeout,

    /// The receiving member is not (or not yet) primary for the partition.
    #[error("member is not the owner of partition {partition}")]
    NotOwner { partition: u32 },

    #[error("member left the cluster: {0}")]
    MemberLeft(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("codec failure: {0}")]
    Codec(String),
}

impl ExecutorError {
    /// Routing and membership churn: safe to retry against the current owner.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::NotOwner { .. }
                | ExecutorError::MemberLeft(_)
                | ExecutorError::Transport(_)
        )
    }
}

impl From<bincode::Error> for ExecutorError {
    fn from(e: bincode::Error) -> Self {
        ExecutorError::Codec(e.to_string())
    }
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
