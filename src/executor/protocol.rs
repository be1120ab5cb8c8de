//! Network Protocol Definitions
//!
//! Internal operations travel between members as bincode-encoded
//! [`Operation`] values and come back as
//! `Result<OperationResponse, ExecutorError>`. The public HTTP API uses the
//! JSON DTOs below.
//!
//! Constants define the endpoints served by every node.

use super::types::*;
use crate::cluster::types::NodeId;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_INTERNAL_OPERATION: &str = "/internal/executor/op";
pub const ENDPOINT_SUBMIT: &str = "/executor/:name/submit";
pub const ENDPOINT_RESULT: &str = "/executor/:name/result/:partition/:sequence";
pub const ENDPOINT_SHUTDOWN: &str = "/executor/:name/shutdown";
pub const ENDPOINT_STATS: &str = "/executor/:name/stats";

/// Work addressed to a partition owner, or to a specific member for the
/// replication and lifecycle variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Assigns the next task id of `partition` and admits the task.
    /// Resending the same `submission` yields the id assigned the first time.
    Submit {
        name: String,
        partition: u32,
        task: TaskEnvelope,
        submission: String,
        /// Set when the submitter will collect the outcome with `claim`.
        submitter: Option<NodeId>,
    },
    /// Resolves once the task is terminal. With `dispose` the slot is
    /// cleared in the same step that reads it. With `claim` the submitter
    /// collects an outcome parked for it, whether or not the ring still
    /// holds it.
    AwaitResult {
        name: String,
        task_id: TaskId,
        dispose: bool,
        claim: bool,
    },
    DisposeResult {
        name: String,
        task_id: TaskId,
    },
    Cancel {
        name: String,
        task_id: TaskId,
        may_interrupt: bool,
    },
    /// Lifecycle change applied by every member.
    Shutdown {
        name: String,
        now: bool,
    },
    /// One slot write pushed from a primary to a backup.
    Replicate {
        key: ContainerKey,
        slot: RingSlot,
        next_sequence: u64,
    },
    /// An outcome parked for its submitter (`Some`) or collected (`None`).
    ReplicateUnclaimed {
        key: ContainerKey,
        task_id: TaskId,
        unclaimed: Option<UnclaimedOutcome>,
    },
    /// Full container state for a member that just became a backup.
    ReplicateContainer(ContainerSnapshot),
    /// Asks the receiver to stop acting as primary for `partitions` and hand
    /// over every container it holds for them.
    PartitionDump {
        partitions: Vec<u32>,
    },
}

impl Operation {
    /// Operations that may legitimately block until a task finishes.
    pub fn waits_on_task(&self) -> bool {
        matches!(self, Operation::AwaitResult { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Submit { .. } => "submit",
            Operation::AwaitResult { .. } => "await-result",
            Operation::DisposeResult { .. } => "dispose-result",
            Operation::Cancel { .. } => "cancel",
            Operation::Shutdown { .. } => "shutdown",
            Operation::Replicate { .. } => "replicate",
            Operation::ReplicateUnclaimed { .. } => "replicate-unclaimed",
            Operation::ReplicateContainer(_) => "replicate-container",
            Operation::PartitionDump { .. } => "partition-dump",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationResponse {
    TaskId(TaskId),
    /// `None` when the result was disposed.
    Outcome(Option<TaskOutcome>),
    Cancelled(bool),
    /// Ids of queued tasks discarded by an immediate shutdown.
    Drained(Vec<TaskId>),
    Snapshots(Vec<ContainerSnapshot>),
    Ack,
}

// ============================================================
// Public JSON API
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_type: String,
    pub task: Option<serde_json::Value>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultQuery {
    pub task_type: Option<String>,
    #[serde(default)]
    pub dispose: bool,
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Empty,
    Failed,
    Cancelled,
    Stale,
    Pending,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub task_id: TaskId,
    pub status: ResultStatus,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownQuery {
    #[serde(default)]
    pub now: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub drained: Vec<TaskId>,
    pub is_shutdown: bool,
    pub is_terminated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub name: String,
    pub stats: LocalExecutorStats,
    pub is_shutdown: bool,
    pub is_terminated: bool,
}
