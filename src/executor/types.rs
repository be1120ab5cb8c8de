use crate::cluster::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a durable task.
///
/// Carries the partition id next to the per-partition sequence, so a task id
/// alone is enough to route a retrieval to whichever member currently holds
/// the partition. Ids order by partition, then sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub partition: u32,
    pub sequence: u64,
}

impl TaskId {
    pub fn new(partition: u32, sequence: u64) -> Self {
        Self {
            partition,
            sequence,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.sequence)
    }
}

/// Whether the submitter expects a value back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    Callable,
    Runnable,
}

/// Lifecycle of a single ring slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SlotState {
    /// Admitted, waiting in the holding area for a free worker.
    Pending,
    Running,
    Completed,
    /// Terminal failure; the cause is kept in the slot.
    Failed,
    /// Explicitly cleared after consumption.
    Disposed,
    Cancelled,
}

impl SlotState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SlotState::Pending | SlotState::Running)
    }
}

/// A task as it travels between members: the payload is the byte sequence
/// produced once by the submitter and is never re-encoded afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_type: String,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
}

/// Terminal result of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskOutcome {
    /// Encoded return value; `None` for runnables.
    Completed(Option<Vec<u8>>),
    Failed(String),
    Cancelled,
}

/// One entry of the result ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingSlot {
    pub task_id: TaskId,
    pub state: SlotState,
    /// Kept while the task is in flight so a promoted backup can run it.
    pub task: Option<TaskEnvelope>,
    pub value: Option<Vec<u8>>,
    pub failure: Option<String>,
    /// Member whose future collects the outcome; in-flight slots only.
    pub submitter: Option<NodeId>,
    /// Submitter-chosen id that lets the owner recognise a resent submission.
    pub submission: Option<String>,
    /// Set by a dispose that arrived while the task was still running.
    pub dispose_on_completion: bool,
}

impl RingSlot {
    pub fn in_flight(task_id: TaskId, state: SlotState, task: TaskEnvelope) -> Self {
        Self {
            task_id,
            state,
            task: Some(task),
            value: None,
            failure: None,
            submitter: None,
            submission: None,
            dispose_on_completion: false,
        }
    }

    /// The ring copy of an in-flight slot: same id and state, no payload.
    pub fn marker(&self) -> Self {
        Self {
            task_id: self.task_id,
            state: self.state,
            task: None,
            value: None,
            failure: None,
            submitter: None,
            submission: None,
            dispose_on_completion: false,
        }
    }

    pub fn terminal(task_id: TaskId, outcome: &TaskOutcome) -> Self {
        let (state, value, failure) = match outcome {
            TaskOutcome::Completed(value) => (SlotState::Completed, value.clone(), None),
            TaskOutcome::Failed(cause) => (SlotState::Failed, None, Some(cause.clone())),
            TaskOutcome::Cancelled => (SlotState::Cancelled, None, None),
        };
        Self {
            task_id,
            state,
            task: None,
            value,
            failure,
            submitter: None,
            submission: None,
            dispose_on_completion: false,
        }
    }

    /// The outcome stored in a terminal slot.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.state {
            SlotState::Completed => Some(TaskOutcome::Completed(self.value.clone())),
            SlotState::Failed => Some(TaskOutcome::Failed(
                self.failure.clone().unwrap_or_default(),
            )),
            SlotState::Cancelled => Some(TaskOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Identity of a partition container: one per `(executor name, partition)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContainerKey {
    pub name: String,
    pub partition: u32,
}

impl ContainerKey {
    pub fn new(name: &str, partition: u32) -> Self {
        Self {
            name: name.to_string(),
            partition,
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.partition)
    }
}

/// Full replicated state of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub key: ContainerKey,
    pub capacity: usize,
    pub next_sequence: u64,
    /// Ring contents, including admission markers.
    pub slots: Vec<RingSlot>,
    /// Admitted tasks that have not finished, with their payloads.
    pub in_flight: Vec<RingSlot>,
    pub unclaimed: Vec<UnclaimedOutcome>,
    /// Recently assigned ids by submission id, oldest first.
    pub submissions: Vec<(String, TaskId)>,
}

/// Outcome of a finished task that its submitter has not collected yet.
/// Kept apart from the ring, so eviction cannot take it away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnclaimedOutcome {
    pub task_id: TaskId,
    pub submitter: NodeId,
    pub outcome: TaskOutcome,
}

/// Per-member counters for one executor name.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalExecutorStats {
    pub pending: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}
