//! Worker Pool / Admission Gate
//!
//! Bookkeeping for one `(executor, partition)` unit: at most `pool_size`
//! tasks run at once and at most `queue_capacity` wait in a FIFO holding
//! area. A submission that finds both full is rejected.
//!
//! The pool does not spawn anything itself; the partition container starts a
//! worker for every `Admission::Started` and keeps a worker alive for as long
//! as `finish` hands it the next queued task.

use super::types::{TaskEnvelope, TaskId};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A worker slot was free; the task runs immediately.
    Started,
    /// The task waits in the holding area.
    Queued,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    NotFound,
    /// Removed from the holding area before it ever ran.
    Dequeued,
    /// Running; flagged as cancelled (and aborted when interruption was allowed).
    Flagged,
    /// Already flagged by an earlier cancellation.
    AlreadyCancelled,
}

pub struct QueuedTask {
    pub task_id: TaskId,
    pub task: TaskEnvelope,
}

/// What a worker learns when its task finishes.
pub struct Finished {
    /// A cancellation already won the race; the result must be discarded.
    pub cancelled: bool,
    /// Oldest queued task, already moved to the running set.
    pub next: Option<QueuedTask>,
}

#[derive(Default)]
struct RunningTask {
    abort: Option<AbortHandle>,
    cancelled: bool,
    interrupt: bool,
}

#[derive(Default)]
struct PoolInner {
    running: HashMap<TaskId, RunningTask>,
    pending: VecDeque<QueuedTask>,
}

pub struct WorkerPool {
    pool_size: usize,
    queue_capacity: usize,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new(pool_size: usize, queue_capacity: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            queue_capacity,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn admit(&self, task_id: TaskId, task: TaskEnvelope) -> Admission {
        let mut inner = self.inner.lock();
        if inner.running.len() < self.pool_size {
            inner.running.insert(task_id, RunningTask::default());
            Admission::Started
        } else if inner.pending.len() < self.queue_capacity {
            inner.pending.push_back(QueuedTask { task_id, task });
            Admission::Queued
        } else {
            Admission::Rejected
        }
    }

    /// Admission that ignores the queue bound. Used when a promoted member
    /// takes over tasks that were already accepted by the previous owner.
    pub fn admit_forced(&self, task_id: TaskId, task: TaskEnvelope) -> Admission {
        let mut inner = self.inner.lock();
        if inner.running.len() < self.pool_size {
            inner.running.insert(task_id, RunningTask::default());
            Admission::Started
        } else {
            inner.pending.push_back(QueuedTask { task_id, task });
            Admission::Queued
        }
    }

    /// Records the abort handle of a running task. If a cancellation with
    /// interruption arrived before the handle existed, aborts right away.
    pub fn attach(&self, task_id: TaskId, abort: AbortHandle) {
        let mut inner = self.inner.lock();
        if let Some(running) = inner.running.get_mut(&task_id) {
            if running.cancelled && running.interrupt {
                abort.abort();
            }
            running.abort = Some(abort);
        } else {
            // Halted or drained while starting.
            abort.abort();
        }
    }

    pub fn finish(&self, task_id: TaskId) -> Finished {
        let mut inner = self.inner.lock();
        let cancelled = inner
            .running
            .remove(&task_id)
            .map(|running| running.cancelled)
            .unwrap_or(true);

        let next = if inner.running.len() < self.pool_size {
            inner.pending.pop_front()
        } else {
            None
        };
        if let Some(next) = &next {
            inner.running.insert(next.task_id, RunningTask::default());
        }

        Finished { cancelled, next }
    }

    pub fn cancel(&self, task_id: TaskId, may_interrupt: bool) -> CancelDecision {
        let mut inner = self.inner.lock();

        if let Some(position) = inner.pending.iter().position(|q| q.task_id == task_id) {
            inner.pending.remove(position);
            return CancelDecision::Dequeued;
        }

        match inner.running.get_mut(&task_id) {
            None => CancelDecision::NotFound,
            Some(running) if running.cancelled => CancelDecision::AlreadyCancelled,
            Some(running) => {
                running.cancelled = true;
                running.interrupt = may_interrupt;
                if may_interrupt && let Some(abort) = &running.abort {
                    abort.abort();
                }
                CancelDecision::Flagged
            }
        }
    }

    /// Empties the holding area and interrupts every running task.
    ///
    /// Returns `(drained pending ids, interrupted running ids)`.
    pub fn drain(&self) -> (Vec<TaskId>, Vec<TaskId>) {
        let mut inner = self.inner.lock();
        let pending: Vec<TaskId> = inner.pending.drain(..).map(|q| q.task_id).collect();

        let mut interrupted = Vec::new();
        for (task_id, running) in inner.running.iter_mut() {
            if running.cancelled {
                continue;
            }
            running.cancelled = true;
            running.interrupt = true;
            if let Some(abort) = &running.abort {
                abort.abort();
            }
            interrupted.push(*task_id);
        }

        (pending, interrupted)
    }

    /// Aborts everything and forgets all bookkeeping. Returns how many tasks
    /// were in flight.
    pub fn halt(&self) -> usize {
        let mut inner = self.inner.lock();
        let in_flight = inner.running.len() + inner.pending.len();
        for running in inner.running.values() {
            if let Some(abort) = &running.abort {
                abort.abort();
            }
        }
        inner.running.clear();
        inner.pending.clear();
        in_flight
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        let inner = self.inner.lock();
        inner.running.contains_key(&task_id) || inner.pending.iter().any(|q| q.task_id == task_id)
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.running.is_empty() && inner.pending.is_empty()
    }
}
