//! Partition Container
//!
//! All executor state for one `(executor name, partition)` pair on one
//! member: the result ring, the in-flight table, the sequence counter, the
//! worker pool and the clients waiting for results.
//!
//! ## Responsibilities
//! - **Single writer**: every mutation happens under the container lock, and
//!   only while the container is primary.
//! - **Replication**: each slot write is pushed to the partition backups
//!   before the lock is released and before waiters are answered.
//! - **Handover**: `demote` stops a primary without writing anything, and
//!   `promote` re-admits every task that was admitted but never finished.
//!
//! In-flight tasks keep their payload in the in-flight table; the ring only
//! holds a marker for them. The marker is written unconditionally at
//! admission, which is what evicts the slot's previous occupant. Later writes
//! for a task only land while the task still owns its slot.
//!
//! A submitter's own future does not depend on the ring: an outcome that
//! finishes before the submitter asks for it is parked as unclaimed until
//! the claim arrives or the submitter leaves the cluster.

use super::engine::EngineContext;
use super::pool::{Admission, CancelDecision, WorkerPool};
use super::registry::ExecutionEnv;
use super::ring::{ResultRing, RingRead};
use super::task::TaskContext;
use super::types::*;
use crate::cluster::types::NodeId;
use crate::config::DurableExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, oneshot};

type ResultReply = oneshot::Sender<ExecutorResult<Option<TaskOutcome>>>;

struct Waiter {
    dispose: bool,
    /// The submitter collecting its own outcome.
    claim: bool,
    reply: ResultReply,
}

/// Recently assigned ids by submission id, so a resent `Submit` gets the id
/// it was given the first time.
struct SubmissionLog {
    ids: HashMap<String, TaskId>,
    order: VecDeque<String>,
    limit: usize,
}

impl SubmissionLog {
    fn new(limit: usize) -> Self {
        Self {
            ids: HashMap::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn get(&self, submission: &str) -> Option<TaskId> {
        self.ids.get(submission).copied()
    }

    fn record(&mut self, submission: String, task_id: TaskId) {
        if self.ids.insert(submission.clone(), task_id).is_none() {
            self.order.push_back(submission);
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn entries(&self) -> Vec<(String, TaskId)> {
        self.order
            .iter()
            .filter_map(|submission| {
                self.get(submission)
                    .map(|task_id| (submission.clone(), task_id))
            })
            .collect()
    }

    fn restore(&mut self, entries: Vec<(String, TaskId)>) {
        self.ids.clear();
        self.order.clear();
        for (submission, task_id) in entries {
            self.record(submission, task_id);
        }
    }
}

struct ContainerState {
    ring: ResultRing,
    in_flight: BTreeMap<TaskId, RingSlot>,
    next_sequence: u64,
    waiters: HashMap<TaskId, Vec<Waiter>>,
    unclaimed: HashMap<TaskId, UnclaimedOutcome>,
    submissions: SubmissionLog,
}

pub struct PartitionContainer {
    key: ContainerKey,
    state: Mutex<ContainerState>,
    pool: WorkerPool,
    /// Bumped on every demotion; workers started under an older generation
    /// finish without writing.
    generation: AtomicU64,
    primary: AtomicBool,
}

impl PartitionContainer {
    pub fn new(key: ContainerKey, config: &DurableExecutorConfig, primary: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(ContainerState {
                ring: ResultRing::new(config.capacity),
                in_flight: BTreeMap::new(),
                next_sequence: 0,
                waiters: HashMap::new(),
                unclaimed: HashMap::new(),
                submissions: SubmissionLog::new(2 * (config.capacity + config.pool_size)),
            }),
            pool: WorkerPool::new(config.pool_size, config.capacity),
            generation: AtomicU64::new(0),
            primary: AtomicBool::new(primary),
        })
    }

    pub fn key(&self) -> &ContainerKey {
        &self.key
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn ensure_primary(&self) -> ExecutorResult<()> {
        if self.is_primary() {
            Ok(())
        } else {
            Err(ExecutorError::NotOwner {
                partition: self.key.partition,
            })
        }
    }

    /// Admits a task. A `submission` that was already admitted gets its
    /// original id back without running the task again.
    pub async fn submit(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        task: TaskEnvelope,
        submission: String,
        submitter: Option<NodeId>,
    ) -> ExecutorResult<TaskId> {
        let mut state = self.state.lock().await;
        self.ensure_primary()?;

        if let Some(task_id) = state.submissions.get(&submission) {
            tracing::debug!("Submission {} already admitted to {} as {}", submission, self.key, task_id);
            return Ok(task_id);
        }

        let name = &self.key.name;
        if ctx.states.is_shutdown(name) {
            ctx.states.record_rejected(name);
            return Err(ExecutorError::Rejected(format!(
                "durable executor '{}' is shut down",
                name
            )));
        }

        let task_id = TaskId::new(self.key.partition, state.next_sequence);
        let admission = self.pool.admit(task_id, task.clone());
        let slot_state = match admission {
            Admission::Started => SlotState::Running,
            Admission::Queued => SlotState::Pending,
            Admission::Rejected => {
                ctx.states.record_rejected(name);
                tracing::debug!(
                    "Rejected task for {}: {} running, {} queued",
                    self.key,
                    self.pool.running_count(),
                    self.pool.pending_count()
                );
                return Err(ExecutorError::Rejected(format!(
                    "capacity of {} reached",
                    self.key
                )));
            }
        };

        state.next_sequence += 1;
        let mut slot = RingSlot::in_flight(task_id, slot_state, task.clone());
        slot.submitter = submitter;
        slot.submission = Some(submission.clone());
        state.submissions.record(submission, task_id);
        state.ring.put(slot.marker());
        state.in_flight.insert(task_id, slot.clone());
        ctx.states.task_admitted(name, admission == Admission::Queued);

        ctx.replicate(&self.key, slot, state.next_sequence).await;

        if admission == Admission::Started {
            self.spawn_worker(ctx, task_id, task);
        }

        tracing::debug!("Admitted task {} to {} ({:?})", task_id, self.key, slot_state);
        Ok(task_id)
    }

    fn spawn_worker(self: &Arc<Self>, ctx: &Arc<EngineContext>, task_id: TaskId, task: TaskEnvelope) {
        let generation = self.generation.load(Ordering::SeqCst);
        let container = self.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            container.run_worker(ctx, generation, task_id, task).await;
        });
    }

    /// Runs one task, then keeps taking queued tasks for as long as the pool
    /// hands them over.
    async fn run_worker(
        self: Arc<Self>,
        ctx: Arc<EngineContext>,
        generation: u64,
        task_id: TaskId,
        task: TaskEnvelope,
    ) {
        let mut next = Some((task_id, task));
        while let Some((task_id, task)) = next.take() {
            let outcome = self.execute(&ctx, task_id, task).await;
            next = self.complete(&ctx, generation, task_id, outcome).await;
        }
    }

    async fn execute(&self, ctx: &Arc<EngineContext>, task_id: TaskId, task: TaskEnvelope) -> TaskOutcome {
        let env = ExecutionEnv {
            ctx: TaskContext {
                member: ctx.local.clone(),
                executor: self.key.name.clone(),
                task_id,
            },
            node: ctx.node(),
            managed_context: ctx.managed_context.clone(),
        };

        let registry = ctx.registry.clone();
        let body = tokio::spawn(async move { registry.execute(task, env).await });
        self.pool.attach(task_id, body.abort_handle());

        match body.await {
            Ok(Ok(value)) => TaskOutcome::Completed(value),
            Ok(Err(e)) => {
                tracing::error!("Task {} in {} failed: {:#}", task_id, self.key, e);
                TaskOutcome::Failed(format!("{:#}", e))
            }
            Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
            Err(e) => {
                tracing::error!("Task {} in {} panicked: {}", task_id, self.key, e);
                TaskOutcome::Failed(format!("task panicked: {}", e))
            }
        }
    }

    /// Records the outcome of a finished task and returns the next queued
    /// task this worker should run.
    async fn complete(
        &self,
        ctx: &Arc<EngineContext>,
        generation: u64,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Option<(TaskId, TaskEnvelope)> {
        let mut state = self.state.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::trace!("Discarding outcome of {} from a demoted worker", task_id);
            return None;
        }

        let name = &self.key.name;
        let finished = self.pool.finish(task_id);

        // A cancellation already wrote the slot and answered the waiters.
        if !finished.cancelled {
            match &outcome {
                TaskOutcome::Cancelled => ctx.states.record_cancelled(name, false),
                TaskOutcome::Failed(_) => ctx.states.record_completed(name, true),
                TaskOutcome::Completed(_) => ctx.states.record_completed(name, false),
            }
            self.write_terminal(&mut state, ctx, task_id, outcome).await;
        }
        ctx.states.task_released(name, 1);

        let next = finished.next?;
        let running = state.in_flight.get_mut(&next.task_id).map(|slot| {
            slot.state = SlotState::Running;
            slot.clone()
        });
        if let Some(slot) = running {
            state.ring.update(slot.marker());
            ctx.replicate(&self.key, slot, state.next_sequence).await;
        }
        ctx.states.task_started(name);

        Some((next.task_id, next.task))
    }

    /// Retires an in-flight task: writes its terminal slot, replicates it,
    /// then answers every waiter still listening.
    ///
    /// Only a dispose waiter that is still listening disposes the result; a
    /// caller that gave up leaves the value retrievable. When the submitter
    /// is not among the waiters, the outcome is parked as unclaimed.
    async fn write_terminal(
        &self,
        state: &mut ContainerState,
        ctx: &Arc<EngineContext>,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) {
        let admitted = state.in_flight.remove(&task_id);
        let mut waiters = state.waiters.remove(&task_id).unwrap_or_default();
        waiters.retain(|waiter| !waiter.reply.is_closed());

        let dispose = admitted.as_ref().is_some_and(|slot| slot.dispose_on_completion)
            || waiters.iter().any(|waiter| waiter.dispose);
        let claimed = waiters.iter().any(|waiter| waiter.claim);
        let submitter = admitted
            .and_then(|slot| slot.submitter)
            .filter(|submitter| ctx.is_member(submitter));

        let mut slot = RingSlot::terminal(task_id, &outcome);
        if dispose {
            slot.state = SlotState::Disposed;
            slot.value = None;
            slot.failure = None;
        }
        if !state.ring.update(slot.clone()) {
            tracing::debug!("Outcome of {} not retained: slot taken by a later task", task_id);
        }
        ctx.replicate(&self.key, slot, state.next_sequence).await;

        // Backups hold the outcome until the submitter is known to have it.
        if let Some(submitter) = submitter.clone() {
            let unclaimed = UnclaimedOutcome {
                task_id,
                submitter,
                outcome: outcome.clone(),
            };
            ctx.replicate_unclaimed(&self.key, task_id, Some(unclaimed.clone()))
                .await;
            if !claimed {
                state.unclaimed.insert(task_id, unclaimed);
            }
        }

        for waiter in waiters {
            let _ = waiter.reply.send(Ok(Some(outcome.clone())));
        }

        if claimed && submitter.is_some() {
            ctx.replicate_unclaimed(&self.key, task_id, None).await;
        }
    }

    /// Resolves when `task_id` is terminal. `None` means the result was
    /// disposed.
    ///
    /// With `claim`, the submitter collects its parked outcome first, so its
    /// future resolves even after the ring slot was reused.
    pub async fn await_result(
        &self,
        ctx: &Arc<EngineContext>,
        task_id: TaskId,
        dispose: bool,
        claim: bool,
    ) -> ExecutorResult<Option<TaskOutcome>> {
        let receiver = {
            let mut state = self.state.lock().await;
            self.ensure_primary()?;

            if task_id.sequence() >= state.next_sequence {
                return Err(ExecutorError::StaleTaskId(task_id));
            }

            if claim && let Some(unclaimed) = state.unclaimed.remove(&task_id) {
                ctx.replicate_unclaimed(&self.key, task_id, None).await;
                return Ok(Some(unclaimed.outcome));
            }

            if !state.in_flight.contains_key(&task_id) {
                return self.read_terminal(&mut state, ctx, task_id, dispose).await;
            }

            let (reply, receiver) = oneshot::channel();
            let waiters = state.waiters.entry(task_id).or_default();
            waiters.retain(|waiter| !waiter.reply.is_closed());
            waiters.push(Waiter {
                dispose,
                claim,
                reply,
            });
            receiver
        };

        receiver.await.unwrap_or_else(|_| {
            Err(ExecutorError::MemberLeft(format!(
                "{} lost its owner while waiting",
                self.key
            )))
        })
    }

    async fn read_terminal(
        &self,
        state: &mut ContainerState,
        ctx: &Arc<EngineContext>,
        task_id: TaskId,
        dispose: bool,
    ) -> ExecutorResult<Option<TaskOutcome>> {
        let read = if dispose {
            state.ring.dispose_and_get(task_id)
        } else {
            state.ring.get(task_id)
        };

        match read {
            RingRead::Outcome(outcome) => {
                if dispose && let Some(slot) = state.ring.slot(task_id).cloned() {
                    ctx.replicate(&self.key, slot, state.next_sequence).await;
                }
                Ok(Some(outcome))
            }
            RingRead::Empty => Ok(None),
            RingRead::Stale | RingRead::InFlight => Err(ExecutorError::StaleTaskId(task_id)),
        }
    }

    /// Clears a terminal result, or arranges for an in-flight one to be
    /// cleared as soon as it is written.
    pub async fn dispose(&self, ctx: &Arc<EngineContext>, task_id: TaskId) -> ExecutorResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_primary()?;

        if let Some(slot) = state.in_flight.get_mut(&task_id) {
            slot.dispose_on_completion = true;
            let slot = slot.clone();
            ctx.replicate(&self.key, slot, state.next_sequence).await;
            return Ok(());
        }

        if let RingRead::Outcome(_) = state.ring.dispose_and_get(task_id)
            && let Some(slot) = state.ring.slot(task_id).cloned()
        {
            ctx.replicate(&self.key, slot, state.next_sequence).await;
            tracing::debug!("Disposed result of {}", task_id);
        }
        Ok(())
    }

    pub async fn cancel(
        &self,
        ctx: &Arc<EngineContext>,
        task_id: TaskId,
        may_interrupt: bool,
    ) -> ExecutorResult<bool> {
        let mut state = self.state.lock().await;
        self.ensure_primary()?;

        let name = &self.key.name;
        let decision = self.pool.cancel(task_id, may_interrupt);
        match decision {
            CancelDecision::NotFound | CancelDecision::AlreadyCancelled => Ok(false),
            CancelDecision::Dequeued | CancelDecision::Flagged => {
                let queued = decision == CancelDecision::Dequeued;
                ctx.states.record_cancelled(name, queued);
                if queued {
                    ctx.states.task_released(name, 1);
                }
                self.write_terminal(&mut state, ctx, task_id, TaskOutcome::Cancelled)
                    .await;

                tracing::info!(
                    "Cancelled task {} in {} ({})",
                    task_id,
                    self.key,
                    if queued { "queued" } else { "running" }
                );
                Ok(true)
            }
        }
    }

    /// Discards queued tasks and interrupts running ones. Returns the ids of
    /// the queued tasks that never started.
    pub async fn shutdown_now(&self, ctx: &Arc<EngineContext>) -> Vec<TaskId> {
        let mut state = self.state.lock().await;
        if !self.is_primary() {
            return Vec::new();
        }

        let name = &self.key.name;
        let (pending, interrupted) = self.pool.drain();

        for task_id in &pending {
            ctx.states.record_cancelled(name, true);
            self.write_terminal(&mut state, ctx, *task_id, TaskOutcome::Cancelled)
                .await;
        }
        ctx.states.task_released(name, pending.len());

        for task_id in &interrupted {
            ctx.states.record_cancelled(name, false);
            self.write_terminal(&mut state, ctx, *task_id, TaskOutcome::Cancelled)
                .await;
        }

        pending
    }

    /// Stops acting as primary. Running workers are aborted and will not
    /// write; in-flight records stay so the next primary can run them.
    pub async fn demote(&self, ctx: &Arc<EngineContext>) {
        let mut state = self.state.lock().await;
        let was_primary = self.primary.swap(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let halted = self.pool.halt();
        if halted > 0 {
            ctx.states.task_released(&self.key.name, halted);
        }

        for (_, waiters) in state.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.reply.send(Err(ExecutorError::MemberLeft(format!(
                    "{} moved to another member",
                    self.key
                ))));
            }
        }

        if was_primary {
            tracing::info!("Demoted {} ({} task(s) were in flight)", self.key, halted);
        }
    }

    /// Becomes primary and re-admits every task that was admitted but never
    /// finished, running it again from its retained payload.
    pub async fn promote(self: &Arc<Self>, ctx: &Arc<EngineContext>) {
        let mut state = self.state.lock().await;
        if self.primary.swap(true, Ordering::SeqCst) {
            return;
        }

        let name = &self.key.name;
        let mut started = Vec::new();
        let mut changed = Vec::new();

        for slot in state.in_flight.values_mut() {
            let Some(task) = slot.task.clone() else {
                tracing::warn!("In-flight task {} has no payload; skipping", slot.task_id);
                continue;
            };

            let admission = self.pool.admit_forced(slot.task_id, task.clone());
            slot.state = if admission == Admission::Started {
                started.push((slot.task_id, task));
                SlotState::Running
            } else {
                SlotState::Pending
            };
            ctx.states.task_admitted(name, admission == Admission::Queued);
            changed.push(slot.clone());
        }

        for slot in &changed {
            state.ring.update(slot.marker());
        }
        for slot in changed.iter().cloned() {
            ctx.replicate(&self.key, slot, state.next_sequence).await;
        }

        if !changed.is_empty() {
            tracing::info!(
                "Promoted {}: re-admitted {} in-flight task(s)",
                self.key,
                changed.len()
            );
        }

        for (task_id, task) in started {
            self.spawn_worker(ctx, task_id, task);
        }
    }

    pub async fn snapshot(&self) -> ContainerSnapshot {
        let state = self.state.lock().await;
        ContainerSnapshot {
            key: self.key.clone(),
            capacity: state.ring.capacity(),
            next_sequence: state.next_sequence,
            slots: state.ring.snapshot(),
            in_flight: state.in_flight.values().cloned().collect(),
            unclaimed: state.unclaimed.values().cloned().collect(),
            submissions: state.submissions.entries(),
        }
    }

    pub async fn next_sequence(&self) -> u64 {
        self.state.lock().await.next_sequence
    }

    /// Replaces the whole state with a snapshot. Ignored while primary.
    pub async fn restore(&self, snapshot: ContainerSnapshot) {
        let mut state = self.state.lock().await;
        if self.is_primary() {
            tracing::warn!("Ignoring snapshot for {}: this member is primary", self.key);
            return;
        }

        state.ring.restore(snapshot.slots);
        state.in_flight = snapshot
            .in_flight
            .into_iter()
            .map(|slot| (slot.task_id, slot))
            .collect();
        state.next_sequence = snapshot.next_sequence;
        state.unclaimed = snapshot
            .unclaimed
            .into_iter()
            .map(|unclaimed| (unclaimed.task_id, unclaimed))
            .collect();
        state.submissions.restore(snapshot.submissions);

        tracing::debug!(
            "Restored {} up to sequence {} ({} in flight)",
            self.key,
            state.next_sequence,
            state.in_flight.len()
        );
    }

    /// Applies one slot write received from the primary.
    pub async fn apply_replica(&self, slot: RingSlot, next_sequence: u64) {
        let mut state = self.state.lock().await;
        if self.is_primary() {
            tracing::debug!("Ignoring replica of {} for {}: this member is primary", slot.task_id, self.key);
            return;
        }

        state.next_sequence = state.next_sequence.max(next_sequence);

        if slot.state.is_in_flight() {
            if let Some(submission) = &slot.submission {
                state.submissions.record(submission.clone(), slot.task_id);
            }
            if state.in_flight.contains_key(&slot.task_id) {
                state.ring.update(slot.marker());
            } else if !state.ring.holds_newer_than(slot.task_id) {
                state.ring.put(slot.marker());
            }
            state.in_flight.insert(slot.task_id, slot);
        } else {
            state.in_flight.remove(&slot.task_id);
            state.ring.update(slot);
        }
    }

    /// Tracks an outcome parked for its submitter (`Some`) or collected by
    /// it (`None`), as reported by the primary.
    pub async fn apply_unclaimed(&self, task_id: TaskId, unclaimed: Option<UnclaimedOutcome>) {
        let mut state = self.state.lock().await;
        if self.is_primary() {
            return;
        }
        match unclaimed {
            Some(unclaimed) => state.unclaimed.insert(task_id, unclaimed),
            None => state.unclaimed.remove(&task_id),
        };
    }

    /// Drops outcomes parked for submitters that are no longer members.
    pub async fn forget_departed_submitters(&self, ctx: &Arc<EngineContext>) {
        let mut state = self.state.lock().await;
        let before = state.unclaimed.len();
        state
            .unclaimed
            .retain(|_, unclaimed| ctx.is_member(&unclaimed.submitter));

        let dropped = before - state.unclaimed.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} unclaimed outcome(s) of departed submitters in {}", dropped, self.key);
        }
    }
}
