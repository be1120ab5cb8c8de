//! Client-side durable executor.
//!
//! A `DurableExecutorService` is a cheap handle for one executor name on one
//! member. It encodes each task once, routes it to the partition owner and
//! hands back a [`DurableFuture`] that a background watcher resolves when the
//! owner reports the task terminal. Failures after encoding never surface as
//! `Err` from `submit`; they resolve the returned future instead.
//!
//! Every submission carries a fresh submission id, so the invoker can resend
//! it after a lost reply without the task being admitted twice.

use super::future::{CancelTask, Completion, Decoder, DurableFuture, FutureCore, decode_optional, decode_raw, decode_value};
use super::invocation::Invoker;
use super::protocol::{Operation, OperationResponse};
use super::task::Task;
use super::types::*;
use crate::error::{ExecutorError, ExecutorResult};
use crate::node::ClusterNode;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct DurableExecutorService {
    name: String,
    node: ClusterNode,
}

impl DurableExecutorService {
    pub(crate) fn new(name: &str, node: ClusterNode) -> Self {
        Self {
            name: name.to_string(),
            node,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits to the partition of the task's own key, or of a fresh random
    /// key when the task has none.
    pub async fn submit<T: Task>(&self, task: T) -> DurableFuture<T::Output> {
        let key = task
            .partition_key()
            .unwrap_or_else(|| self.node.partitioner().random_key());
        self.submit_to_key_owner(task, &key).await
    }

    pub async fn submit_to_key_owner<T: Task>(&self, task: T, key: &str) -> DurableFuture<T::Output> {
        match encode_task(&task) {
            Ok(envelope) => self.submit_encoded(envelope, key, decode_value::<T::Output>).await,
            Err(e) => DurableFuture::failed(e, decode_value::<T::Output>),
        }
    }

    /// Fire-and-forget submission. The task is still durable; only the
    /// admission outcome is reported.
    pub async fn execute<T: Task>(&self, task: T) -> ExecutorResult<()> {
        let key = task
            .partition_key()
            .unwrap_or_else(|| self.node.partitioner().random_key());
        self.execute_on_key_owner(task, &key).await
    }

    pub async fn execute_on_key_owner<T: Task>(&self, task: T, key: &str) -> ExecutorResult<()> {
        let envelope = encode_task(&task)?;
        self.send_submission(envelope, key, false).await.map(|_| ())
    }

    /// Submission of an already-encoded task. `None` fails with
    /// `InvalidArgument` before anything is sent.
    pub async fn submit_envelope(
        &self,
        envelope: Option<TaskEnvelope>,
        key: Option<&str>,
    ) -> ExecutorResult<DurableFuture<Option<Vec<u8>>>> {
        let envelope = envelope
            .ok_or_else(|| ExecutorError::InvalidArgument("task must not be null".to_string()))?;
        let key = key
            .map(str::to_string)
            .unwrap_or_else(|| self.node.partitioner().random_key());
        Ok(self.submit_encoded(envelope, &key, decode_raw).await)
    }

    async fn submit_encoded<V: Send + 'static>(
        &self,
        envelope: TaskEnvelope,
        key: &str,
        decode: Decoder<V>,
    ) -> DurableFuture<V> {
        match self.send_submission(envelope, key, true).await {
            Ok(task_id) => self.watch(task_id, false, decode, true),
            Err(e) => {
                tracing::debug!("Submission to '{}' failed: {}", self.name, e);
                DurableFuture::failed(e, decode)
            }
        }
    }

    /// With `awaited`, the owner parks the outcome for this member until its
    /// future collects it.
    async fn send_submission(&self, envelope: TaskEnvelope, key: &str, awaited: bool) -> ExecutorResult<TaskId> {
        let states = self.node.states();
        if states.is_shutdown(&self.name) {
            states.record_rejected(&self.name);
            return Err(ExecutorError::Rejected(format!(
                "durable executor '{}' is shut down",
                self.name
            )));
        }

        let partition = self.node.partitioner().get_partition(key);
        let op = Operation::Submit {
            name: self.name.clone(),
            partition,
            task: envelope,
            submission: uuid::Uuid::new_v4().to_string(),
            submitter: awaited.then(|| self.node.id().clone()),
        };

        match self.node.invoker().invoke_on_partition(partition, op).await? {
            OperationResponse::TaskId(task_id) => Ok(task_id),
            other => Err(unexpected(other)),
        }
    }

    /// A future resolved by a background wait on the owner of `task_id`.
    ///
    /// `submitted` marks the submitter's own future: it claims the parked
    /// outcome and can cancel the task. A disposing wait is abandoned once
    /// every handle of its future is dropped, so nothing is disposed on
    /// behalf of a caller that stopped listening.
    fn watch<V: Send + 'static>(
        &self,
        task_id: TaskId,
        dispose: bool,
        decode: Decoder<V>,
        submitted: bool,
    ) -> DurableFuture<V> {
        let core = FutureCore::new();
        let invoker = self.node.invoker().clone();

        let watcher = {
            let core = core.clone();
            let invoker = invoker.clone();
            let op = Operation::AwaitResult {
                name: self.name.clone(),
                task_id,
                dispose,
                claim: submitted,
            };
            async move {
                let completion = match invoker.invoke_on_partition(task_id.partition(), op).await {
                    Ok(OperationResponse::Outcome(outcome)) => completion_of(outcome),
                    Ok(other) => Err(unexpected(other)),
                    Err(e) => Err(e),
                };
                core.complete(completion);
            }
        };
        let watcher = tokio::spawn(watcher);

        let cancel = submitted.then(|| {
            Arc::new(RemoteCancel {
                invoker,
                name: self.name.clone(),
            }) as Arc<dyn CancelTask>
        });
        let future = DurableFuture::new(Some(task_id), core, decode, cancel);
        if dispose {
            future.abort_when_dropped(watcher.abort_handle())
        } else {
            future
        }
    }

    /// Result of an earlier submission: `None` once it has been disposed.
    pub fn retrieve_result<V: DeserializeOwned + Send + 'static>(&self, task_id: TaskId) -> DurableFuture<Option<V>> {
        self.watch(task_id, false, decode_optional::<V>, false)
    }

    /// Like [`retrieve_result`](Self::retrieve_result), clearing the slot in
    /// the same step so no later reader sees the value. The result is only
    /// cleared when it is handed to this future; dropping the future before
    /// the task finishes leaves the result in place.
    pub fn retrieve_and_dispose_result<V: DeserializeOwned + Send + 'static>(
        &self,
        task_id: TaskId,
    ) -> DurableFuture<Option<V>> {
        self.watch(task_id, true, decode_optional::<V>, false)
    }

    /// Retrieval that leaves the encoded value undecoded.
    pub fn retrieve_encoded_result(&self, task_id: TaskId, dispose: bool) -> DurableFuture<Option<Vec<u8>>> {
        self.watch(task_id, dispose, decode_raw, false)
    }

    pub async fn dispose_result(&self, task_id: TaskId) -> ExecutorResult<()> {
        let op = Operation::DisposeResult {
            name: self.name.clone(),
            task_id,
        };
        match self.node.invoker().invoke_on_partition(task_id.partition(), op).await? {
            OperationResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Stops accepting tasks on every member; admitted tasks still run.
    pub async fn shutdown(&self) {
        self.broadcast_shutdown(false).await;
    }

    /// Stops accepting tasks, discards queued ones and interrupts running
    /// ones. Returns the ids of the queued tasks that never ran.
    pub async fn shutdown_now(&self) -> Vec<TaskId> {
        self.broadcast_shutdown(true).await
    }

    async fn broadcast_shutdown(&self, now: bool) -> Vec<TaskId> {
        self.node.states().shutdown(&self.name);

        let op = Operation::Shutdown {
            name: self.name.clone(),
            now,
        };
        let mut drained = Vec::new();
        for (member, reply) in self.node.invoker().broadcast(op).await {
            match reply {
                Ok(OperationResponse::Drained(ids)) => drained.extend(ids),
                Ok(other) => tracing::warn!("Unexpected shutdown reply from {}: {:?}", member, other),
                Err(e) => tracing::warn!("Shutdown of '{}' not confirmed by {}: {}", self.name, member, e),
            }
        }
        drained.sort();
        drained
    }

    pub fn is_shutdown(&self) -> bool {
        self.node.states().is_shutdown(&self.name)
    }

    pub fn is_terminated(&self) -> bool {
        self.node.states().is_terminated(&self.name)
    }

    /// Waits for this member's share of the executor to terminate. Returns
    /// `false` on timeout, and immediately when already terminated.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.node.states().await_termination(&self.name, timeout).await
    }

    pub fn local_stats(&self) -> LocalExecutorStats {
        self.node.states().stats(&self.name)
    }
}

fn encode_task<T: Task>(task: &T) -> ExecutorResult<TaskEnvelope> {
    Ok(TaskEnvelope {
        task_type: T::TYPE_NAME.to_string(),
        kind: T::KIND,
        payload: bincode::serialize(task)?,
    })
}

fn completion_of(outcome: Option<TaskOutcome>) -> Completion {
    match outcome {
        None => Ok(None),
        Some(TaskOutcome::Completed(value)) => Ok(value),
        Some(TaskOutcome::Failed(cause)) => Err(ExecutorError::Execution { cause }),
        Some(TaskOutcome::Cancelled) => Err(ExecutorError::Cancelled),
    }
}

fn unexpected(response: OperationResponse) -> ExecutorError {
    ExecutorError::Transport(format!("unexpected response: {:?}", response))
}

struct RemoteCancel {
    invoker: Arc<Invoker>,
    name: String,
}

#[async_trait]
impl CancelTask for RemoteCancel {
    async fn cancel(&self, task_id: TaskId, may_interrupt: bool) -> ExecutorResult<bool> {
        let op = Operation::Cancel {
            name: self.name.clone(),
            task_id,
            may_interrupt,
        };
        match self.invoker.invoke_on_partition(task_id.partition(), op).await? {
            OperationResponse::Cancelled(cancelled) => Ok(cancelled),
            other => Err(unexpected(other)),
        }
    }
}
