//! Future/Callback Engine
//!
//! A [`DurableFuture`] correlates a task id with its eventual outcome. The
//! shared core holds the completion, once fixed, and a queue of callbacks
//! that have not run yet, all behind one mutex.
//!
//! Callbacks run exactly once, one at a time, in registration order. Whoever
//! fixes the completion drains the queue; a callback registered later runs
//! on the registering thread, unless a delivery is still in progress, in
//! which case it is queued and run by the delivering thread.

use super::types::TaskId;
use crate::error::{ExecutorError, ExecutorResult};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Raw completion: encoded value bytes (if any) or the failure.
pub type Completion = ExecutorResult<Option<Vec<u8>>>;

type RawCallback = Box<dyn FnOnce(&Completion) + Send>;

/// Receives the outcome of a future exactly once per registration.
pub trait ExecutionCallback<T>: Send + Sync + 'static {
    fn on_response(&self, response: T);
    fn on_failure(&self, error: ExecutorError);
}

impl<T, C: ExecutionCallback<T>> ExecutionCallback<T> for Arc<C> {
    fn on_response(&self, response: T) {
        (**self).on_response(response)
    }

    fn on_failure(&self, error: ExecutorError) {
        (**self).on_failure(error)
    }
}

/// Adapts a closure over `ExecutorResult<T>` into an [`ExecutionCallback`].
pub struct FnCallback<F>(pub F);

impl<T, F> ExecutionCallback<T> for FnCallback<F>
where
    F: Fn(ExecutorResult<T>) + Send + Sync + 'static,
{
    fn on_response(&self, response: T) {
        (self.0)(Ok(response))
    }

    fn on_failure(&self, error: ExecutorError) {
        (self.0)(Err(error))
    }
}

struct CoreState {
    completion: Option<Completion>,
    /// Callbacks not run yet, oldest first.
    callbacks: VecDeque<RawCallback>,
    /// Set while some thread is draining `callbacks`.
    delivering: bool,
}

/// Shared completion state behind every clone of a future.
pub struct FutureCore {
    state: Mutex<CoreState>,
    done: watch::Sender<bool>,
}

impl FutureCore {
    pub fn new() -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(CoreState {
                completion: None,
                callbacks: VecDeque::new(),
                delivering: false,
            }),
            done,
        })
    }

    pub fn completed(completion: Completion) -> Arc<Self> {
        let core = Self::new();
        core.complete(completion);
        core
    }

    /// Fixes the completion. Returns `false` if it was already fixed, in
    /// which case `completion` is discarded.
    pub fn complete(&self, completion: Completion) -> bool {
        {
            let mut state = self.state.lock();
            if state.completion.is_some() {
                return false;
            }
            state.completion = Some(completion.clone());
            state.delivering = true;
        }

        self.done.send_replace(true);
        self.deliver(&completion);
        true
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().completion.is_some()
    }

    fn peek(&self) -> Option<Completion> {
        self.state.lock().completion.clone()
    }

    fn register(&self, callback: RawCallback) {
        let completion = {
            let mut state = self.state.lock();
            state.callbacks.push_back(callback);
            if state.delivering {
                return;
            }
            let Some(completion) = state.completion.clone() else {
                return;
            };
            state.delivering = true;
            completion
        };
        self.deliver(&completion);
    }

    /// Runs queued callbacks until the queue is empty. The lock is released
    /// around each call, so a callback may register further callbacks.
    fn deliver(&self, completion: &Completion) {
        loop {
            let callback = {
                let mut state = self.state.lock();
                match state.callbacks.pop_front() {
                    Some(callback) => callback,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            callback(completion);
        }
    }

    async fn wait(&self) -> Completion {
        let mut done = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = done.wait_for(|done| *done).await;
        self.peek()
            .unwrap_or_else(|| Err(ExecutorError::MemberLeft("future abandoned".to_string())))
    }
}

/// Turns raw completion bytes into the caller's type.
pub type Decoder<T> = fn(Option<&[u8]>) -> ExecutorResult<T>;

/// Decoder for submission futures: the task's own return value.
pub fn decode_value<T: DeserializeOwned>(bytes: Option<&[u8]>) -> ExecutorResult<T> {
    // Runnables complete without bytes; `()` decodes from an empty slice.
    Ok(bincode::deserialize(bytes.unwrap_or(&[]))?)
}

/// Decoder for retrieval futures: `None` when the result was disposed or the
/// task produced no value.
pub fn decode_optional<T: DeserializeOwned>(bytes: Option<&[u8]>) -> ExecutorResult<Option<T>> {
    match bytes {
        None => Ok(None),
        Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
    }
}

/// Decoder that hands back the encoded bytes untouched.
pub fn decode_raw(bytes: Option<&[u8]>) -> ExecutorResult<Option<Vec<u8>>> {
    Ok(bytes.map(|bytes| bytes.to_vec()))
}

/// Client-visible handle for a submitted task or a result retrieval.
pub struct DurableFuture<T> {
    task_id: Option<TaskId>,
    core: Arc<FutureCore>,
    decode: Decoder<T>,
    cancel: Option<Arc<dyn CancelTask>>,
    watcher: Option<Arc<WatcherGuard>>,
    _marker: PhantomData<fn() -> T>,
}

/// Aborts the background watcher once no handle of the future is left.
struct WatcherGuard(AbortHandle);

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Routes a cancellation request to the member that owns the task.
#[async_trait::async_trait]
pub trait CancelTask: Send + Sync {
    async fn cancel(&self, task_id: TaskId, may_interrupt: bool) -> ExecutorResult<bool>;
}

impl<T> Clone for DurableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id,
            core: self.core.clone(),
            decode: self.decode,
            cancel: self.cancel.clone(),
            watcher: self.watcher.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> DurableFuture<T> {
    pub fn new(
        task_id: Option<TaskId>,
        core: Arc<FutureCore>,
        decode: Decoder<T>,
        cancel: Option<Arc<dyn CancelTask>>,
    ) -> Self {
        Self {
            task_id,
            core,
            decode,
            cancel,
            watcher: None,
            _marker: PhantomData,
        }
    }

    /// Ties the background watcher to this future: dropping the last handle
    /// aborts it. Pending callbacks keep it alive.
    pub(crate) fn abort_when_dropped(mut self, watcher: AbortHandle) -> Self {
        self.watcher = Some(Arc::new(WatcherGuard(watcher)));
        self
    }

    /// A future that is already resolved with `error`.
    pub fn failed(error: ExecutorError, decode: Decoder<T>) -> Self {
        Self::new(None, FutureCore::completed(Err(error)), decode, None)
    }

    /// `None` when the submission never reached the partition owner.
    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// Waits for the terminal outcome. Once done, repeated calls decode the
    /// cached completion without contacting the cluster again.
    pub async fn get(&self) -> ExecutorResult<T> {
        let completion = match self.core.peek() {
            Some(completion) => completion,
            None => self.core.wait().await,
        };
        self.resolve(&completion)
    }

    pub async fn get_timeout(&self, timeout: Duration) -> ExecutorResult<T> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| ExecutorError::Timeout)?
    }

    /// Asks the owner to cancel the task. When the cancellation wins, the
    /// future resolves with [`ExecutorError::Cancelled`].
    pub async fn cancel(&self, may_interrupt: bool) -> ExecutorResult<bool> {
        if self.is_done() {
            return Ok(false);
        }
        let (Some(task_id), Some(cancel)) = (self.task_id, &self.cancel) else {
            return Ok(false);
        };

        let cancelled = cancel.cancel(task_id, may_interrupt).await?;
        if cancelled {
            self.core.complete(Err(ExecutorError::Cancelled));
        }
        Ok(cancelled)
    }

    /// Registers a callback; it runs exactly once, now if the future is
    /// already done, otherwise at completion.
    pub fn and_then<C: ExecutionCallback<T>>(&self, callback: C) {
        let decode = self.decode;
        let watcher = self.watcher.clone();
        self.core.register(Box::new(move |completion: &Completion| {
            let _watcher = watcher;
            match resolve_with(decode, completion) {
                Ok(value) => callback.on_response(value),
                Err(error) => callback.on_failure(error),
            }
        }));
    }

    fn resolve(&self, completion: &Completion) -> ExecutorResult<T> {
        resolve_with(self.decode, completion)
    }
}

fn resolve_with<T>(decode: Decoder<T>, completion: &Completion) -> ExecutorResult<T> {
    match completion {
        Ok(bytes) => decode(bytes.as_deref()),
        Err(error) => Err(error.clone()),
    }
}
