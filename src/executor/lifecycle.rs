//! Lifecycle Manager
//!
//! Per-member record of every executor name's shutdown state, owned by the
//! node and handed to the engine and the client-side services by `Arc`.
//!
//! ```text
//! Active --shutdown / shutdown_now--> ShuttingDown --(no tasks left)--> Terminated
//! ```
//!
//! A cluster-level shutdown of the member short-circuits every name straight
//! to `Terminated`, including names first looked up afterwards.

use super::types::LocalExecutorStats;

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Active,
    ShuttingDown,
    Terminated,
}

struct ExecutorLifecycle {
    phase: LifecyclePhase,
    /// Admitted tasks (queued or running) not yet finished on this member.
    active_tasks: usize,
    terminated: watch::Sender<bool>,
    stats: LocalExecutorStats,
}

impl ExecutorLifecycle {
    fn new() -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            phase: LifecyclePhase::Active,
            active_tasks: 0,
            terminated,
            stats: LocalExecutorStats::default(),
        }
    }

    fn terminate_if_drained(&mut self, name: &str) {
        if self.phase == LifecyclePhase::ShuttingDown && self.active_tasks == 0 {
            self.phase = LifecyclePhase::Terminated;
            self.terminated.send_replace(true);
            tracing::info!("Durable executor '{}' terminated", name);
        }
    }
}

pub struct ExecutorStates {
    executors: DashMap<String, ExecutorLifecycle>,
    cluster_shutdown: AtomicBool,
}

impl ExecutorStates {
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
            cluster_shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_cluster_shutdown(&self) -> bool {
        self.cluster_shutdown.load(Ordering::SeqCst)
    }

    pub fn phase(&self, name: &str) -> LifecyclePhase {
        if self.is_cluster_shutdown() {
            return LifecyclePhase::Terminated;
        }
        self.executors
            .get(name)
            .map(|entry| entry.phase)
            .unwrap_or(LifecyclePhase::Active)
    }

    pub fn is_shutdown(&self, name: &str) -> bool {
        self.phase(name) != LifecyclePhase::Active
    }

    pub fn is_terminated(&self, name: &str) -> bool {
        self.phase(name) == LifecyclePhase::Terminated
    }

    /// Stops admitting tasks for `name`. Idempotent; a repeated call never
    /// moves the executor backwards.
    pub fn shutdown(&self, name: &str) {
        let mut entry = self
            .executors
            .entry(name.to_string())
            .or_insert_with(ExecutorLifecycle::new);
        if entry.phase == LifecyclePhase::Active {
            tracing::info!("Durable executor '{}' shutting down", name);
            entry.phase = LifecyclePhase::ShuttingDown;
        }
        entry.terminate_if_drained(name);
    }

    /// Forces every executor on this member to `Terminated`; used when the
    /// member itself leaves the cluster.
    pub fn shutdown_cluster(&self) {
        self.cluster_shutdown.store(true, Ordering::SeqCst);
        for mut entry in self.executors.iter_mut() {
            entry.phase = LifecyclePhase::Terminated;
            entry.terminated.send_replace(true);
        }
        tracing::info!("All durable executors on this member terminated");
    }

    pub fn task_admitted(&self, name: &str, queued: bool) {
        let mut entry = self
            .executors
            .entry(name.to_string())
            .or_insert_with(ExecutorLifecycle::new);
        entry.active_tasks += 1;
        if queued {
            entry.stats.pending += 1;
        } else {
            entry.stats.started += 1;
        }
    }

    /// A queued task was handed to a worker.
    pub fn task_started(&self, name: &str) {
        if let Some(mut entry) = self.executors.get_mut(name) {
            entry.stats.pending = entry.stats.pending.saturating_sub(1);
            entry.stats.started += 1;
        }
    }

    /// An admitted task left this member's pool: finished, cancelled, drained
    /// or dropped by a halt.
    pub fn task_released(&self, name: &str, count: usize) {
        if let Some(mut entry) = self.executors.get_mut(name) {
            entry.active_tasks = entry.active_tasks.saturating_sub(count);
            entry.terminate_if_drained(name);
        }
    }

    pub fn record_completed(&self, name: &str, failed: bool) {
        if let Some(mut entry) = self.executors.get_mut(name) {
            if failed {
                entry.stats.failed += 1;
            } else {
                entry.stats.completed += 1;
            }
        }
    }

    pub fn record_cancelled(&self, name: &str, was_queued: bool) {
        if let Some(mut entry) = self.executors.get_mut(name) {
            entry.stats.cancelled += 1;
            if was_queued {
                entry.stats.pending = entry.stats.pending.saturating_sub(1);
            }
        }
    }

    pub fn record_rejected(&self, name: &str) {
        self.executors
            .entry(name.to_string())
            .or_insert_with(ExecutorLifecycle::new)
            .stats
            .rejected += 1;
    }

    pub fn stats(&self, name: &str) -> LocalExecutorStats {
        self.executors
            .get(name)
            .map(|entry| entry.stats)
            .unwrap_or_default()
    }

    /// Waits for `name` to reach `Terminated`.
    ///
    /// Returns `false` straight away when the executor is already terminated,
    /// and `false` when the timeout elapses first.
    pub async fn await_termination(&self, name: &str, timeout: Duration) -> bool {
        if self.is_terminated(name) {
            return false;
        }

        let mut terminated = self
            .executors
            .entry(name.to_string())
            .or_insert_with(ExecutorLifecycle::new)
            .terminated
            .subscribe();

        matches!(
            tokio::time::timeout(timeout, terminated.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

impl Default for ExecutorStates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_idle_executor_terminates_on_shutdown() {
        let states = ExecutorStates::new();
        assert!(!states.is_shutdown("exec"));
        assert!(!states.is_terminated("exec"));

        states.shutdown("exec");

        assert!(states.is_shutdown("exec"));
        assert!(states.is_terminated("exec"));
    }

    #[test]
    fn test_busy_executor_terminates_after_drain() {
        let states = ExecutorStates::new();
        states.task_admitted("exec", false);
        states.task_admitted("exec", true);

        states.shutdown("exec");
        assert_eq!(states.phase("exec"), LifecyclePhase::ShuttingDown);

        states.task_released("exec", 1);
        assert!(!states.is_terminated("exec"));
        states.task_released("exec", 1);
        assert!(states.is_terminated("exec"));
    }

    #[test]
    fn test_repeated_shutdown_is_idempotent() {
        let states = ExecutorStates::new();
        states.shutdown("exec");
        states.shutdown("exec");
        assert_eq!(states.phase("exec"), LifecyclePhase::Terminated);
    }

    #[test]
    fn test_cluster_shutdown_covers_unknown_names() {
        let states = ExecutorStates::new();
        states.shutdown_cluster();
        assert!(states.is_shutdown("never-used"));
        assert!(states.is_terminated("never-used"));
    }

    #[tokio::test]
    async fn test_await_termination_on_terminated_returns_false() {
        let states = ExecutorStates::new();
        states.shutdown("exec");
        assert!(!states.await_termination("exec", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_await_termination_wakes_when_drained() {
        let states = Arc::new(ExecutorStates::new());
        states.task_admitted("exec", false);
        states.shutdown("exec");

        let waiter = {
            let states = states.clone();
            tokio::spawn(async move { states.await_termination("exec", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        states.task_released("exec", 1);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_await_termination_times_out() {
        let states = ExecutorStates::new();
        states.task_admitted("exec", false);
        states.shutdown("exec");
        assert!(!states.await_termination("exec", Duration::from_millis(50)).await);
    }

    #[test]
    fn test_stats_counters() {
        let states = ExecutorStates::new();
        states.task_admitted("exec", true);
        states.task_started("exec");
        states.record_completed("exec", false);
        states.record_rejected("exec");

        let stats = states.stats("exec");
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.started, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.rejected, 1);
    }
}
