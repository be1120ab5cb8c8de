//! Built-in task types served by the `durable-node` binary.
//!
//! Submitted over the public HTTP API by `task_type`, with the task fields as
//! JSON.

use crate::executor::registry::TaskRegistry;
use crate::executor::task::{Task, TaskContext};
use crate::executor::types::TaskKind;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Returns its message, tagged with the member that ran it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoTask {
    pub message: String,
}

impl Task for EchoTask {
    const TYPE_NAME: &'static str = "echo";
    type Output = String;

    async fn call(self, ctx: TaskContext) -> anyhow::Result<String> {
        Ok(format!("{} (from {})", self.message, ctx.member))
    }
}

/// Sleeps and produces nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepTask {
    pub millis: u64,
}

impl Task for SleepTask {
    const TYPE_NAME: &'static str = "sleep";
    const KIND: TaskKind = TaskKind::Runnable;
    type Output = ();

    async fn call(self, ctx: TaskContext) -> anyhow::Result<()> {
        tracing::debug!("Task {} sleeping for {}ms", ctx.task_id, self.millis);
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

/// Always fails with its message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailTask {
    pub message: String,
}

impl Task for FailTask {
    const TYPE_NAME: &'static str = "fail";
    type Output = ();

    async fn call(self, _ctx: TaskContext) -> anyhow::Result<()> {
        bail!("{}", self.message)
    }
}

pub fn register_builtin_tasks(registry: &TaskRegistry) {
    registry.register::<EchoTask>();
    registry.register::<SleepTask>();
    registry.register::<FailTask>();
}
