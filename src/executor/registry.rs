//! Task Registry
//!
//! Maps task type names to type-erased runners. A runner decodes the payload
//! once, applies the capability hooks, runs the body and encodes the output.
//! Every member must register the same task types.

use super::task::{ManagedContext, Task, TaskContext};
use super::types::{TaskEnvelope, TaskKind};
use crate::node::ClusterNode;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What the executing member provides to a runner besides the payload.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub ctx: TaskContext,
    pub node: Option<ClusterNode>,
    pub managed_context: Option<Arc<dyn ManagedContext>>,
}

pub type TaskRunFuture = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send>>;

/// Type-erased runner: payload bytes in, encoded output out.
pub type TaskRunnerFn = Arc<dyn Fn(Vec<u8>, ExecutionEnv) -> TaskRunFuture + Send + Sync>;

/// Builds payload bytes from a JSON document (public HTTP submissions).
pub type JsonEncoderFn = Arc<dyn Fn(serde_json::Value) -> Result<Vec<u8>> + Send + Sync>;

/// Renders encoded output bytes as JSON.
pub type JsonDecoderFn = Arc<dyn Fn(&[u8]) -> Result<serde_json::Value> + Send + Sync>;

struct RegisteredTask {
    kind: TaskKind,
    runner: TaskRunnerFn,
    encode_json: JsonEncoderFn,
    decode_output_json: JsonDecoderFn,
}

pub struct TaskRegistry {
    tasks: DashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<T: Task>(&self) {
        let runner: TaskRunnerFn = Arc::new(|payload: Vec<u8>, env: ExecutionEnv| {
            Box::pin(run_task::<T>(payload, env)) as TaskRunFuture
        });

        let encode_json: JsonEncoderFn = Arc::new(|value: serde_json::Value| {
            let task: T = serde_json::from_value(value)?;
            Ok(bincode::serialize(&task)?)
        });

        let decode_output_json: JsonDecoderFn = Arc::new(|bytes: &[u8]| {
            let output: T::Output = bincode::deserialize(bytes)?;
            Ok(serde_json::to_value(output)?)
        });

        self.tasks.insert(
            T::TYPE_NAME.to_string(),
            RegisteredTask {
                kind: T::KIND,
                runner,
                encode_json,
                decode_output_json,
            },
        );

        tracing::info!("Registered task type: {}", T::TYPE_NAME);
    }

    /// Runs an envelope through the runner registered for its type.
    pub async fn execute(&self, envelope: TaskEnvelope, env: ExecutionEnv) -> Result<Option<Vec<u8>>> {
        let runner = match self.tasks.get(&envelope.task_type) {
            Some(task) => task.runner.clone(),
            None => {
                let error = format!("Unknown task type: {}", envelope.task_type);
                tracing::error!("{}", error);
                return Err(anyhow::anyhow!(error));
            }
        };

        tracing::debug!(
            "Executing task {} of type '{}' ({} payload bytes)",
            env.ctx.task_id,
            envelope.task_type,
            envelope.payload.len()
        );

        runner(envelope.payload, env).await
    }

    /// Encodes a JSON task description into an envelope for `task_type`.
    pub fn envelope_from_json(&self, task_type: &str, task: serde_json::Value) -> Result<TaskEnvelope> {
        let registered = self
            .tasks
            .get(task_type)
            .ok_or_else(|| anyhow::anyhow!("Unknown task type: {}", task_type))?;

        Ok(TaskEnvelope {
            task_type: task_type.to_string(),
            kind: registered.kind,
            payload: (registered.encode_json)(task)?,
        })
    }

    pub fn output_to_json(&self, task_type: &str, bytes: &[u8]) -> Result<serde_json::Value> {
        let registered = self
            .tasks
            .get(task_type)
            .ok_or_else(|| anyhow::anyhow!("Unknown task type: {}", task_type))?;
        (registered.decode_output_json)(bytes)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }
}

async fn run_task<T: Task>(payload: Vec<u8>, env: ExecutionEnv) -> Result<Option<Vec<u8>>> {
    let mut task: T = bincode::deserialize(&payload)?;

    if let Some(managed_context) = &env.managed_context {
        managed_context.initialize(&mut task, T::TYPE_NAME);
    }

    if let Some(aware) = task.as_node_aware() {
        match env.node {
            Some(node) => aware.set_node(node),
            None => tracing::warn!("No node handle available for {}", T::TYPE_NAME),
        }
    }

    let output = task.call(env.ctx).await?;

    match T::KIND {
        TaskKind::Runnable => Ok(None),
        TaskKind::Callable => Ok(Some(bincode::serialize(&output)?)),
    }
}
