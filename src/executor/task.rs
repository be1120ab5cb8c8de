//! Task model.
//!
//! A task is any serializable type implementing [`Task`]. It is encoded once
//! on the submitting member, shipped and replicated as opaque bytes, and
//! decoded once on the member that runs it.
//!
//! Optional capabilities are discovered on the executing member before the
//! body runs:
//! - [`NodeAware`], queried through [`Task::as_node_aware`], receives the
//!   local [`ClusterNode`] handle;
//! - a node-wide [`ManagedContext`] sees every decoded task first.

use super::types::{TaskId, TaskKind};
use crate::cluster::types::NodeId;
use crate::node::ClusterNode;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::future::Future;

/// Information about the current execution, handed to [`Task::call`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Member running the task.
    pub member: NodeId,
    pub executor: String,
    pub task_id: TaskId,
}

pub trait Task: Serialize + DeserializeOwned + Send + 'static {
    /// Registry key; must be identical on every member.
    const TYPE_NAME: &'static str;

    /// `Runnable` tasks return `()` and resolve their futures with no value.
    const KIND: TaskKind = TaskKind::Callable;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn call(self, ctx: TaskContext) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Routing key used when the caller does not pass one.
    fn partition_key(&self) -> Option<String> {
        None
    }

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAware> {
        None
    }
}

/// Capability: the task wants the handle of the member that runs it.
pub trait NodeAware {
    fn set_node(&mut self, node: ClusterNode);
}

/// Node-wide initialization hook applied to every task before it runs.
pub trait ManagedContext: Send + Sync {
    fn initialize(&self, task: &mut dyn Any, task_type: &str);
}
