//! Client-side routing of operations to partition owners.
//!
//! The owner is looked up in the committed partition table on every attempt,
//! so a retry after `NotOwner` or `MemberLeft` follows ownership as it moves.

use super::engine::ExecutorEngine;
use super::protocol::{Operation, OperationResponse};
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::transport::Transport;
use crate::cluster::types::NodeId;
use crate::config::InvocationConfig;
use crate::error::{ExecutorError, ExecutorResult};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct Invoker {
    engine: Arc<ExecutorEngine>,
    transport: Arc<dyn Transport>,
    partitioner: Arc<PartitionManager>,
    settings: InvocationConfig,
    invocations: AtomicU64,
}

impl Invoker {
    pub fn new(
        engine: Arc<ExecutorEngine>,
        transport: Arc<dyn Transport>,
        partitioner: Arc<PartitionManager>,
        settings: InvocationConfig,
    ) -> Self {
        Self {
            engine,
            transport,
            partitioner,
            settings,
            invocations: AtomicU64::new(0),
        }
    }

    /// Operations sent so far, local short-circuits included.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Sends `op` to the current primary of `partition`, retrying with
    /// exponential backoff while the failure is caused by ownership changes.
    pub async fn invoke_on_partition(&self, partition: u32, op: Operation) -> ExecutorResult<OperationResponse> {
        let mut delay_ms = self.settings.backoff_base_ms;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.partitioner.owner_of(partition) {
                Some(owner) => self.invoke_on_member(&owner, op.clone()).await,
                None => Err(ExecutorError::MemberLeft(format!(
                    "no owner for partition {}",
                    partition
                ))),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.settings.max_attempts => {
                    tracing::debug!(
                        "Retrying {} on partition {} (attempt {}): {}",
                        op.kind(),
                        partition,
                        attempt,
                        e
                    );
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.settings.backoff_cap_ms);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "Giving up on {} for partition {} after {} attempts: {}",
                        op.kind(),
                        partition,
                        attempt,
                        e
                    );
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    pub async fn invoke_on_member(&self, member: &NodeId, op: Operation) -> ExecutorResult<OperationResponse> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if member == self.engine.local_id() {
            return self.engine.handle(op).await;
        }
        self.transport.invoke(member, op).await
    }

    /// Sends `op` once to every member of the committed table.
    pub async fn broadcast(&self, op: Operation) -> Vec<(NodeId, ExecutorResult<OperationResponse>)> {
        let mut members = self.partitioner.table().members().to_vec();
        if members.is_empty() {
            members.push(self.engine.local_id().clone());
        }

        let mut replies = Vec::with_capacity(members.len());
        for member in members {
            let reply = self.invoke_on_member(&member, op.clone()).await;
            replies.push((member, reply));
        }
        replies
    }
}
