//! Member-side executor engine.
//!
//! Receives every operation addressed to this member, routes it to the right
//! partition container and keeps the set of primary partitions in step with
//! the membership view.
//!
//! ## Membership changes
//! Handled one at a time, in this order:
//! 1. demote containers for partitions this member no longer owns,
//! 2. fetch containers for newly owned partitions from every peer (the
//!    previous owner gives up ownership before answering),
//! 3. commit the new partition table,
//! 4. promote the fetched containers, re-running their in-flight tasks,
//! 5. push full snapshots to backups that did not hold the partition before.

use super::partition::PartitionContainer;
use super::protocol::{Operation, OperationResponse};
use super::registry::TaskRegistry;
use super::lifecycle::ExecutorStates;
use super::task::ManagedContext;
use super::types::*;
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::transport::{Transport, decode_operation, encode_reply};
use crate::cluster::types::NodeId;
use crate::config::NodeConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::node::{ClusterNode, NodeInner};

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Everything a container needs from its member.
pub struct EngineContext {
    pub local: NodeId,
    pub config: Arc<NodeConfig>,
    pub registry: Arc<TaskRegistry>,
    pub states: Arc<ExecutorStates>,
    pub partitioner: Arc<PartitionManager>,
    pub transport: Arc<dyn Transport>,
    pub managed_context: Option<Arc<dyn ManagedContext>>,
    node: OnceLock<Weak<NodeInner>>,
}

impl EngineContext {
    pub fn new(
        local: NodeId,
        config: Arc<NodeConfig>,
        registry: Arc<TaskRegistry>,
        states: Arc<ExecutorStates>,
        partitioner: Arc<PartitionManager>,
        transport: Arc<dyn Transport>,
        managed_context: Option<Arc<dyn ManagedContext>>,
    ) -> Self {
        Self {
            local,
            config,
            registry,
            states,
            partitioner,
            transport,
            managed_context,
            node: OnceLock::new(),
        }
    }

    /// Handle of the member running this engine, for node-aware tasks.
    pub fn node(&self) -> Option<ClusterNode> {
        self.node
            .get()
            .and_then(Weak::upgrade)
            .map(ClusterNode::from_inner)
    }

    /// Whether `node` is this member or part of the committed membership.
    pub fn is_member(&self, node: &NodeId) -> bool {
        *node == self.local || self.partitioner.table().members().contains(node)
    }

    /// Pushes one slot write to every backup of the partition.
    pub async fn replicate(&self, key: &ContainerKey, slot: RingSlot, next_sequence: u64) {
        let task_id = slot.task_id;
        self.to_backups(key, task_id, |key| Operation::Replicate {
            key,
            slot: slot.clone(),
            next_sequence,
        })
        .await;
    }

    /// Tells the backups an outcome was parked for its submitter (`Some`) or
    /// collected (`None`).
    pub async fn replicate_unclaimed(
        &self,
        key: &ContainerKey,
        task_id: TaskId,
        unclaimed: Option<UnclaimedOutcome>,
    ) {
        self.to_backups(key, task_id, |key| Operation::ReplicateUnclaimed {
            key,
            task_id,
            unclaimed: unclaimed.clone(),
        })
        .await;
    }

    async fn to_backups(
        &self,
        key: &ContainerKey,
        task_id: TaskId,
        op: impl Fn(ContainerKey) -> Operation,
    ) {
        let backups = self.partitioner.table().backups(key.partition);
        for backup in backups {
            if backup == self.local {
                continue;
            }
            if let Err(e) = self.transport.invoke(&backup, op(key.clone())).await {
                tracing::warn!(
                    "Failed to replicate {} of {} to {}: {}",
                    task_id,
                    key,
                    backup,
                    e
                );
            }
        }
    }
}

pub struct ExecutorEngine {
    ctx: Arc<EngineContext>,
    containers: DashMap<ContainerKey, Arc<PartitionContainer>>,
    /// Partitions this member currently acts as primary for.
    owned: RwLock<HashSet<u32>>,
    membership_change: tokio::sync::Mutex<()>,
    halted: AtomicBool,
}

impl ExecutorEngine {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(ctx),
            containers: DashMap::new(),
            owned: RwLock::new(HashSet::new()),
            membership_change: tokio::sync::Mutex::new(()),
            halted: AtomicBool::new(false),
        })
    }

    pub(crate) fn attach_node(&self, node: Weak<NodeInner>) {
        if self.ctx.node.set(node).is_err() {
            tracing::warn!("Engine on {} already attached to a node", self.ctx.local);
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.ctx.local
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn owns(&self, partition: u32) -> bool {
        self.owned.read().contains(&partition)
    }

    pub fn owned_partition_count(&self) -> usize {
        self.owned.read().len()
    }

    /// Container for a key, created on first use. Must be called without the
    /// `owned` lock held.
    fn container(&self, name: &str, partition: u32) -> Arc<PartitionContainer> {
        let owned = self.owned.read();
        self.container_locked(name, partition, owned.contains(&partition))
    }

    fn container_locked(&self, name: &str, partition: u32, primary: bool) -> Arc<PartitionContainer> {
        let key = ContainerKey::new(name, partition);
        self.containers
            .entry(key.clone())
            .or_insert_with(|| {
                PartitionContainer::new(key, self.ctx.config.executor_config(name), primary)
            })
            .clone()
    }

    /// Container for a client operation; fails unless this member is primary.
    fn owned_container(&self, name: &str, partition: u32) -> ExecutorResult<Arc<PartitionContainer>> {
        let owned = self.owned.read();
        if !owned.contains(&partition) {
            return Err(ExecutorError::NotOwner { partition });
        }
        Ok(self.container_locked(name, partition, true))
    }

    fn containers_where(&self, filter: impl Fn(&ContainerKey) -> bool) -> Vec<Arc<PartitionContainer>> {
        self.containers
            .iter()
            .filter(|entry| filter(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub async fn handle(&self, op: Operation) -> ExecutorResult<OperationResponse> {
        if self.is_halted() {
            return Err(ExecutorError::MemberLeft(format!(
                "member {} is shut down",
                self.ctx.local
            )));
        }

        tracing::trace!("Handling {} operation", op.kind());

        match op {
            Operation::Submit {
                name,
                partition,
                task,
                submission,
                submitter,
            } => {
                let container = self.owned_container(&name, partition)?;
                container
                    .submit(&self.ctx, task, submission, submitter)
                    .await
                    .map(OperationResponse::TaskId)
            }
            Operation::AwaitResult {
                name,
                task_id,
                dispose,
                claim,
            } => {
                let container = self.owned_container(&name, task_id.partition())?;
                container
                    .await_result(&self.ctx, task_id, dispose, claim)
                    .await
                    .map(OperationResponse::Outcome)
            }
            Operation::DisposeResult { name, task_id } => {
                let container = self.owned_container(&name, task_id.partition())?;
                container.dispose(&self.ctx, task_id).await?;
                Ok(OperationResponse::Ack)
            }
            Operation::Cancel {
                name,
                task_id,
                may_interrupt,
            } => {
                let container = self.owned_container(&name, task_id.partition())?;
                container
                    .cancel(&self.ctx, task_id, may_interrupt)
                    .await
                    .map(OperationResponse::Cancelled)
            }
            Operation::Shutdown { name, now } => {
                let drained = self.shutdown_executor(&name, now).await;
                Ok(OperationResponse::Drained(drained))
            }
            Operation::Replicate {
                key,
                slot,
                next_sequence,
            } => {
                let container = self.container(&key.name, key.partition);
                container.apply_replica(slot, next_sequence).await;
                Ok(OperationResponse::Ack)
            }
            Operation::ReplicateUnclaimed {
                key,
                task_id,
                unclaimed,
            } => {
                let container = self.container(&key.name, key.partition);
                container.apply_unclaimed(task_id, unclaimed).await;
                Ok(OperationResponse::Ack)
            }
            Operation::ReplicateContainer(snapshot) => {
                let container = self.container(&snapshot.key.name, snapshot.key.partition);
                container.restore(snapshot).await;
                Ok(OperationResponse::Ack)
            }
            Operation::PartitionDump { partitions } => {
                let snapshots = self.dump_partitions(partitions).await;
                Ok(OperationResponse::Snapshots(snapshots))
            }
        }
    }

    /// Entry point for transports: decodes an operation, handles it and
    /// encodes the reply.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        let reply = match decode_operation(bytes) {
            Ok(op) => self.handle(op).await,
            Err(e) => {
                tracing::warn!("Dropping undecodable operation: {}", e);
                Err(e)
            }
        };
        encode_reply(&reply)
    }

    async fn shutdown_executor(&self, name: &str, now: bool) -> Vec<TaskId> {
        self.ctx.states.shutdown(name);
        if !now {
            return Vec::new();
        }

        let mut drained = Vec::new();
        for container in self.containers_where(|key| key.name == name) {
            drained.extend(container.shutdown_now(&self.ctx).await);
        }
        drained.sort();

        if !drained.is_empty() {
            tracing::info!(
                "Immediate shutdown of '{}' discarded {} queued task(s)",
                name,
                drained.len()
            );
        }
        drained
    }

    /// Gives up primary ownership of `partitions` and returns everything held
    /// for them.
    async fn dump_partitions(&self, partitions: Vec<u32>) -> Vec<ContainerSnapshot> {
        let requested: HashSet<u32> = partitions.into_iter().collect();
        let containers = {
            let mut owned = self.owned.write();
            owned.retain(|partition| !requested.contains(partition));
            self.containers_where(|key| requested.contains(&key.partition))
        };

        let mut snapshots = Vec::with_capacity(containers.len());
        for container in containers {
            container.demote(&self.ctx).await;
            snapshots.push(container.snapshot().await);
        }

        tracing::debug!(
            "Handing over {} container(s) for {} partition(s)",
            snapshots.len(),
            requested.len()
        );
        snapshots
    }

    pub async fn on_membership_change(&self) {
        let _guard = self.membership_change.lock().await;
        if self.is_halted() {
            return;
        }

        let local = self.ctx.local.clone();
        let previous = self.ctx.partitioner.table();
        let next = self.ctx.partitioner.compute_table();
        let target = next.primaries_of(&local);

        let lost_containers = {
            let mut owned = self.owned.write();
            let lost: HashSet<u32> = owned.difference(&target).copied().collect();
            owned.retain(|partition| !lost.contains(partition));
            self.containers_where(|key| lost.contains(&key.partition))
        };
        for container in &lost_containers {
            container.demote(&self.ctx).await;
        }

        let gained: Vec<u32> = {
            let owned = self.owned.read();
            let mut gained: Vec<u32> = target.difference(&owned).copied().collect();
            gained.sort_unstable();
            gained
        };
        if !gained.is_empty() {
            self.fetch_partitions(&gained, next.members()).await;
        }

        let member_count = next.members().len();
        self.ctx.partitioner.commit(next);
        let next = self.ctx.partitioner.table();

        let gained_set: HashSet<u32> = gained.iter().copied().collect();
        let promoted = {
            let mut owned = self.owned.write();
            owned.extend(gained.iter().copied());
            self.containers_where(|key| gained_set.contains(&key.partition))
        };
        for container in &promoted {
            container.promote(&self.ctx).await;
        }

        for container in self.containers_where(|key| target.contains(&key.partition)) {
            let partition = container.key().partition;
            let previous_owners = previous.owners(partition);
            let fresh: Vec<NodeId> = next
                .backups(partition)
                .into_iter()
                .filter(|backup| !previous_owners.contains(backup))
                .collect();
            if fresh.is_empty() {
                continue;
            }

            let snapshot = container.snapshot().await;
            for backup in fresh {
                let op = Operation::ReplicateContainer(snapshot.clone());
                if let Err(e) = self.ctx.transport.invoke(&backup, op).await {
                    tracing::warn!("Failed to seed backup {} for {}: {}", backup, container.key(), e);
                }
            }
        }

        self.containers
            .retain(|key, _| next.is_owner(key.partition, &local));
        for container in self.containers_where(|_| true) {
            container.forget_departed_submitters(&self.ctx).await;
        }

        tracing::info!(
            "Partition table updated: {} member(s), {} primary partition(s) here ({} gained, {} lost)",
            member_count,
            target.len(),
            gained.len(),
            lost_containers
                .iter()
                .map(|container| container.key().partition)
                .collect::<HashSet<_>>()
                .len()
        );
    }

    /// Collects the freshest copy of every container for `gained` from the
    /// other members and installs it locally.
    async fn fetch_partitions(&self, gained: &[u32], members: &[NodeId]) {
        let peers: BTreeSet<&NodeId> = members
            .iter()
            .filter(|member| **member != self.ctx.local)
            .collect();

        let mut freshest: HashMap<ContainerKey, ContainerSnapshot> = HashMap::new();
        for peer in peers {
            let op = Operation::PartitionDump {
                partitions: gained.to_vec(),
            };
            match self.ctx.transport.invoke(peer, op).await {
                Ok(OperationResponse::Snapshots(snapshots)) => {
                    for snapshot in snapshots {
                        let newer = freshest
                            .get(&snapshot.key)
                            .is_none_or(|held| snapshot.next_sequence > held.next_sequence);
                        if newer {
                            freshest.insert(snapshot.key.clone(), snapshot);
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!("Unexpected reply to partition dump from {}: {:?}", peer, other)
                }
                Err(e) => tracing::warn!("Failed to fetch partitions from {}: {}", peer, e),
            }
        }

        for (key, snapshot) in freshest {
            let container = self.container(&key.name, key.partition);
            if snapshot.next_sequence > container.next_sequence().await {
                container.restore(snapshot).await;
            }
        }
    }

    /// Stops serving: every container is demoted and every later operation is
    /// answered with `MemberLeft`.
    pub async fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.owned.write().clear();

        let containers = self.containers_where(|_| true);
        for container in &containers {
            container.demote(&self.ctx).await;
        }
        tracing::info!("Engine on {} halted ({} container(s))", self.ctx.local, containers.len());
    }
}
