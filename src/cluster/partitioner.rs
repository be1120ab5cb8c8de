use super::membership::Membership;
use super::types::NodeId;
use crate::config::NodeConfig;

use parking_lot::RwLock;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Ownership of every partition for one member set.
///
/// Members are sorted by id; the primary of partition `p` is member
/// `p mod n` and the backups are the members that follow it.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    members: Vec<NodeId>,
    partition_count: u32,
    backup_count: usize,
}

impl PartitionTable {
    pub fn new(mut members: Vec<NodeId>, partition_count: u32, backup_count: usize) -> Self {
        members.sort();
        members.dedup();
        Self {
            members,
            partition_count,
            backup_count,
        }
    }

    pub fn empty(partition_count: u32, backup_count: usize) -> Self {
        Self::new(Vec::new(), partition_count, backup_count)
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Primary first, then up to `backup_count` distinct backups.
    pub fn owners(&self, partition: u32) -> Vec<NodeId> {
        if self.members.is_empty() {
            return vec![];
        }
        let n = self.members.len();
        let replicas = (self.backup_count + 1).min(n);
        (0..replicas)
            .map(|offset| self.members[(partition as usize + offset) % n].clone())
            .collect()
    }

    pub fn primary(&self, partition: u32) -> Option<&NodeId> {
        if self.members.is_empty() {
            return None;
        }
        self.members
            .get(partition as usize % self.members.len())
    }

    pub fn backups(&self, partition: u32) -> Vec<NodeId> {
        self.owners(partition).into_iter().skip(1).collect()
    }

    pub fn is_owner(&self, partition: u32, member: &NodeId) -> bool {
        self.owners(partition).contains(member)
    }

    pub fn primaries_of(&self, member: &NodeId) -> HashSet<u32> {
        (0..self.partition_count)
            .filter(|&partition| self.primary(partition) == Some(member))
            .collect()
    }
}

pub struct PartitionManager {
    partition_count: u32,
    backup_count: usize,
    membership: Arc<dyn Membership>,
    /// Table this member currently acts on; replaced only by the engine once
    /// partition handover is complete.
    committed: RwLock<Arc<PartitionTable>>,
}

impl PartitionManager {
    pub fn new(config: &NodeConfig, membership: Arc<dyn Membership>) -> Self {
        Self {
            partition_count: config.partition_count,
            backup_count: config.backup_count,
            membership,
            committed: RwLock::new(Arc::new(PartitionTable::empty(
                config.partition_count,
                config.backup_count,
            ))),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.partition_count
    }

    /// A fresh routing key for submissions that do not carry one.
    pub fn random_key(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Ownership implied by the current membership view.
    pub fn compute_table(&self) -> PartitionTable {
        PartitionTable::new(
            self.membership.members(),
            self.partition_count,
            self.backup_count,
        )
    }

    pub fn table(&self) -> Arc<PartitionTable> {
        self.committed.read().clone()
    }

    pub fn commit(&self, table: PartitionTable) {
        tracing::debug!("Committing partition table with {} members", table.members().len());
        *self.committed.write() = Arc::new(table);
    }

    pub fn owner_of(&self, partition: u32) -> Option<NodeId> {
        self.committed.read().primary(partition).cloned()
    }

    pub fn owner_of_key(&self, key: &str) -> Option<NodeId> {
        self.owner_of(self.get_partition(key))
    }
}
