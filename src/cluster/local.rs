//! In-process cluster.
//!
//! Several members in one process, sharing a registry instead of a network.
//! Operations still travel as encoded bytes through [`LocalTransport`], so
//! every codec boundary is crossed exactly as it is over HTTP.

use super::membership::Membership;
use super::transport::{Transport, decode_reply, encode_operation};
use super::types::NodeId;
use crate::config::NodeConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::engine::ExecutorEngine;
use crate::executor::protocol::{Operation, OperationResponse};
use crate::executor::registry::TaskRegistry;
use crate::executor::task::ManagedContext;
use crate::node::{ClusterNode, NodeBuilder};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Bound on random keys tried when looking for one owned by a given member.
const KEY_SEARCH_ATTEMPTS: usize = 100_000;

/// Members currently reachable in this process.
pub struct LocalRegistry {
    engines: DashMap<NodeId, Weak<ExecutorEngine>>,
    version: watch::Sender<u64>,
}

impl LocalRegistry {
    pub fn new() -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            engines: DashMap::new(),
            version,
        })
    }

    fn join(&self, id: &NodeId, engine: &Arc<ExecutorEngine>) {
        self.engines.insert(id.clone(), Arc::downgrade(engine));
        self.version.send_modify(|version| *version += 1);
    }

    fn leave(&self, id: &NodeId) {
        self.engines.remove(id);
        self.version.send_modify(|version| *version += 1);
    }

    fn engine(&self, id: &NodeId) -> Option<Arc<ExecutorEngine>> {
        self.engines.get(id).and_then(|engine| engine.upgrade())
    }

    fn ids(&self) -> Vec<NodeId> {
        self.engines.iter().map(|entry| entry.key().clone()).collect()
    }
}

pub struct LocalMembership {
    local: NodeId,
    registry: Arc<LocalRegistry>,
}

impl Membership for LocalMembership {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    fn members(&self) -> Vec<NodeId> {
        self.registry.ids()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.registry.version.subscribe()
    }
}

pub struct LocalTransport {
    registry: Arc<LocalRegistry>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn invoke(&self, target: &NodeId, op: Operation) -> ExecutorResult<OperationResponse> {
        let bytes = encode_operation(&op)?;
        let engine = self
            .registry
            .engine(target)
            .ok_or_else(|| ExecutorError::MemberLeft(format!("member {} is gone", target)))?;
        let reply = engine.handle_bytes(&bytes).await;
        decode_reply(&reply)
    }
}

/// A set of members sharing one [`LocalRegistry`]. Membership changes are
/// applied to every member, one after another, before `start_node` and
/// `shutdown_node` return.
pub struct LocalCluster {
    config: NodeConfig,
    registry: Arc<LocalRegistry>,
    tasks: Arc<TaskRegistry>,
    managed_context: Option<Arc<dyn ManagedContext>>,
    nodes: Mutex<Vec<ClusterNode>>,
}

impl LocalCluster {
    pub fn new(config: NodeConfig, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            registry: LocalRegistry::new(),
            tasks,
            managed_context: None,
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Every member started afterwards runs this hook on its tasks.
    pub fn with_managed_context(mut self, managed_context: Arc<dyn ManagedContext>) -> Self {
        self.managed_context = Some(managed_context);
        self
    }

    pub async fn start_node(&self) -> ClusterNode {
        let id = NodeId::new();
        let membership = Arc::new(LocalMembership {
            local: id.clone(),
            registry: self.registry.clone(),
        });
        let transport = Arc::new(LocalTransport {
            registry: self.registry.clone(),
        });

        let mut builder = NodeBuilder::new(self.config.clone()).registry(self.tasks.clone());
        if let Some(managed_context) = &self.managed_context {
            builder = builder.managed_context(managed_context.clone());
        }
        let node = builder.build(membership, transport);

        self.registry.join(&id, node.engine());
        self.nodes.lock().push(node.clone());
        self.sync_all().await;

        tracing::info!("Local member {} joined ({} members)", id, self.nodes.lock().len());
        node
    }

    pub async fn start_nodes(&self, count: usize) -> Vec<ClusterNode> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(self.start_node().await);
        }
        nodes
    }

    /// Terminates a member and lets the survivors take over its partitions.
    pub async fn shutdown_node(&self, node: &ClusterNode) {
        node.shutdown().await;
        self.registry.leave(node.id());
        self.nodes.lock().retain(|other| other.id() != node.id());
        self.sync_all().await;
    }

    pub async fn sync_all(&self) {
        for node in self.nodes() {
            node.sync_membership().await;
        }
    }

    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.nodes.lock().clone()
    }

    /// A routing key whose partition `node` is primary for.
    pub fn generate_key_owned_by(&self, node: &ClusterNode) -> Option<String> {
        let partitioner = node.partitioner();
        (0..KEY_SEARCH_ATTEMPTS)
            .map(|_| partitioner.random_key())
            .find(|key| partitioner.owner_of_key(key).as_ref() == Some(node.id()))
    }

    pub async fn shutdown(&self) {
        for node in self.nodes() {
            self.shutdown_node(&node).await;
        }
    }
}
