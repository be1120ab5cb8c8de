//! Cluster Node
//!
//! `ClusterNode` bundles everything one member runs: membership view,
//! partition manager, executor engine, invoker, lifecycle registry and task
//! registry. It is cheap to clone and is the handle injected into node-aware
//! tasks.

use crate::cluster::membership::Membership;
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::transport::Transport;
use crate::cluster::types::NodeId;
use crate::config::NodeConfig;
use crate::executor::engine::{EngineContext, ExecutorEngine};
use crate::executor::invocation::Invoker;
use crate::executor::lifecycle::ExecutorStates;
use crate::executor::registry::TaskRegistry;
use crate::executor::service::DurableExecutorService;
use crate::executor::task::ManagedContext;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay between a membership change and the partition resync, so a burst of
/// gossip updates triggers a single handover.
const MEMBERSHIP_SETTLE: Duration = Duration::from_millis(200);

pub(crate) struct NodeInner {
    config: Arc<NodeConfig>,
    membership: Arc<dyn Membership>,
    partitioner: Arc<PartitionManager>,
    engine: Arc<ExecutorEngine>,
    invoker: Arc<Invoker>,
    states: Arc<ExecutorStates>,
    registry: Arc<TaskRegistry>,
}

#[derive(Clone)]
pub struct ClusterNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("id", self.id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ClusterNode {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &NodeId {
        self.inner.membership.local_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn durable_executor(&self, name: &str) -> DurableExecutorService {
        DurableExecutorService::new(name, self.clone())
    }

    pub fn partition_of(&self, key: &str) -> u32 {
        self.inner.partitioner.get_partition(key)
    }

    pub fn owner_of_key(&self, key: &str) -> Option<NodeId> {
        self.inner.partitioner.owner_of_key(key)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn states(&self) -> &Arc<ExecutorStates> {
        &self.inner.states
    }

    pub fn engine(&self) -> &Arc<ExecutorEngine> {
        &self.inner.engine
    }

    pub fn partitioner(&self) -> &Arc<PartitionManager> {
        &self.inner.partitioner
    }

    pub(crate) fn invoker(&self) -> &Arc<Invoker> {
        &self.inner.invoker
    }

    pub fn invocation_count(&self) -> u64 {
        self.inner.invoker.invocation_count()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.engine.is_halted()
    }

    /// Re-reads the membership view and hands partitions over accordingly.
    pub async fn sync_membership(&self) {
        self.inner.engine.on_membership_change().await;
    }

    /// Resyncs now, then again after every membership change until the node
    /// shuts down.
    pub fn spawn_membership_watch(&self) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        let mut changes = self.inner.membership.subscribe();

        tokio::spawn(async move {
            node.sync_membership().await;
            while changes.changed().await.is_ok() {
                tokio::time::sleep(MEMBERSHIP_SETTLE).await;
                let _ = changes.borrow_and_update();
                if !node.is_running() {
                    break;
                }
                node.sync_membership().await;
            }
            tracing::debug!("Membership watch on {} stopped", node.id());
        })
    }

    /// Terminates every executor on this member and stops serving.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.id());
        self.inner.states.shutdown_cluster();
        self.inner.engine.halt().await;
    }
}

pub struct NodeBuilder {
    config: NodeConfig,
    registry: Option<Arc<TaskRegistry>>,
    managed_context: Option<Arc<dyn ManagedContext>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            registry: None,
            managed_context: None,
        }
    }

    pub fn registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn managed_context(mut self, managed_context: Arc<dyn ManagedContext>) -> Self {
        self.managed_context = Some(managed_context);
        self
    }

    pub fn build(self, membership: Arc<dyn Membership>, transport: Arc<dyn Transport>) -> ClusterNode {
        let config = Arc::new(self.config);
        let local = membership.local_id().clone();
        let partitioner = Arc::new(PartitionManager::new(&config, membership.clone()));
        let states = Arc::new(ExecutorStates::new());
        let registry = self.registry.unwrap_or_else(TaskRegistry::new);

        let engine = ExecutorEngine::new(EngineContext::new(
            local.clone(),
            config.clone(),
            registry.clone(),
            states.clone(),
            partitioner.clone(),
            transport.clone(),
            self.managed_context,
        ));
        let invoker = Arc::new(Invoker::new(
            engine.clone(),
            transport,
            partitioner.clone(),
            config.invocation.clone(),
        ));

        let inner = Arc::new(NodeInner {
            config,
            membership,
            partitioner,
            engine,
            invoker,
            states,
            registry,
        });
        inner.engine.attach_node(Arc::downgrade(&inner));

        tracing::info!("Node {} built", local);
        ClusterNode { inner }
    }
}
