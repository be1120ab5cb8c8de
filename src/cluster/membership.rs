//! Gossip membership used by the `durable-node` binary.
//!
//! Nodes exchange UDP gossip to discover each other and detect failures with
//! an `Alive -> Suspect -> Dead` model. Every change of the member set bumps a
//! version counter that the node watches to recompute partition ownership.

use super::types::{GossipMessage, Node, NodeId, NodeState};

use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, watch};
use tracing::info;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP port offset from the gossip port.
pub const HTTP_PORT_OFFSET: u16 = 1000;

/// View of the cluster consumed by the partition manager.
pub trait Membership: Send + Sync {
    fn local_id(&self) -> &NodeId;

    /// Members that take part in partition ownership, including this one.
    fn members(&self) -> Vec<NodeId>;

    /// Receives a new value every time `members()` may have changed.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

pub struct GossipMembership {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    version: watch::Sender<u64>,
}

impl GossipMembership {
    pub async fn new(bind_addr: SocketAddr, seed_nodes: Vec<SocketAddr>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;
        let http_addr = SocketAddr::new(
            gossip_addr.ip(),
            gossip_addr.port().saturating_add(HTTP_PORT_OFFSET),
        );

        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join {
                node: local_node.clone(),
            })?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (version, _) = watch::channel(0);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
            version,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            });
        }

        tracing::info!("All background tasks started");
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    fn member_set_changed(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..alive_members.len());
            let target = &alive_members[idx];

            let mut from = self.local_node.clone();
            from.incarnation = *self.incarnation.read().await;

            match bincode::serialize(&GossipMessage::Ping { from }) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    } else {
                        tracing::debug!("Sent ping to {}", target.id);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from } => self.handle_ping(from, src).await?,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => self.handle_ack(from, incarnation, members).await,
            GossipMessage::Join { node } => self.handle_join(node, src).await?,
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => self.handle_suspect(node_id, incarnation).await,
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => self.handle_alive(node_id, incarnation),
        }

        Ok(())
    }

    async fn handle_ping(&self, from: Node, src: SocketAddr) -> Result<()> {
        tracing::debug!("Received ping from {}", from.id);

        let from_id = from.id.clone();
        let mut revived = false;
        match self.members.get_mut(&from_id) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if from.incarnation > member.incarnation {
                    member.incarnation = from.incarnation;
                    revived = member.state != NodeState::Alive;
                    member.state = NodeState::Alive;
                }
            }
            None => {
                tracing::info!("Discovered new member via ping: {} at {}", from_id, src);
                let mut node = from;
                node.state = NodeState::Alive;
                node.last_seen = Some(Instant::now());
                self.members.insert(from_id.clone(), node);
                revived = true;
            }
        }
        if revived {
            self.member_set_changed();
        }

        self.send_ack(src).await?;
        tracing::debug!("Sent ack to {} with {} members", from_id, self.members.len());

        Ok(())
    }

    async fn send_ack(&self, target: SocketAddr) -> Result<()> {
        let members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: *self.incarnation.read().await,
            members,
        };

        self.socket
            .send_to(&bincode::serialize(&reply)?, target)
            .await?;
        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::debug!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        let changed = match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    let changed = existing.state != new_member.state;
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                    changed
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            None => {
                if new_member.state == NodeState::Dead {
                    return;
                }
                tracing::info!(
                    "Discovered new member: {} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member = new_member;
                member.last_seen = Some(Instant::now());
                self.members.insert(member.id.clone(), member);
                true
            }
        };

        if changed {
            self.member_set_changed();
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc = (*inc).max(incarnation) + 1;
                *inc
            };
            tracing::info!("Refuting suspicion about this node (inc={})", my_incarnation);

            if let Some(mut local) = self.members.get_mut(&node_id) {
                local.incarnation = my_incarnation;
                local.state = NodeState::Alive;
            }
            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            })
            .await;
            return;
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) if incarnation >= existing.incarnation => {
                if existing.state == NodeState::Alive {
                    tracing::info!("Node {} at {} suspected", existing.id, existing.gossip_addr);
                    existing.state = NodeState::Suspect;
                }
                existing.incarnation = incarnation;
            }
            Some(_) => {}
            None => tracing::debug!("Suspected node {} doesn't exist", node_id),
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let changed = match self.members.get_mut(&node_id) {
            Some(mut existing) if incarnation > existing.incarnation => {
                tracing::info!(
                    "Node {} at {} is now Alive (inc={})",
                    existing.id,
                    existing.gossip_addr,
                    incarnation
                );
                let changed = existing.state == NodeState::Dead;
                existing.state = NodeState::Alive;
                existing.incarnation = incarnation;
                existing.last_seen = Some(Instant::now());
                changed
            }
            Some(mut existing) if existing.state == NodeState::Suspect => {
                tracing::info!("Node {} refuted suspicion", existing.id);
                existing.state = NodeState::Alive;
                existing.last_seen = Some(Instant::now());
                false
            }
            Some(_) => false,
            None => {
                tracing::debug!("Alive message for unknown node {}", node_id);
                false
            }
        };

        if changed {
            self.member_set_changed();
        }
    }

    async fn handle_join(&self, mut node: Node, src: SocketAddr) -> Result<()> {
        tracing::info!("Node {} joining cluster at {}", node.id, node.gossip_addr);

        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());
        self.members.insert(node.id.clone(), node);
        self.member_set_changed();

        tracing::info!("Cluster size now: {}", self.members.len());

        // The joiner learns the rest of the cluster from the reply.
        self.send_ack(src).await
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();
            let mut declared_dead = false;

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Suspect;
                        messages_to_broadcast.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::info!("Node {} declared DEAD (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Dead;
                        declared_dead = true;
                    }
                    _ => {}
                }
            }

            if declared_dead {
                self.member_set_changed();
                tracing::info!("Cluster size now: {} members", self.members().len());
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&msg) else {
            tracing::error!("Failed to serialize gossip broadcast");
            return;
        };

        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for member in targets {
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}

impl Membership for GossipMembership {
    fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    /// Suspects keep their partitions until they are declared dead, so a
    /// single missed heartbeat does not reshuffle ownership.
    fn members(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|entry| entry.value().state != NodeState::Dead)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
