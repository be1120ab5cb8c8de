//! Cluster Module Tests
//!
//! ## Test Scopes
//! - **Data Structures**: node ids and the gossip wire format.
//! - **Gossip Membership**: initialization, member lookup, address calculation.
//! - **Partitioning**: key hashing against a live membership view.

#[cfg(test)]
mod tests {
    use crate::cluster::membership::{GossipMembership, Membership};
    use crate::cluster::partitioner::PartitionManager;
    use crate::cluster::types::{GossipMessage, Node, NodeId, NodeState};
    use crate::config::NodeConfig;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn node(id: &str, port: u16, state: NodeState, incarnation: u64) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], port + 1000)),
            state,
            incarnation,
            last_seen: None,
        }
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_ids_sort_by_value() {
        let mut ids = vec![
            NodeId("node-c".to_string()),
            NodeId("node-a".to_string()),
            NodeId("node-b".to_string()),
        ];
        ids.sort();

        assert_eq!(ids[0].to_string(), "node-a");
        assert_eq!(ids[2].to_string(), "node-c");
    }

    // ============================================================
    // GOSSIP MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_node_serialization_skips_last_seen() {
        let mut original = node("test-node", 5000, NodeState::Alive, 42);
        original.last_seen = Some(std::time::Instant::now());

        let json = serde_json::to_string(&original).expect("Serialization failed");
        let restored: Node = serde_json::from_str(&json).expect("Deserialization failed");

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.http_addr, original.http_addr);
        assert_eq!(restored.incarnation, 42);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_ping_carries_full_node() {
        let msg = GossipMessage::Ping {
            from: node("sender-node", 5000, NodeState::Alive, 5),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ping");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ping");

        if let GossipMessage::Ping { from } = decoded {
            assert_eq!(from.id.0, "sender-node");
            assert_eq!(from.incarnation, 5);
            assert_eq!(from.http_addr.port(), 6000);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_gossip_ack_serialization() {
        let msg = GossipMessage::Ack {
            from: NodeId("responder".to_string()),
            incarnation: 10,
            members: vec![
                node("node-1", 5000, NodeState::Alive, 1),
                node("node-2", 5001, NodeState::Suspect, 2),
            ],
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ack");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ack");

        if let GossipMessage::Ack {
            from,
            incarnation,
            members,
        } = decoded
        {
            assert_eq!(from.0, "responder");
            assert_eq!(incarnation, 10);
            assert_eq!(members.len(), 2);
            assert_eq!(members[1].state, NodeState::Suspect);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_gossip_suspect_serialization() {
        let msg = GossipMessage::Suspect {
            node_id: NodeId("suspected-node".to_string()),
            incarnation: 15,
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Suspect");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Suspect");

        if let GossipMessage::Suspect {
            node_id,
            incarnation,
        } = decoded
        {
            assert_eq!(node_id.0, "suspected-node");
            assert_eq!(incarnation, 15);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // GOSSIP MEMBERSHIP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_starts_with_itself() {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap(); // port 0 = random available

        let membership = GossipMembership::new(bind_addr, vec![])
            .await
            .expect("Failed to create membership");

        let alive = membership.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, membership.local_node.id);
        assert_eq!(membership.members(), vec![membership.local_node.id.clone()]);
        assert_eq!(membership.local_id(), &membership.local_node.id);
    }

    #[tokio::test]
    async fn test_membership_get_member() {
        let membership = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();

        let member = membership.get_member(&membership.local_node.id);
        assert_eq!(member.map(|m| m.id), Some(membership.local_node.id.clone()));

        assert!(membership.get_member(&NodeId("non-existent".to_string())).is_none());
    }

    #[tokio::test]
    async fn test_membership_http_addr_is_gossip_port_plus_offset() {
        let membership = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();

        let gossip_port = membership.local_node.gossip_addr.port();
        assert_eq!(membership.local_node.http_addr.port(), gossip_port + 1000);
    }

    #[tokio::test]
    async fn test_dead_members_leave_the_view() {
        let membership = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let dead = node("dead-node", 5999, NodeState::Dead, 3);
        membership.members.insert(dead.id.clone(), dead);

        assert_eq!(membership.members().len(), 1);
    }

    #[tokio::test]
    async fn test_join_through_seed_notifies_subscribers() {
        // ARRANGE
        let seed = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        seed.clone().start().await;
        let mut changes = seed.subscribe();

        // ACT
        let joiner = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![seed.local_node.gossip_addr])
            .await
            .unwrap();
        joiner.clone().start().await;

        // ASSERT
        tokio::time::timeout(std::time::Duration::from_secs(5), changes.changed())
            .await
            .expect("seed never saw the join")
            .unwrap();
        assert!(seed.get_member(&joiner.local_node.id).is_some());
    }

    // ============================================================
    // PARTITIONING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_partition_of_key_is_stable() {
        let membership = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let config = NodeConfig::default();
        let partitioner = PartitionManager::new(&config, membership.clone() as Arc<dyn Membership>);

        let first = partitioner.get_partition("order-17");
        assert_eq!(partitioner.get_partition("order-17"), first);
        assert!(first < config.partition_count);
    }

    #[tokio::test]
    async fn test_owner_unknown_until_table_committed() {
        let membership = GossipMembership::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let partitioner = PartitionManager::new(&NodeConfig::default(), membership.clone() as Arc<dyn Membership>);

        assert!(partitioner.owner_of_key("k").is_none());

        partitioner.commit(partitioner.compute_table());
        assert_eq!(partitioner.owner_of_key("k"), Some(membership.local_node.id.clone()));
    }
}
