//! Room membership and local fan-out scenarios

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warp::ws::Message;

use roomcast::cluster::{
    room_topic, ClusterMembershipRecord, ClusterStateStore, MemoryBackend, SharedBroker,
    SharedStateStore,
};
use roomcast::config::ServerConfig;
use roomcast::core::{Connection, Namespace, Packet, Server};
use roomcast::error::{Result, RoomcastError};

fn cluster_server(backend: &Arc<MemoryBackend>, process_id: &str) -> Arc<Server> {
    let store = Arc::new(SharedStateStore::new(
        backend.clone(),
        process_id,
        Duration::from_secs(5),
    ));
    let broker = Arc::new(SharedBroker::new(backend.clone()));
    Server::with_cluster(ServerConfig::for_testing(), process_id, store, broker)
}

async fn register(
    namespace: &Arc<Namespace>,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = namespace
        .add_connection(Connection::new(namespace.path(), tx))
        .await
        .unwrap();
    (connection, rx)
}

/// Application packets received so far, welcome and ping/pong filtered out
fn received_events(rx: &mut mpsc::UnboundedReceiver<Message>, event: &str) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Ok(text) = message.to_str() {
            if let Ok(packet) = Packet::parse(text) {
                if packet.event == event {
                    packets.push(packet);
                }
            }
        }
    }
    packets
}

#[tokio::test]
async fn test_member_count_tracks_joins_and_leaves() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();

    let mut connections = Vec::new();
    for _ in 0..5 {
        connections.push(register(&namespace).await);
    }
    for (connection, _) in &connections {
        namespace.join(connection.id(), "general").await.unwrap();
    }
    assert_eq!(namespace.local_member_count("general"), 5);
    assert!(namespace.room_exists("general"));

    for (connection, _) in connections.iter().take(3) {
        namespace.leave(connection.id(), "general").await.unwrap();
    }
    assert_eq!(namespace.local_member_count("general"), 2);
    assert!(namespace.room_exists("general"));

    for (connection, _) in connections.iter().skip(3) {
        namespace.leave(connection.id(), "general").await.unwrap();
    }
    assert_eq!(namespace.local_member_count("general"), 0);
    assert!(!namespace.room_exists("general"));
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();
    let (connection, _rx) = register(&namespace).await;

    namespace.join(connection.id(), "general").await.unwrap();
    namespace.join(connection.id(), "general").await.unwrap();
    assert_eq!(namespace.local_member_count("general"), 1);

    namespace.leave(connection.id(), "general").await.unwrap();
    namespace.leave(connection.id(), "general").await.unwrap();
    assert_eq!(namespace.local_member_count("general"), 0);
}

#[tokio::test]
async fn test_rejoin_recreates_broker_subscription() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();
    let topic = room_topic("/chat", "general");

    let (c1, _rx1) = register(&namespace).await;
    let (c2, _rx2) = register(&namespace).await;
    let (c3, _rx3) = register(&namespace).await;

    namespace.join(c1.id(), "general").await.unwrap();
    namespace.join(c2.id(), "general").await.unwrap();
    assert_eq!(backend.subscriber_count(&topic), 1, "one subscription per room");

    namespace.leave(c1.id(), "general").await.unwrap();
    assert_eq!(backend.subscriber_count(&topic), 1, "room still has a member");
    namespace.leave(c2.id(), "general").await.unwrap();
    assert_eq!(backend.subscriber_count(&topic), 0, "empty room unsubscribed");
    assert!(!namespace.room_exists("general"));

    namespace.join(c3.id(), "general").await.unwrap();
    assert_eq!(backend.subscriber_count(&topic), 1, "rejoin resubscribed");
    assert!(namespace.room_exists("general"));
}

#[tokio::test]
async fn test_emit_honors_except_set() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();

    let (c1, mut rx1) = register(&namespace).await;
    let (c2, mut rx2) = register(&namespace).await;
    namespace.join(c1.id(), "general").await.unwrap();
    namespace.join(c2.id(), "general").await.unwrap();

    let delivered = namespace
        .emit(
            "general",
            "chat",
            json!({"text": "hello"}),
            &[c1.id().to_string()],
        )
        .await
        .unwrap();

    assert_eq!(delivered, 1);
    assert_eq!(received_events(&mut rx2, "chat").len(), 1);
    assert_eq!(received_events(&mut rx1, "chat").len(), 0);
}

#[tokio::test]
async fn test_multi_room_emit_delivers_once_per_connection() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();

    // c1 sits in both targeted rooms, c2 in one, c3 in neither
    let (c1, mut rx1) = register(&namespace).await;
    let (c2, mut rx2) = register(&namespace).await;
    let (c3, mut rx3) = register(&namespace).await;
    namespace.join(c1.id(), "red").await.unwrap();
    namespace.join(c1.id(), "blue").await.unwrap();
    namespace.join(c2.id(), "blue").await.unwrap();
    namespace.join(c3.id(), "green").await.unwrap();

    let delivered = namespace
        .emit_to_rooms(
            &["red".to_string(), "blue".to_string()],
            "announce",
            json!({"n": 1}),
            &[],
        )
        .await
        .unwrap();

    assert_eq!(delivered, 2);
    assert_eq!(received_events(&mut rx1, "announce").len(), 1);
    assert_eq!(received_events(&mut rx2, "announce").len(), 1);
    assert_eq!(received_events(&mut rx3, "announce").len(), 0);
}

#[tokio::test]
async fn test_namespace_broadcast_reaches_all_connections() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();

    let (_c1, mut rx1) = register(&namespace).await;
    let (_c2, mut rx2) = register(&namespace).await;

    let delivered = namespace.broadcast("notice", json!("maintenance")).await.unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(received_events(&mut rx1, "notice").len(), 1);
    assert_eq!(received_events(&mut rx2, "notice").len(), 1);
}

#[tokio::test]
async fn test_disconnect_detaches_from_all_rooms() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();

    let (c1, _rx1) = register(&namespace).await;
    let (c2, _rx2) = register(&namespace).await;
    namespace.join(c1.id(), "red").await.unwrap();
    namespace.join(c1.id(), "blue").await.unwrap();
    namespace.join(c2.id(), "red").await.unwrap();

    namespace.disconnect(c1.id()).await;
    // Second call is a no-op
    namespace.disconnect(c1.id()).await;

    assert_eq!(namespace.connection_count(), 1);
    assert_eq!(namespace.local_member_count("red"), 1);
    assert_eq!(namespace.local_member_count("blue"), 0);
    assert!(!namespace.room_exists("blue"));
    assert!(namespace
        .cluster_members("red")
        .await
        .unwrap()
        .iter()
        .all(|record| record.connection_id == c2.id()));
}

/// Store that refuses every write, for rollback coverage
struct FailingStore;

#[async_trait]
impl ClusterStateStore for FailingStore {
    async fn add_member(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Err(RoomcastError::StateStoreUnavailable("store down".to_string()))
    }
    async fn remove_member(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Err(RoomcastError::StateStoreUnavailable("store down".to_string()))
    }
    async fn list_members(&self, _: &str, _: &str) -> Result<Vec<ClusterMembershipRecord>> {
        Err(RoomcastError::StateStoreUnavailable("store down".to_string()))
    }
    async fn refresh_owner_lease(&self) -> Result<usize> {
        Err(RoomcastError::StateStoreUnavailable("store down".to_string()))
    }
}

#[tokio::test]
async fn test_store_failure_rolls_back_local_join() {
    let backend = MemoryBackend::new();
    let broker = Arc::new(SharedBroker::new(backend.clone()));
    let server = Server::with_cluster(
        ServerConfig::for_testing(),
        "p1",
        Arc::new(FailingStore),
        broker,
    );
    let namespace = server.namespace("/chat").await.unwrap();
    let (connection, _rx) = register(&namespace).await;

    let err = namespace.join(connection.id(), "general").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, RoomcastError::StateStoreUnavailable(_)));

    // Local state rolled back: no membership, no room, no subscription
    assert_eq!(namespace.local_member_count("general"), 0);
    assert!(!namespace.room_exists("general"));
    assert_eq!(backend.subscriber_count(&room_topic("/chat", "general")), 0);
}

#[tokio::test]
async fn test_join_requires_registered_connection() {
    let backend = MemoryBackend::new();
    let server = cluster_server(&backend, "p1");
    let namespace = server.namespace("/chat").await.unwrap();

    let err = namespace.join("ghost", "general").await.unwrap_err();
    assert!(matches!(err, RoomcastError::ConnectionNotFound(_)));
}
