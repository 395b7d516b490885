//! Cross-process broadcast replication
//!
//! Each room (and each namespace, for namespace-wide broadcasts) maps to one
//! topic. A publishing process delivers locally first and then publishes;
//! receiving processes perform local-only delivery after origin filtering.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cluster::backend::{BackendSubscription, SharedBackend};
use crate::cluster::escape_segment;
use crate::core::packet::BroadcastPacket;
use crate::error::Result;

pub type BrokerHandler = Arc<dyn Fn(BroadcastPacket) + Send + Sync>;

pub fn room_topic(namespace: &str, room: &str) -> String {
    format!(
        "roomcast:topic:{}:{}",
        escape_segment(namespace),
        escape_segment(room)
    )
}

pub fn namespace_topic(namespace: &str) -> String {
    format!("roomcast:topic:{}", escape_segment(namespace))
}

/// Handle owned by a Room while it has local members. Unsubscribes on drop;
/// dropping it before discarding the Room keeps the happens-before edge the
/// teardown protocol requires.
pub struct BrokerSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BrokerSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, packet: &BroadcastPacket) -> Result<()>;

    async fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<BrokerSubscription>;
}

type TopicRegistry = Arc<Mutex<HashMap<String, HashMap<u64, BrokerHandler>>>>;

/// Direct synchronous callback map, no network hop. Used for single-instance
/// deployments and tests; origin filtering in the room callbacks makes the
/// echoed delivery a no-op.
#[derive(Default)]
pub struct InProcessBroker {
    topics: TopicRegistry,
    next_id: AtomicU64,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscription count for a topic (test observability)
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn publish(&self, topic: &str, packet: &BroadcastPacket) -> Result<()> {
        let handlers: Vec<BrokerHandler> = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics
                .get(topic)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(packet.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<BrokerSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics
                .entry(topic.to_string())
                .or_default()
                .insert(id, handler);
        }
        let registry = self.topics.clone();
        let topic = topic.to_string();
        Ok(BrokerSubscription::new(move || {
            let mut topics = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(subs) = topics.get_mut(&topic) {
                subs.remove(&id);
                if subs.is_empty() {
                    topics.remove(&topic);
                }
            }
        }))
    }
}

/// Broker over the shared backend's pub/sub channels. Payloads travel as
/// JSON; a malformed payload is logged and dropped, never allowed to crash
/// the receiving process.
pub struct SharedBroker<B: SharedBackend> {
    backend: Arc<B>,
}

impl<B: SharedBackend> SharedBroker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: SharedBackend + 'static> Broker for SharedBroker<B> {
    async fn publish(&self, topic: &str, packet: &BroadcastPacket) -> Result<()> {
        let payload = serde_json::to_string(packet)
            .map_err(|e| crate::error::RoomcastError::BrokerUnavailable(e.to_string()))?;
        self.backend.publish(topic, &payload).await
    }

    async fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<BrokerSubscription> {
        let topic_name = topic.to_string();
        let backend_sub: BackendSubscription = self
            .backend
            .subscribe(
                topic,
                Arc::new(move |payload: &str| {
                    match serde_json::from_str::<BroadcastPacket>(payload) {
                        Ok(packet) => handler(packet),
                        Err(e) => {
                            log::warn!(
                                "Discarding malformed broker payload on {}: {}",
                                topic_name,
                                e
                            );
                        }
                    }
                }),
            )
            .await?;
        Ok(BrokerSubscription::new(move || {
            backend_sub.unsubscribe();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::backend::MemoryBackend;
    use crate::core::packet::BroadcastScope;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn packet(origin: &str) -> BroadcastPacket {
        BroadcastPacket::new("chat", json!({"n": 1}), origin, BroadcastScope::default())
    }

    #[test]
    fn test_delimiter_in_names_keeps_topics_distinct() {
        assert_ne!(room_topic("/chat", "a:b"), room_topic("/chat:a", "b"));
        assert_ne!(
            namespace_topic("/chat:general"),
            room_topic("/chat", "general")
        );
    }

    #[tokio::test]
    async fn test_in_process_publish_subscribe_cycle() {
        let broker = InProcessBroker::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let sub = broker
            .subscribe(
                &room_topic("/chat", "general"),
                Arc::new(move |_packet| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        assert_eq!(broker.subscription_count(&room_topic("/chat", "general")), 1);

        broker
            .publish(&room_topic("/chat", "general"), &packet("p1"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(broker.subscription_count(&room_topic("/chat", "general")), 0);
        broker
            .publish(&room_topic("/chat", "general"), &packet("p1"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_broker_drops_malformed_payloads() {
        let backend = MemoryBackend::new();
        let broker = SharedBroker::new(backend.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let _sub = broker
            .subscribe(
                "topic",
                Arc::new(move |_packet| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        backend.publish("topic", "{ not a packet").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        broker.publish("topic", &packet("p1")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_broker_crosses_instances() {
        let backend = MemoryBackend::new();
        let broker_a = SharedBroker::new(backend.clone());
        let broker_b = SharedBroker::new(backend.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let _sub = broker_b
            .subscribe(
                "topic",
                Arc::new(move |p| {
                    assert_eq!(p.origin_process_id, "a");
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        broker_a.publish("topic", &packet("a")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
