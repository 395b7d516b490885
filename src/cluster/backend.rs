//! Shared storage backend seam
//!
//! The cluster mode needs one external collaborator: a key/value store with
//! per-entry TTL plus a publish/subscribe channel (a Redis-shaped surface).
//! The trait keeps storage-engine concerns out of this crate; the in-memory
//! implementation backs single-binary deployments and lets tests run several
//! logical processes against one shared backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Callback invoked with each raw payload published on a subscribed channel
pub type BackendHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Unsubscribes the underlying channel registration when dropped
pub struct BackendSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BackendSubscription {
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

impl Drop for BackendSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Key/value store with TTL plus pub/sub, shared by every process
#[async_trait]
pub trait SharedBackend: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Live entries whose key starts with `prefix`. Entries past their TTL
    /// are logically absent and must not be returned, garbage-collected or
    /// not.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Extends the TTL of a live entry. Returns false if the key is absent
    /// or already expired.
    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str, handler: BackendHandler)
        -> Result<BackendSubscription>;
}

type ChannelRegistry = Arc<Mutex<HashMap<String, HashMap<u64, BackendHandler>>>>;

/// In-memory backend: one instance shared by every "process" in a test or a
/// single-binary deployment.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    channels: ChannelRegistry,
    next_subscriber_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SharedBackend for MemoryBackend {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .filter(|(key, (_, expires_at))| key.starts_with(prefix) && *expires_at > now)
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect())
    }

    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some((_, expires_at)) if *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // Snapshot the handlers so a handler re-entering the backend does
        // not deadlock on the registry lock.
        let handlers: Vec<BackendHandler> = {
            let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .get(channel)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(payload);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: BackendHandler,
    ) -> Result<BackendSubscription> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(channel.to_string())
                .or_default()
                .insert(id, handler);
        }
        let registry = self.channels.clone();
        let channel = channel.to_string();
        Ok(BackendSubscription::new(move || {
            let mut channels = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(subs) = channels.get_mut(&channel) {
                subs.remove(&id);
                if subs.is_empty() {
                    channels.remove(&channel);
                }
            }
        }))
    }
}

impl MemoryBackend {
    /// Number of live subscriptions on a channel (test observability)
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_ttl_filters_expired_entries() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl("member:a", "x", Duration::from_millis(20))
            .await
            .unwrap();
        backend
            .set_with_ttl("member:b", "y", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(backend.scan_prefix("member:").await.unwrap().len(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let live = backend.scan_prefix("member:").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, "member:b");
    }

    #[tokio::test]
    async fn test_refresh_extends_live_entry_only() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(backend.refresh_ttl("k", Duration::from_secs(60)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Still live because of the refresh
        assert_eq!(backend.scan_prefix("k").await.unwrap().len(), 1);
        // Refreshing a missing key reports false
        assert!(!backend.refresh_ttl("gone", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_until_unsubscribe() {
        let backend = MemoryBackend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = backend
            .subscribe(
                "topic",
                Arc::new(move |_payload| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        backend.publish("topic", "one").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(backend.subscriber_count("topic"), 1);

        sub.unsubscribe();
        backend.publish("topic", "two").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(backend.subscriber_count("topic"), 0);
    }
}
