//! Cluster membership bookkeeping
//!
//! Records survive individual process crashes through TTL expiry: a live
//! process refreshes its own records every heartbeat interval, a crashed one
//! stops refreshing and its records fall out of reads on their own. No peer
//! has to detect the crash explicitly.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cluster::backend::SharedBackend;
use crate::cluster::{escape_segment, unescape_segment};
use crate::error::{Result, RoomcastError};

/// One `(namespace, room, connection, owner)` membership fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMembershipRecord {
    pub namespace: String,
    pub room: String,
    pub connection_id: String,
    pub owner_process_id: String,
    /// Epoch milliseconds; a record past this instant is logically absent
    pub expires_at: i64,
}

/// Durable-enough membership record shared by all processes.
///
/// Every mutation must be idempotent: duplicate add/remove calls from
/// retries must not corrupt counts.
#[async_trait]
pub trait ClusterStateStore: Send + Sync {
    async fn add_member(&self, namespace: &str, room: &str, connection_id: &str) -> Result<()>;

    async fn remove_member(&self, namespace: &str, room: &str, connection_id: &str) -> Result<()>;

    async fn list_members(&self, namespace: &str, room: &str)
        -> Result<Vec<ClusterMembershipRecord>>;

    /// Extends the TTL on every record owned by this process. Returns the
    /// number of records refreshed.
    async fn refresh_owner_lease(&self) -> Result<usize>;
}

/// Pass-through store for single-instance deployments. Membership truth
/// already lives in the local adapter; this only mirrors it so the two
/// deployment modes share one code path.
pub struct LocalStateStore {
    process_id: String,
    members: Mutex<HashSet<(String, String, String)>>,
}

impl LocalStateStore {
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
            members: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ClusterStateStore for LocalStateStore {
    async fn add_member(&self, namespace: &str, room: &str, connection_id: &str) -> Result<()> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).insert((
            namespace.to_string(),
            room.to_string(),
            connection_id.to_string(),
        ));
        Ok(())
    }

    async fn remove_member(&self, namespace: &str, room: &str, connection_id: &str) -> Result<()> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).remove(&(
            namespace.to_string(),
            room.to_string(),
            connection_id.to_string(),
        ));
        Ok(())
    }

    async fn list_members(
        &self,
        namespace: &str,
        room: &str,
    ) -> Result<Vec<ClusterMembershipRecord>> {
        let members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(members
            .iter()
            .filter(|(nsp, r, _)| nsp == namespace && r == room)
            .map(|(nsp, r, conn)| ClusterMembershipRecord {
                namespace: nsp.clone(),
                room: r.clone(),
                connection_id: conn.clone(),
                owner_process_id: self.process_id.clone(),
                expires_at: i64::MAX,
            })
            .collect())
    }

    async fn refresh_owner_lease(&self) -> Result<usize> {
        // Local records never expire; nothing to refresh.
        Ok(0)
    }
}

/// Value stored under each membership key
#[derive(Serialize, Deserialize)]
struct RecordValue {
    owner: String,
}

/// Membership store over the shared key/value backend
pub struct SharedStateStore<B: SharedBackend> {
    backend: Arc<B>,
    process_id: String,
    ttl: Duration,
}

const KEY_PREFIX: &str = "roomcast:member";

fn member_key(namespace: &str, room: &str, connection_id: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        KEY_PREFIX,
        escape_segment(namespace),
        escape_segment(room),
        escape_segment(connection_id)
    )
}

fn room_prefix(namespace: &str, room: &str) -> String {
    format!(
        "{}:{}:{}:",
        KEY_PREFIX,
        escape_segment(namespace),
        escape_segment(room)
    )
}

impl<B: SharedBackend> SharedStateStore<B> {
    pub fn new(backend: Arc<B>, process_id: &str, ttl: Duration) -> Self {
        Self {
            backend,
            process_id: process_id.to_string(),
            ttl,
        }
    }
}

#[async_trait]
impl<B: SharedBackend> ClusterStateStore for SharedStateStore<B> {
    async fn add_member(&self, namespace: &str, room: &str, connection_id: &str) -> Result<()> {
        let value = serde_json::to_string(&RecordValue {
            owner: self.process_id.clone(),
        })
        .map_err(|e| RoomcastError::StateStoreUnavailable(e.to_string()))?;
        self.backend
            .set_with_ttl(&member_key(namespace, room, connection_id), &value, self.ttl)
            .await
    }

    async fn remove_member(&self, namespace: &str, room: &str, connection_id: &str) -> Result<()> {
        self.backend
            .delete(&member_key(namespace, room, connection_id))
            .await
    }

    async fn list_members(
        &self,
        namespace: &str,
        room: &str,
    ) -> Result<Vec<ClusterMembershipRecord>> {
        let prefix = room_prefix(namespace, room);
        let entries = self.backend.scan_prefix(&prefix).await?;
        let now = Utc::now().timestamp_millis();
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let connection_id = unescape_segment(&key[prefix.len()..]);
            let owner = match serde_json::from_str::<RecordValue>(&value) {
                Ok(v) => v.owner,
                Err(e) => {
                    log::warn!("Dropping unreadable membership record {}: {}", key, e);
                    continue;
                }
            };
            records.push(ClusterMembershipRecord {
                namespace: namespace.to_string(),
                room: room.to_string(),
                connection_id,
                owner_process_id: owner,
                // The backend already filtered expired entries; expose the
                // lease horizon from now.
                expires_at: now + self.ttl.as_millis() as i64,
            });
        }
        Ok(records)
    }

    async fn refresh_owner_lease(&self) -> Result<usize> {
        let entries = self.backend.scan_prefix(&format!("{}:", KEY_PREFIX)).await?;
        let mut refreshed = 0;
        for (key, value) in entries {
            let owned = serde_json::from_str::<RecordValue>(&value)
                .map(|v| v.owner == self.process_id)
                .unwrap_or(false);
            if owned && self.backend.refresh_ttl(&key, self.ttl).await? {
                refreshed += 1;
            }
        }
        log::trace!("Refreshed lease on {} membership records", refreshed);
        Ok(refreshed)
    }
}
