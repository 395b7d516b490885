//! Server: namespace registry, upgrade-path resolution, and the periodic
//! heartbeat and lease-refresh loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

use crate::cluster::{Broker, ClusterStateStore, InProcessBroker, LocalStateStore};
use crate::config::ServerConfig;
use crate::core::namespace::Namespace;
use crate::core::task::ScheduledTask;
use crate::error::{Result, RoomcastError};

pub struct Server {
    config: ServerConfig,
    /// Identifies this process in membership records and broadcast origins
    process_id: String,
    store: Arc<dyn ClusterStateStore>,
    broker: Arc<dyn Broker>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

fn normalize_path(name: &str) -> String {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl Server {
    /// Single-instance wiring: local membership mirror, in-process broker.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let process_id = Uuid::new_v4().to_string();
        let store = Arc::new(LocalStateStore::new(&process_id));
        let broker = Arc::new(InProcessBroker::new());
        Self::with_cluster_parts(config, process_id, store, broker)
    }

    /// Cluster wiring: shared membership store and broker, typically both
    /// over one external key/value + pub/sub backend.
    pub fn with_cluster(
        config: ServerConfig,
        process_id: &str,
        store: Arc<dyn ClusterStateStore>,
        broker: Arc<dyn Broker>,
    ) -> Arc<Self> {
        Self::with_cluster_parts(config, process_id.to_string(), store, broker)
    }

    fn with_cluster_parts(
        config: ServerConfig,
        process_id: String,
        store: Arc<dyn ClusterStateStore>,
        broker: Arc<dyn Broker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            process_id,
            store,
            broker,
            namespaces: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Returns the namespace at `path`, registering it on first use
    pub async fn namespace(&self, path: &str) -> Result<Arc<Namespace>> {
        let path = normalize_path(path);
        if let Some(namespace) = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
        {
            return Ok(namespace.clone());
        }

        let namespace = Namespace::new(
            &path,
            &self.process_id,
            self.store.clone(),
            self.broker.clone(),
        )
        .await?;
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // A concurrent caller may have registered it between the read and
        // the write; keep the first one and let ours drop its subscription.
        Ok(namespaces
            .entry(path)
            .or_insert(namespace)
            .clone())
    }

    /// Resolves an upgrade-path segment to a registered namespace. Unknown
    /// paths are rejected before the transport is upgraded.
    pub fn resolve(&self, name: &str) -> Result<Arc<Namespace>> {
        let path = normalize_path(name);
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .cloned()
            .ok_or(RoomcastError::UnknownNamespace(path))
    }

    /// Starts the heartbeat sweep and the owner-lease refresh loop
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        let server = Arc::clone(self);
        tasks.push(ScheduledTask::spawn(self.config.sweep_interval, move || {
            let server = server.clone();
            async move {
                server.sweep().await;
            }
        }));

        let store = self.store.clone();
        tasks.push(ScheduledTask::spawn(
            self.config.lease_refresh_interval,
            move || {
                let store = store.clone();
                async move {
                    if let Err(e) = store.refresh_owner_lease().await {
                        log::warn!("Owner lease refresh failed: {}", e);
                    }
                }
            },
        ));
        log::info!(
            "Server {} started: sweep every {:?}, lease refresh every {:?}",
            self.process_id,
            self.config.sweep_interval,
            self.config.lease_refresh_interval
        );
    }

    /// Cancels the periodic loops
    pub fn stop(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// One heartbeat cycle: a connection whose flag was never reset since
    /// the previous cycle is force-closed with full cleanup; every surviving
    /// connection has its flag cleared and gets a ping. A peer that never
    /// answers is therefore gone within roughly two cycles.
    pub async fn sweep(&self) {
        let namespaces: Vec<Arc<Namespace>> = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for namespace in namespaces {
            for connection in namespace.connections_snapshot() {
                if !connection.take_alive() {
                    log::info!(
                        "Evicting unresponsive connection {} on {}",
                        connection.id(),
                        namespace.path()
                    );
                    connection.close(1001, "heartbeat timeout");
                    namespace.disconnect(connection.id()).await;
                } else if connection.ping().is_err() {
                    namespace.disconnect(connection.id()).await;
                }
            }
        }
    }
}
