//! Namespace: one isolated application context
//!
//! Owns the connection registry, the room registry, the local adapter, and
//! the accept-middleware chain. Inbound packets are routed here; outbound
//! fan-out goes through the adapter for local members and the broker for
//! members on other processes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::Mutex;

use crate::cluster::{namespace_topic, room_topic, Broker, BrokerSubscription, ClusterStateStore};
use crate::core::adapter::LocalAdapter;
use crate::core::connection::Connection;
use crate::core::packet::{
    BroadcastPacket, BroadcastScope, Packet, EVENT_JOIN_ROOM, EVENT_LEAVE_ROOM, EVENT_PING,
    EVENT_PONG, EVENT_REJECTED, EVENT_WELCOME,
};
use crate::core::room::Room;
use crate::error::{Result, RoomcastError};

/// Accept gate run on every new connection before registration. A rejecting
/// middleware keeps the connection out of the registry entirely.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn accept(&self, connection: &mut Connection) -> Result<()>;
}

/// Application handler for non-control packets
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, namespace: &Namespace, connection: &Arc<Connection>, packet: Packet);
}

#[derive(Default)]
struct NamespaceState {
    connections: HashMap<String, Arc<Connection>>,
    rooms: HashMap<String, Room>,
    adapter: LocalAdapter,
}

pub struct Namespace {
    path: String,
    process_id: String,
    store: Arc<dyn ClusterStateStore>,
    broker: Arc<dyn Broker>,
    state: Arc<RwLock<NamespaceState>>,
    /// Serializes membership mutations so broker teardown and re-subscribe
    /// for one room name never interleave.
    membership_gate: Mutex<()>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    /// Namespace-wide broadcasts from other processes arrive here
    _namespace_subscription: BrokerSubscription,
}

/// Delivers a replicated packet to local connections only. Never publishes.
fn deliver_local(state: &NamespaceState, packet: &BroadcastPacket) -> usize {
    let targets: Vec<Arc<Connection>> = if packet.scope.rooms.is_empty() {
        state.connections.values().cloned().collect()
    } else {
        state
            .adapter
            .members_union(&packet.scope.rooms)
            .into_iter()
            .filter_map(|id| state.connections.get(&id).cloned())
            .collect()
    };

    let mut delivered = 0;
    for connection in targets {
        if packet.scope.except_ids.iter().any(|id| id == connection.id()) {
            continue;
        }
        match connection.send(&packet.event, packet.payload.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => log::debug!("Skipping send to {}: {}", connection.id(), e),
        }
    }
    delivered
}

/// Broker callback shared by room and namespace topics: filter out our own
/// echoes, then do local-only delivery.
fn replication_callback(
    state: Weak<RwLock<NamespaceState>>,
    process_id: String,
) -> crate::cluster::BrokerHandler {
    Arc::new(move |packet: BroadcastPacket| {
        if packet.origin_process_id == process_id {
            return;
        }
        if let Some(state) = state.upgrade() {
            let guard = state.read().unwrap_or_else(PoisonError::into_inner);
            let count = deliver_local(&guard, &packet);
            log::trace!("Replicated {} to {} local members", packet.event, count);
        }
    })
}

impl Namespace {
    pub(crate) async fn new(
        path: &str,
        process_id: &str,
        store: Arc<dyn ClusterStateStore>,
        broker: Arc<dyn Broker>,
    ) -> Result<Arc<Self>> {
        let state: Arc<RwLock<NamespaceState>> = Arc::new(RwLock::new(NamespaceState::default()));
        let subscription = broker
            .subscribe(
                &namespace_topic(path),
                replication_callback(Arc::downgrade(&state), process_id.to_string()),
            )
            .await?;
        Ok(Arc::new(Self {
            path: path.to_string(),
            process_id: process_id.to_string(),
            store,
            broker,
            state,
            membership_gate: Mutex::new(()),
            middleware: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            _namespace_subscription: subscription,
        }))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn read_state(&self) -> RwLockReadGuard<'_, NamespaceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, NamespaceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an accept-middleware; middlewares run in registration order
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    pub fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Runs the middleware chain and registers the connection. A vetoed
    /// connection receives one explanatory packet, is closed, and never
    /// enters the registry or any room.
    pub async fn add_connection(&self, mut connection: Connection) -> Result<Arc<Connection>> {
        let chain: Vec<Arc<dyn Middleware>> = self
            .middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for middleware in chain {
            if let Err(e) = middleware.accept(&mut connection).await {
                let _ = connection.send(EVENT_REJECTED, json!({ "reason": e.to_string() }));
                connection.close(1008, "rejected");
                log::info!("Connection rejected on {}: {}", self.path, e);
                return Err(e);
            }
        }

        let connection = Arc::new(connection);
        let count = {
            let mut state = self.write_state();
            state
                .connections
                .insert(connection.id().to_string(), connection.clone());
            state.connections.len()
        };
        let _ = connection.send(EVENT_WELCOME, json!({ "clientId": connection.id() }));
        log::info!(
            "Client connected: {} on {} ({} total)",
            connection.id(),
            self.path,
            count
        );
        Ok(connection)
    }

    /// Adds a connection to a room. Idempotent; the first local member also
    /// subscribes the room's broker topic. On a store failure the local
    /// change is rolled back and the error surfaced as retryable.
    pub async fn join(&self, connection_id: &str, room: &str) -> Result<()> {
        let _gate = self.membership_gate.lock().await;

        let first_member = {
            let mut state = self.write_state();
            if !state.connections.contains_key(connection_id) {
                return Err(RoomcastError::ConnectionNotFound(connection_id.to_string()));
            }
            if state.adapter.has_member(room, connection_id) {
                return Ok(());
            }
            state.adapter.add(room, connection_id);
            state.adapter.room_size(room) == 1
        };

        if let Err(e) = self.store.add_member(&self.path, room, connection_id).await {
            self.write_state().adapter.remove(room, connection_id);
            log::warn!(
                "Membership record write failed for {} in {}: {}",
                connection_id,
                room,
                e
            );
            return Err(e);
        }

        if first_member {
            let callback =
                replication_callback(Arc::downgrade(&self.state), self.process_id.clone());
            match self
                .broker
                .subscribe(&room_topic(&self.path, room), callback)
                .await
            {
                Ok(subscription) => {
                    self.write_state()
                        .rooms
                        .insert(room.to_string(), Room::new(subscription));
                }
                Err(e) => {
                    self.write_state().adapter.remove(room, connection_id);
                    if let Err(store_err) =
                        self.store.remove_member(&self.path, room, connection_id).await
                    {
                        log::warn!(
                            "Rollback of membership record failed, TTL will reclaim it: {}",
                            store_err
                        );
                    }
                    return Err(e);
                }
            }
        }

        log::debug!("{} joined {} on {}", connection_id, room, self.path);
        Ok(())
    }

    /// Removes a connection from a room. The last local member out tears
    /// down the broker subscription before the Room leaves the registry.
    pub async fn leave(&self, connection_id: &str, room: &str) -> Result<()> {
        let _gate = self.membership_gate.lock().await;

        let subscription = {
            let mut state = self.write_state();
            if !state.adapter.remove(room, connection_id) {
                return Ok(());
            }
            if state.adapter.room_size(room) == 0 {
                let subscription = state.rooms.get_mut(room).and_then(Room::take_subscription);
                state.rooms.remove(room);
                subscription
            } else {
                None
            }
        };
        if let Some(subscription) = subscription {
            // The membership gate keeps this teardown ordered before any
            // re-subscribe a fresh join would perform.
            subscription.unsubscribe();
            log::debug!("Room {} on {} destroyed", room, self.path);
        }

        if let Err(e) = self.store.remove_member(&self.path, room, connection_id).await {
            log::warn!(
                "Membership record delete failed for {} in {}, record expires via TTL: {}",
                connection_id,
                room,
                e
            );
            return Err(e);
        }
        log::debug!("{} left {} on {}", connection_id, room, self.path);
        Ok(())
    }

    /// Emits to the union of local members across the named rooms, minus the
    /// except-set, exactly once per connection, then publishes one packet so
    /// other processes replicate the local step against their own adapters.
    pub async fn emit_to_rooms(
        &self,
        rooms: &[String],
        event: &str,
        payload: Value,
        except_ids: &[String],
    ) -> Result<usize> {
        let packet = BroadcastPacket::new(
            event,
            payload,
            &self.process_id,
            BroadcastScope {
                rooms: rooms.to_vec(),
                except_ids: except_ids.to_vec(),
            },
        );

        // Local members first, so they never observe replicated duplicates.
        let delivered = deliver_local(&self.read_state(), &packet);

        // A single-room emit rides the room's own topic; a multi-room emit
        // uses the namespace topic so overlapping membership on a remote
        // process still gets exactly one delivery.
        let topic = match rooms {
            [only] => room_topic(&self.path, only),
            _ => namespace_topic(&self.path),
        };
        self.broker.publish(&topic, &packet).await?;
        Ok(delivered)
    }

    /// Single-room convenience over `emit_to_rooms`
    pub async fn emit(
        &self,
        room: &str,
        event: &str,
        payload: Value,
        except_ids: &[String],
    ) -> Result<usize> {
        self.emit_to_rooms(&[room.to_string()], event, payload, except_ids)
            .await
    }

    /// Delivers to every registered local connection, then publishes on the
    /// namespace-wide topic.
    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<usize> {
        self.emit_to_rooms(&[], event, payload, &[]).await
    }

    /// Routes one inbound frame: control events are consumed here,
    /// application events go to the registered handler (or, absent one, are
    /// relayed to the rooms named in their metadata, excluding the sender).
    /// Malformed frames are logged and dropped; the connection stays open.
    pub async fn handle_packet(&self, connection: &Arc<Connection>, raw: &str) {
        connection.mark_alive();

        let packet = match Packet::parse(raw) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping malformed packet from {}: {}", connection.id(), e);
                return;
            }
        };

        match packet.event.as_str() {
            EVENT_PING => {
                let _ = connection.send(EVENT_PONG, Value::Null);
            }
            EVENT_PONG => {}
            EVENT_JOIN_ROOM | EVENT_LEAVE_ROOM => {
                let room = match packet.room_name() {
                    Ok(room) => room,
                    Err(e) => {
                        log::warn!("Dropping room command from {}: {}", connection.id(), e);
                        return;
                    }
                };
                let result = if packet.event == EVENT_JOIN_ROOM {
                    self.join(connection.id(), &room).await
                } else {
                    self.leave(connection.id(), &room).await
                };
                if let Err(e) = result {
                    log::warn!(
                        "Room command {} for {} failed: {}",
                        packet.event,
                        connection.id(),
                        e
                    );
                }
            }
            _ => {
                let handler = self
                    .handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(handler) = handler {
                    handler.handle(self, connection, packet).await;
                    return;
                }
                let Packet {
                    event,
                    data,
                    metadata,
                } = packet;
                match metadata.rooms.filter(|rooms| !rooms.is_empty()) {
                    Some(rooms) => {
                        let except = vec![connection.id().to_string()];
                        if let Err(e) = self.emit_to_rooms(&rooms, &event, data, &except).await {
                            log::warn!("Relay of {} failed: {}", event, e);
                        }
                    }
                    None => {
                        log::debug!(
                            "No handler for event {} from {}, dropping",
                            event,
                            connection.id()
                        );
                    }
                }
            }
        }
    }

    /// Full cleanup for one connection: close the transport, detach it from
    /// every room, drop it from the registry. Idempotent; the sweep and the
    /// transport-error path may both call it.
    pub async fn disconnect(&self, connection_id: &str) {
        let (connection, rooms) = {
            let mut state = self.write_state();
            let connection = state.connections.remove(connection_id);
            let rooms = state.adapter.connection_rooms(connection_id);
            (connection, rooms)
        };
        let Some(connection) = connection else {
            return;
        };
        connection.close(1000, "disconnect");
        for room in rooms {
            if let Err(e) = self.leave(connection_id, &room).await {
                log::warn!(
                    "Detaching {} from {} during disconnect failed: {}",
                    connection_id,
                    room,
                    e
                );
            }
        }
        log::info!(
            "Client disconnected: {} from {} ({} remaining)",
            connection_id,
            self.path,
            self.connection_count()
        );
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.read_state().connections.get(connection_id).cloned()
    }

    pub fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.read_state().connections.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read_state().connections.len()
    }

    pub fn local_member_count(&self, room: &str) -> usize {
        self.read_state().adapter.room_size(room)
    }

    pub fn room_exists(&self, room: &str) -> bool {
        self.read_state().rooms.contains_key(room)
    }

    /// Rooms a connection currently belongs to (adapter reverse index)
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<String> {
        self.read_state().adapter.connection_rooms(connection_id)
    }

    /// Cluster-wide membership for a room, ghost records filtered by TTL
    pub async fn cluster_members(
        &self,
        room: &str,
    ) -> Result<Vec<crate::cluster::ClusterMembershipRecord>> {
        self.store.list_members(&self.path, room).await
    }
}
