//! WebSocket connection state
//! Wraps the write half of one client transport

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::Message;

use crate::auth::Claims;
use crate::core::packet::{Origin, Packet, EVENT_PING};
use crate::error::{Result, RoomcastError};
use serde_json::Value;

/// One registered client transport.
///
/// The read half lives in the websocket handler task; this struct owns the
/// write half plus the liveness bookkeeping the heartbeat sweep uses.
pub struct Connection {
    id: String,
    namespace_path: String,
    claims: Option<Claims>,
    /// Query parameters captured from the upgrade request
    handshake: HashMap<String, String>,
    sender: mpsc::UnboundedSender<Message>,
    /// Reset by any inbound frame, cleared before each sweep ping
    is_alive: AtomicBool,
    /// Set once by whichever close path wins; guarantees cleanup runs once
    closed: AtomicBool,
}

impl Connection {
    pub fn new(namespace_path: &str, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self::with_handshake(namespace_path, HashMap::new(), sender)
    }

    pub fn with_handshake(
        namespace_path: &str,
        handshake: HashMap<String, String>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace_path: namespace_path.to_string(),
            claims: None,
            handshake,
            sender,
            is_alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handshake(&self) -> &HashMap<String, String> {
        &self.handshake
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace_path(&self) -> &str {
        &self.namespace_path
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    pub fn set_claims(&mut self, claims: Claims) {
        self.claims = Some(claims);
    }

    /// Sends an application packet. Fails if the transport has closed; the
    /// server side never queues (queueing is the client's responsibility).
    pub fn send(&self, event: &str, payload: Value) -> Result<()> {
        let packet = Packet::new(event, payload, Origin::Server, &self.namespace_path);
        self.send_packet(&packet)
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send_raw(&packet.to_json())
    }

    pub fn send_raw(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomcastError::TransportClosed);
        }
        self.sender
            .send(Message::text(text))
            .map_err(|_| RoomcastError::TransportClosed)
    }

    /// Emits a liveness probe
    pub fn ping(&self) -> Result<()> {
        self.send(EVENT_PING, Value::Null)
    }

    /// Called on any inbound frame, including pongs
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
    }

    /// Clears the flag; returns the value it had before the sweep
    pub fn take_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::SeqCst)
    }

    /// Initiates transport shutdown. Returns true for the caller that wins
    /// the race; cleanup must only run for that caller. A sweep-triggered
    /// close and a transport-error close may both land here.
    pub fn begin_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a close frame; the read loop observing the closed channel ends
    /// the handler task.
    pub fn close(&self, code: u16, reason: &str) {
        if self.begin_close() {
            // The close frame needs an owned reason; the frame may outlive
            // this call.
            let _ = self.sender.send(Message::close_with(code, reason.to_string()));
        }
    }
}

// The sender half is opaque; show the identifying fields only.
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("namespace_path", &self.namespace_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
