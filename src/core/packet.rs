//! Wire packet types shared by server and client

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RoomcastError};

/// Control events, never forwarded to application handlers
pub const EVENT_JOIN_ROOM: &str = "join_room";
pub const EVENT_LEAVE_ROOM: &str = "leave_room";
pub const EVENT_PING: &str = "ping";
pub const EVENT_PONG: &str = "pong";
/// Sent once to a connection vetoed by the middleware chain, before close
pub const EVENT_REJECTED: &str = "rejected";
/// Sent once on successful registration
pub const EVENT_WELCOME: &str = "welcome";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub from: Origin,
    pub nsp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<String>>,
    /// Epoch milliseconds
    pub time: i64,
}

/// One JSON frame on the wire: `{event, data, metadata}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub metadata: Metadata,
}

impl Packet {
    pub fn new(event: impl Into<String>, data: Value, from: Origin, nsp: &str) -> Self {
        Self {
            event: event.into(),
            data,
            metadata: Metadata {
                from,
                nsp: nsp.to_string(),
                rooms: None,
                time: Utc::now().timestamp_millis(),
            },
        }
    }

    pub fn with_rooms(mut self, rooms: Vec<String>) -> Self {
        self.metadata.rooms = Some(rooms);
        self
    }

    /// Room name carried by a `join_room`/`leave_room` control packet
    pub fn room_name(&self) -> Result<String> {
        self.data
            .get("roomName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                RoomcastError::MalformedPacket(format!(
                    "{} packet is missing a roomName field",
                    self.event
                ))
            })
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| RoomcastError::MalformedPacket(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Packet contains only JSON-representable fields
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Which local connections a replicated broadcast targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastScope {
    /// Target rooms; empty means the whole namespace
    pub rooms: Vec<String>,
    /// Connection ids excluded from delivery
    pub except_ids: Vec<String>,
}

/// Envelope replicated between processes through the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPacket {
    pub event: String,
    pub payload: Value,
    pub origin_process_id: String,
    pub scope: BroadcastScope,
    /// Epoch milliseconds at publish time
    pub timestamp: i64,
}

impl BroadcastPacket {
    pub fn new(
        event: impl Into<String>,
        payload: Value,
        origin_process_id: &str,
        scope: BroadcastScope,
    ) -> Self {
        Self {
            event: event.into(),
            payload,
            origin_process_id: origin_process_id.to_string(),
            scope,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
