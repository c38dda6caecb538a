//! Wire frame model for the persistent chat connection
//!
//! Every unit exchanged over the WebSocket is a JSON frame tagged with a
//! `type` discriminant, an optional `status`, and a kind-specific `data`
//! payload. Some servers relay the payload as a nested JSON string rather
//! than an object, so inbound payload access goes through a second,
//! best-effort decode step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;

use crate::core::presence::OnlineUser;

/// Frame kind discriminants as they appear on the wire.
pub const KIND_PRESENCE_SNAPSHOT: &str = "presence_snapshot";
pub const KIND_USER_PRESENCE: &str = "user_presence";
pub const KIND_MESSAGE: &str = "message";
pub const KIND_JOIN_ROOM: &str = "join_room";
pub const KIND_CREATE_ROOM: &str = "create_room";
pub const KIND_REACT_MESSAGE: &str = "react_message";

/// `status` values accompanying `user_presence` frames.
pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// A frame sent to the server.
///
/// Serializes to `{"type": "<kind>", "data": {...}}` with camelCase
/// payload fields, matching the server's expected shapes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    Message {
        content: String,
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_content: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CreateRoom { chat_name: String, background: String },
    #[serde(rename_all = "camelCase")]
    ReactMessage {
        message_id: String,
        react_type: String,
    },
}

/// A frame received from the server, decoded at the outer level only.
///
/// The payload is kept as raw JSON; callers pick a typed view with the
/// accessors below once they have looked at [`InboundFrame::kind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// A chat message relayed into a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_profile: u8,
    pub content: String,
    #[serde(default)]
    pub reply_content: Option<String>,
    #[serde(default)]
    pub reactions: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshotPayload {
    pub users: Vec<OnlineUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreatedPayload {
    pub room_id: String,
    pub created_by: String,
    pub chat_name: String,
    #[serde(default)]
    pub background: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub message_id: String,
    pub react_type: String,
}

/// Failure to produce a typed view of a frame payload.
#[derive(Debug)]
pub enum PayloadError {
    /// The payload was a string but its nested JSON did not parse.
    NestedDecode(serde_json::Error),
    /// The payload parsed as JSON but did not match the expected shape.
    Shape(serde_json::Error),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::NestedDecode(source) => {
                write!(f, "payload string is not valid JSON: {}", source)
            }
            PayloadError::Shape(source) => {
                write!(f, "payload does not match frame kind: {}", source)
            }
        }
    }
}

impl StdError for PayloadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PayloadError::NestedDecode(source) | PayloadError::Shape(source) => Some(source),
        }
    }
}

impl InboundFrame {
    /// The payload as a JSON value, decoding one nested string level if
    /// the server serialized it as text.
    pub fn payload_value(&self) -> Result<Value, PayloadError> {
        match &self.data {
            Value::String(text) => {
                serde_json::from_str(text).map_err(PayloadError::NestedDecode)
            }
            other => Ok(other.clone()),
        }
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let value = self.payload_value()?;
        serde_json::from_value(value).map_err(PayloadError::Shape)
    }

    pub fn presence_snapshot(&self) -> Result<PresenceSnapshotPayload, PayloadError> {
        self.payload()
    }

    pub fn presence_user(&self) -> Result<OnlineUser, PayloadError> {
        self.payload()
    }

    pub fn message(&self) -> Result<MessagePayload, PayloadError> {
        self.payload()
    }

    pub fn room_created(&self) -> Result<RoomCreatedPayload, PayloadError> {
        self.payload()
    }

    pub fn room_joined(&self) -> Result<RoomJoinedPayload, PayloadError> {
        self.payload()
    }

    pub fn reaction(&self) -> Result<ReactionPayload, PayloadError> {
        self.payload()
    }
}
