use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Message, MessageId, UserId};

/// Events the client emits over the push channel.
///
/// Encoded as `{"event": <name>, "data": <payload>}` text frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "sendMessage")]
    SendMessage(OutgoingMessage),

    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
    },

    #[serde(rename = "stopTyping")]
    StopTyping {
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
    },
}

/// Payload of `sendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender: UserId,
    pub receiver_id: UserId,
    pub message: String,
    /// Idempotency key; servers that echo it enable exact reconciliation.
    pub client_ref: Uuid,
}

/// Events the server pushes to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(WireMessage),

    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "senderId")]
        sender_id: UserId,
    },

    #[serde(rename = "stopTyping")]
    StopTyping {
        #[serde(rename = "senderId")]
        sender_id: UserId,
    },

    #[serde(rename = "onlineUsers")]
    OnlineUsers(Vec<UserId>),
}

/// A message as the backend serializes it, both in history responses and
/// on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(alias = "senderId")]
    pub sender: UserId,
    #[serde(alias = "receiverId")]
    pub receiver: UserId,
    #[serde(alias = "body")]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Message {
            id: wire.id,
            sender_id: wire.sender,
            receiver_id: wire.receiver,
            body: wire.message,
            created_at: wire.created_at,
            pending: false,
            client_ref: wire.client_ref,
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        WireMessage {
            id: msg.id.clone(),
            sender: msg.sender_id.clone(),
            receiver: msg.receiver_id.clone(),
            message: msg.body.clone(),
            created_at: msg.created_at,
            client_ref: msg.client_ref,
        }
    }
}

impl ClientEvent {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Peer the event is addressed to
    pub fn receiver(&self) -> &UserId {
        match self {
            ClientEvent::SendMessage(msg) => &msg.receiver_id,
            ClientEvent::Typing { receiver_id } | ClientEvent::StopTyping { receiver_id } => {
                receiver_id
            }
        }
    }
}

impl ServerEvent {
    /// Deserialize from a JSON text frame
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
