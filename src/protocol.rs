//! Wire events exchanged over a connection.
//!
//! Every frame is `{"event": "<name>", "data": {...}}` with camelCase payload fields.
//! Anything that does not deserialize into [`ClientEvent`] is rejected here, before it
//! reaches the hub.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type ConnId = Uuid;
pub type SessionId = Uuid;
pub type Identity = String;
pub type ConversationId = String;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("binary frames are not supported")]
    Binary,
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Declined,
    Cancelled,
    Unanswered,
    PeerDisconnected,
}

/// A chat message as relayed to a conversation. Everything except the conversation id is
/// opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    IdentityAnnounce {
        identity: Identity,
    },
    StatusUpdate {
        is_online: bool,
    },
    NotifyRequest {
        target_identity: Identity,
        data: Map<String, Value>,
    },
    MessageSend(Message),
    CallRequest {
        conversation_id: ConversationId,
        receiver_id: Identity,
        call_type: CallType,
    },
    CallResponse {
        session_id: SessionId,
        accepted: bool,
        #[serde(default)]
        caller_id: Option<Identity>,
    },
    CallEnd {
        session_id: SessionId,
        #[serde(default)]
        receiver_id: Option<Identity>,
    },
    RoomJoin {
        conversation_id: ConversationId,
    },
    RoomLeave {
        conversation_id: ConversationId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    PresenceChanged {
        identity: Identity,
        is_online: bool,
    },
    OnlineUsers {
        identities: Vec<Identity>,
    },
    NotificationReceived(Notification),
    MessageReceived(Message),
    CallIncoming {
        session_id: SessionId,
        caller_id: Identity,
        conversation_id: ConversationId,
        call_type: CallType,
    },
    CallAccepted {
        session_id: SessionId,
        accepted: bool,
    },
    CallEnded {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<EndReason>,
    },
    Error {
        message: String,
    },
}

impl ClientEvent {
    /// Rejects ids that deserialize fine but can never name anything.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let (field, value) = match self {
            ClientEvent::IdentityAnnounce { identity } => ("identity", identity),
            ClientEvent::NotifyRequest { target_identity, .. } => ("targetIdentity", target_identity),
            ClientEvent::MessageSend(msg) => ("conversationId", &msg.conversation_id),
            ClientEvent::CallRequest { receiver_id, .. } if receiver_id.trim().is_empty() => ("receiverId", receiver_id),
            ClientEvent::CallRequest { conversation_id, .. }
            | ClientEvent::RoomJoin { conversation_id }
            | ClientEvent::RoomLeave { conversation_id } => ("conversationId", conversation_id),
            ClientEvent::StatusUpdate { .. } | ClientEvent::CallResponse { .. } | ClientEvent::CallEnd { .. } => {
                return Ok(());
            }
        };
        if value.trim().is_empty() {
            return Err(ProtocolError::Empty(field));
        }
        Ok(())
    }
}

pub fn parse_frame(text: &str) -> Result<ClientEvent, ProtocolError> {
    let event: ClientEvent = serde_json::from_str(text)?;
    event.validate()?;
    Ok(event)
}
