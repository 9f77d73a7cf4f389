//! Wire events.
//!
//! Every frame is `{"event": "<object>:<action>", "data": {...}}`. Inbound and
//! outbound surfaces are closed enums so dispatch is an exhaustive `match`.

use crate::models::{Attachment, Conversation, Message, MessageKind, PresenceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `message:send`.
///
/// `conversation_id` stays a string so a malformed id is rejected by shape
/// validation with the `client_id` still attached to the error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub conversation_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "conversation:join")]
    JoinConversation { conversation_id: Uuid },

    #[serde(rename = "conversation:leave")]
    LeaveConversation { conversation_id: Uuid },

    #[serde(rename = "conversation:open_direct")]
    OpenDirect { user_id: Uuid },

    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid },

    #[serde(rename = "message:send")]
    SendMessage(SendMessagePayload),

    #[serde(rename = "message:delivered")]
    MessageDelivered { message_id: Uuid },

    #[serde(rename = "message:read")]
    MessageRead { message_id: Uuid },

    #[serde(rename = "conversation:read")]
    ConversationRead { conversation_id: Uuid },

    #[serde(rename = "message:react")]
    React {
        message_id: Uuid,
        #[serde(default)]
        emoji: Option<String>,
    },

    #[serde(rename = "message:edit")]
    Edit { message_id: Uuid, content: String },

    #[serde(rename = "message:delete")]
    Delete {
        message_id: Uuid,
        #[serde(default)]
        for_everyone: bool,
    },

    #[serde(rename = "presence:set")]
    PresenceSet { status: PresenceStatus },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinConversation { .. } => "conversation:join",
            ClientEvent::LeaveConversation { .. } => "conversation:leave",
            ClientEvent::OpenDirect { .. } => "conversation:open_direct",
            ClientEvent::TypingStart { .. } => "typing:start",
            ClientEvent::TypingStop { .. } => "typing:stop",
            ClientEvent::SendMessage(_) => "message:send",
            ClientEvent::MessageDelivered { .. } => "message:delivered",
            ClientEvent::MessageRead { .. } => "message:read",
            ClientEvent::ConversationRead { .. } => "conversation:read",
            ClientEvent::React { .. } => "message:react",
            ClientEvent::Edit { .. } => "message:edit",
            ClientEvent::Delete { .. } => "message:delete",
            ClientEvent::PresenceSet { .. } => "presence:set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub node_id: String,
    pub version: String,
    pub max_sends_per_window: u32,
    pub rate_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection:established")]
    ConnectionEstablished {
        user_id: Uuid,
        server_info: ServerInfo,
    },

    #[serde(rename = "conversation:opened")]
    ConversationOpened { conversation: Conversation },

    /// Acknowledgment to the sending connection.
    #[serde(rename = "message:sent")]
    MessageSent {
        message: Message,
        client_id: Option<String>,
    },

    #[serde(rename = "message:received")]
    MessageReceived { message: Message },

    #[serde(rename = "message:error")]
    MessageError {
        reason: String,
        message: String,
        client_id: Option<String>,
    },

    #[serde(rename = "message:edited")]
    MessageEdited { message: Message },

    #[serde(rename = "message:deleted")]
    MessageDeleted {
        message_id: Uuid,
        conversation_id: Uuid,
    },

    #[serde(rename = "message:reaction")]
    MessageReaction {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
    },

    #[serde(rename = "typing:start")]
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
        display_name: String,
    },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid, user_id: Uuid },

    #[serde(rename = "message:delivery_receipt")]
    DeliveryReceipt {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        delivered_at: DateTime<Utc>,
    },

    #[serde(rename = "message:read_receipt")]
    ReadReceipt {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    },

    /// One batch per original sender after `conversation:read`.
    #[serde(rename = "conversation:read_receipt")]
    ConversationReadReceipt {
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },

    #[serde(rename = "presence:update")]
    PresenceUpdate {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },

    /// Failure of any non-send request, reported to the caller only.
    #[serde(rename = "request:error")]
    RequestError {
        request: String,
        reason: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionEstablished { .. } => "connection:established",
            ServerEvent::ConversationOpened { .. } => "conversation:opened",
            ServerEvent::MessageSent { .. } => "message:sent",
            ServerEvent::MessageReceived { .. } => "message:received",
            ServerEvent::MessageError { .. } => "message:error",
            ServerEvent::MessageEdited { .. } => "message:edited",
            ServerEvent::MessageDeleted { .. } => "message:deleted",
            ServerEvent::MessageReaction { .. } => "message:reaction",
            ServerEvent::TypingStart { .. } => "typing:start",
            ServerEvent::TypingStop { .. } => "typing:stop",
            ServerEvent::DeliveryReceipt { .. } => "message:delivery_receipt",
            ServerEvent::ReadReceipt { .. } => "message:read_receipt",
            ServerEvent::ConversationReadReceipt { .. } => "conversation:read_receipt",
            ServerEvent::PresenceUpdate { .. } => "presence:update",
            ServerEvent::RequestError { .. } => "request:error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn request_error(request: &str, err: &crate::error::ChatError) -> Self {
        ServerEvent::RequestError {
            request: request.to_string(),
            reason: err.reason().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_with_defaults() {
        let raw = json!({
            "event": "message:send",
            "data": {"conversation_id": "abc", "content": "hi", "client_id": "c1"}
        });
        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        match event {
            ClientEvent::SendMessage(payload) => {
                assert_eq!(payload.conversation_id, "abc");
                assert_eq!(payload.kind, MessageKind::Text);
                assert!(payload.attachments.is_empty());
                assert_eq!(payload.client_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let raw = json!({"event": "admin:shutdown", "data": {}});
        assert!(serde_json::from_value::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn test_server_event_shape() {
        let user_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let value = serde_json::to_value(ServerEvent::TypingStop {
            conversation_id,
            user_id,
        })
        .unwrap();
        assert_eq!(value["event"], "typing:stop");
        assert_eq!(value["data"]["user_id"], user_id.to_string());
    }

    #[test]
    fn test_presence_set_parses_status() {
        let raw = json!({"event": "presence:set", "data": {"status": "busy"}});
        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            event,
            ClientEvent::PresenceSet {
                status: PresenceStatus::Busy
            }
        ));
    }
}
