use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    Location,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::Location => "location",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "audio" => Some(MessageKind::Audio),
            "video" => Some(MessageKind::Video),
            "location" => Some(MessageKind::Location),
            _ => None,
        }
    }
}

/// Coarse status. Per-recipient state lives in `delivered_to` / `read_by`.
/// Variants are ordered so that status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Failed,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Failed => "failed",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "failed" => Some(MessageStatus::Failed),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub url: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    /// Duration in seconds for audio/video attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub user_id: Uuid,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
    pub at: DateTime<Utc>,
}

/// Persisted message document.
///
/// Immutable after insert except for status, receipts, reactions and the
/// edit/delete markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Server-assigned acceptance order within the conversation.
    pub sequence_number: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<Uuid>,
    pub status: MessageStatus,
    #[serde(default)]
    pub read_by: Vec<Receipt>,
    #[serde(default)]
    pub delivered_to: Vec<Receipt>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    #[serde(default)]
    pub deleted_for: Vec<Uuid>,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_delivered_to(&self, user_id: Uuid) -> bool {
        self.delivered_to.iter().any(|r| r.user_id == user_id)
    }

    pub fn is_read_by(&self, user_id: Uuid) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }

    /// Returns false when the user was already recorded.
    pub fn mark_delivered(&mut self, user_id: Uuid, at: DateTime<Utc>) -> bool {
        if self.is_delivered_to(user_id) {
            return false;
        }
        self.delivered_to.push(Receipt { user_id, at });
        self.advance_status(MessageStatus::Delivered);
        true
    }

    /// Returns false when the user was already recorded.
    pub fn mark_read(&mut self, user_id: Uuid, at: DateTime<Utc>) -> bool {
        if self.is_read_by(user_id) {
            return false;
        }
        self.read_by.push(Receipt { user_id, at });
        self.advance_status(MessageStatus::Read);
        true
    }

    /// One reaction per user, last write wins. `None` clears it.
    pub fn set_reaction(&mut self, user_id: Uuid, emoji: Option<String>, at: DateTime<Utc>) {
        self.reactions.retain(|r| r.user_id != user_id);
        if let Some(emoji) = emoji {
            self.reactions.push(Reaction { user_id, emoji, at });
        }
        self.updated_at = at;
    }

    pub fn is_visible_to(&self, user_id: Uuid) -> bool {
        !self.deleted_for.contains(&user_id)
    }

    fn advance_status(&mut self, status: MessageStatus) {
        if status > self.status {
            self.status = status;
        }
    }
}

/// Validated input for a single insert. The store assigns id, sequence and timestamps.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<Uuid>,
    pub client_id: Option<String>,
}

/// Entry appended to the write-behind log after a message was accepted.
///
/// Carries the persisted id and sequence number so a replayed batch is an
/// idempotent insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBehindEntry {
    pub message_id: Uuid,
    pub sequence_number: i64,
    pub client_id: Option<String>,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl WriteBehindEntry {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            sequence_number: message.sequence_number,
            client_id: message.client_id.clone(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            kind: message.kind,
            attachments: message.attachments.clone(),
            reply_to: message.reply_to,
            timestamp: message.created_at,
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            sequence_number: self.sequence_number,
            kind: self.kind,
            content: self.content,
            attachments: self.attachments,
            reply_to: self.reply_to,
            status: MessageStatus::Sent,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
            reactions: Vec::new(),
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_for: Vec::new(),
            client_id: self.client_id,
            created_at: self.timestamp,
            updated_at: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sequence_number: 1,
            kind: MessageKind::Text,
            content: Some("hi".to_string()),
            attachments: Vec::new(),
            reply_to: None,
            status: MessageStatus::Sent,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
            reactions: Vec::new(),
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_for: Vec::new(),
            client_id: Some("c1".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mut msg = message();
        let reader = Uuid::new_v4();

        assert!(msg.mark_read(reader, Utc::now()));
        assert!(!msg.mark_read(reader, Utc::now()));
        assert_eq!(msg.read_by.len(), 1);
        assert_eq!(msg.status, MessageStatus::Read);
    }

    #[test]
    fn test_delivery_never_downgrades_read_status() {
        let mut msg = message();
        msg.mark_read(Uuid::new_v4(), Utc::now());
        msg.mark_delivered(Uuid::new_v4(), Utc::now());

        assert_eq!(msg.status, MessageStatus::Read);
        assert_eq!(msg.delivered_to.len(), 1);
    }

    #[test]
    fn test_reaction_last_write_wins() {
        let mut msg = message();
        let user = Uuid::new_v4();

        msg.set_reaction(user, Some("👍".to_string()), Utc::now());
        msg.set_reaction(user, Some("🎉".to_string()), Utc::now());
        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.reactions[0].emoji, "🎉");

        msg.set_reaction(user, None, Utc::now());
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn test_wire_names_use_type_field() {
        let json = serde_json::to_value(message()).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["status"], "sent");
    }
}
