use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Admin,
    Owner,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Member => "member",
            ParticipantRole::Admin => "admin",
            ParticipantRole::Owner => "owner",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "member" => Some(ParticipantRole::Member),
            "admin" => Some(ParticipantRole::Admin),
            "owner" => Some(ParticipantRole::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub is_muted: bool,
}

impl Participant {
    pub fn new(user_id: Uuid, role: ParticipantRole) -> Self {
        Self {
            user_id,
            role,
            joined_at: Utc::now(),
            left_at: None,
            is_active: true,
            last_read_at: None,
            is_archived: false,
            is_muted: false,
        }
    }

    /// Active participants are the only ones allowed to subscribe, type or send.
    pub fn can_send(&self) -> bool {
        self.is_active && self.left_at.is_none()
    }
}

/// Conversation document. Participants keep their insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message_id: Option<Uuid>,
    pub last_activity: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// True when `user_id` is an active participant of a live conversation.
    pub fn can_send(&self, user_id: Uuid) -> bool {
        self.deleted_at.is_none()
            && self
                .participant(user_id)
                .map(Participant::can_send)
                .unwrap_or(false)
    }

    pub fn active_participant_ids(&self) -> Vec<Uuid> {
        self.participants
            .iter()
            .filter(|p| p.can_send())
            .map(|p| p.user_id)
            .collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
