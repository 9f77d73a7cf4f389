use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Transient, never persisted as a whole. Only `status`/`last_seen` are written
/// back to the store, asynchronously.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}
