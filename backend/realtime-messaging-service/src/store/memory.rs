use super::{ChatStore, StoreError, StoreResult, UserProfile};
use crate::models::{
    Conversation, ConversationKind, Message, MessageStatus, NewMessage, Participant,
    ParticipantRole, PresenceStatus, WriteBehindEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserProfile>,
    presence: HashMap<Uuid, (PresenceStatus, DateTime<Utc>)>,
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Message>,
    // conversation_id -> message ids in sequence order
    timeline: HashMap<Uuid, Vec<Uuid>>,
    // (sender_id, client_id) -> message id
    client_ids: HashMap<(Uuid, String), Uuid>,
    counters: HashMap<Uuid, i64>,
}

impl Inner {
    fn append(&mut self, message: Message) {
        let ids = self.timeline.entry(message.conversation_id).or_default();
        let pos = ids
            .iter()
            .position(|id| {
                self.messages
                    .get(id)
                    .map(|m| m.sequence_number > message.sequence_number)
                    .unwrap_or(false)
            })
            .unwrap_or(ids.len());
        ids.insert(pos, message.id);
        if let Some(client_id) = &message.client_id {
            self.client_ids
                .insert((message.sender_id, client_id.clone()), message.id);
        }
        self.messages.insert(message.id, message);
    }

    fn message_mut(&mut self, message_id: Uuid) -> StoreResult<&mut Message> {
        self.messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound)
    }
}

/// In-process [`ChatStore`]. Used when no `DATABASE_URL` is configured and by tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    last_read_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes only `update_last_read` fail until reset.
    pub fn set_last_read_failing(&self, failing: bool) {
        self.last_read_failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    pub async fn add_user(&self, display_name: &str) -> UserProfile {
        let profile = UserProfile {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            verified: true,
        };
        self.inner
            .write()
            .await
            .users
            .insert(profile.id, profile.clone());
        profile
    }

    pub async fn create_group(
        &self,
        name: &str,
        owner: Uuid,
        members: &[Uuid],
    ) -> Conversation {
        let now = Utc::now();
        let mut participants = vec![Participant::new(owner, ParticipantRole::Owner)];
        participants.extend(
            members
                .iter()
                .filter(|id| **id != owner)
                .map(|id| Participant::new(*id, ParticipantRole::Member)),
        );
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            name: Some(name.to_string()),
            participants,
            last_message_id: None,
            last_activity: now,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .write()
            .await
            .conversations
            .insert(conversation.id, conversation.clone());
        conversation
    }

    /// Marks a participant as having left the conversation.
    pub async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(conv) = inner.conversations.get_mut(&conversation_id) {
            for p in conv.participants.iter_mut().filter(|p| p.user_id == user_id) {
                p.is_active = false;
                p.left_at = Some(Utc::now());
            }
        }
    }

    pub async fn presence_of(&self, user_id: Uuid) -> Option<(PresenceStatus, DateTime<Utc>)> {
        self.inner.read().await.presence.get(&user_id).copied()
    }

    pub async fn message_count(&self, conversation_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .timeline
            .get(&conversation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Messages of a conversation in sequence order.
    pub async fn timeline(&self, conversation_id: Uuid) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .timeline
            .get(&conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self
            .inner
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned())
    }

    async fn list_user_conversations(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let mut conversations: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.can_send(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        conversations.truncate(limit);
        Ok(conversations)
    }

    async fn find_or_create_direct(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> StoreResult<Conversation> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        let existing = inner.conversations.values().find(|c| {
            c.kind == ConversationKind::Direct
                && !c.is_deleted()
                && c.participant(user_a).is_some()
                && c.participant(user_b).is_some()
        });
        if let Some(conv) = existing {
            return Ok(conv.clone());
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            name: None,
            participants: vec![
                Participant::new(user_a, ParticipantRole::Member),
                Participant::new(user_b, ParticipantRole::Member),
            ],
            last_message_id: None,
            last_activity: now,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        last_message_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        conv.last_message_id = Some(last_message_id);
        conv.last_activity = at;
        conv.updated_at = at;
        Ok(())
    }

    async fn update_last_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_writable()?;
        if self.last_read_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("last_read_at update failed".into()));
        }
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        if let Some(p) = conv.participants.iter_mut().find(|p| p.user_id == user_id) {
            if p.last_read_at.map(|prev| prev < at).unwrap_or(true) {
                p.last_read_at = Some(at);
            }
        }
        Ok(())
    }

    async fn find_by_client_id(
        &self,
        sender_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .client_ids
            .get(&(sender_id, client_id.to_string()))
            .and_then(|id| inner.messages.get(id))
            .cloned())
    }

    async fn insert_message(&self, new: NewMessage) -> StoreResult<Message> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        if let Some(client_id) = &new.client_id {
            if inner
                .client_ids
                .contains_key(&(new.sender_id, client_id.clone()))
            {
                return Err(StoreError::Duplicate);
            }
        }

        let seq = inner.counters.entry(new.conversation_id).or_insert(0);
        *seq += 1;
        let sequence_number = *seq;

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            sequence_number,
            kind: new.kind,
            content: new.content,
            attachments: new.attachments,
            reply_to: new.reply_to,
            status: MessageStatus::Sent,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
            reactions: Vec::new(),
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_for: Vec::new(),
            client_id: new.client_id,
            created_at: now,
            updated_at: now,
        };
        inner.append(message.clone());
        Ok(message)
    }

    async fn bulk_insert(&self, entries: &[WriteBehindEntry]) -> StoreResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let mut written = 0;

        for entry in entries {
            if inner.messages.contains_key(&entry.message_id) {
                continue;
            }
            if let Some(client_id) = &entry.client_id {
                if inner
                    .client_ids
                    .contains_key(&(entry.sender_id, client_id.clone()))
                {
                    continue;
                }
            }
            let counter = inner.counters.entry(entry.conversation_id).or_insert(0);
            *counter = (*counter).max(entry.sequence_number);
            inner.append(entry.clone().into_message());
            written += 1;
        }
        Ok(written)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(&message_id).cloned())
    }

    async fn history(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.timeline.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| before.map(|b| m.sequence_number < b).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_delivered(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        Ok(inner.message_mut(message_id)?.mark_delivered(user_id, at))
    }

    async fn mark_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        Ok(inner.message_mut(message_id)?.mark_read(user_id, at))
    }

    async fn unread_for(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.timeline.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| {
                m.sender_id != user_id
                    && !m.deleted
                    && m.is_visible_to(user_id)
                    && !m.is_read_by(user_id)
            })
            .cloned()
            .collect())
    }

    async fn set_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let message = inner.message_mut(message_id)?;
        message.set_reaction(user_id, emoji, at);
        Ok(message.clone())
    }

    async fn edit_message(
        &self,
        message_id: Uuid,
        content: String,
        at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let message = inner.message_mut(message_id)?;
        message.content = Some(content);
        message.edited = true;
        message.edited_at = Some(at);
        message.updated_at = at;
        Ok(message.clone())
    }

    async fn delete_for_everyone(
        &self,
        message_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let message = inner.message_mut(message_id)?;
        message.deleted = true;
        message.content = None;
        message.attachments.clear();
        message.updated_at = at;
        Ok(message.clone())
    }

    async fn delete_for_user(&self, message_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let message = inner.message_mut(message_id)?;
        if !message.deleted_for.contains(&user_id) {
            message.deleted_for.push(user_id);
        }
        Ok(())
    }

    async fn update_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_writable()?;
        self.inner
            .write()
            .await
            .presence
            .insert(user_id, (status, last_seen));
        Ok(())
    }
}
