//! Message ingestion pipeline.
//!
//! The synchronous send path: validate, authorize, replay check, persist,
//! update the conversation, mark online participants delivered, clear the
//! sender's typing state, acknowledge and broadcast. Steps from persist to
//! broadcast hold a per-conversation lock, so every observer sees messages
//! in sequence order.

use crate::error::ChatError;
use crate::metrics::{self, DUPLICATE_SENDS_TOTAL, MESSAGES_ACCEPTED_TOTAL};
use crate::models::{Conversation, Message, NewMessage, WriteBehindEntry};
use crate::services::presence::PresenceRegistry;
use crate::services::rate_limiter::RateLimiter;
use crate::services::typing::TypingTracker;
use crate::services::write_behind::WriteBehindLog;
use crate::store::{ChatStore, StoreError};
use crate::websocket::events::{SendMessagePayload, ServerEvent};
use crate::websocket::{ConnectionId, FanoutTarget, Router};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const MAX_CONTENT_LEN: usize = 10_000;
pub const MAX_ATTACHMENTS: usize = 10;
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Outcome of an accepted send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// True when the send was a retry resolved to an existing message.
    pub replayed: bool,
}

enum Accepted {
    New(Message),
    Replayed(SendOutcome),
}

pub struct MessageService {
    store: Arc<dyn ChatStore>,
    router: Router,
    presence: Arc<PresenceRegistry>,
    typing: TypingTracker,
    limiter: Arc<RateLimiter>,
    log: Arc<dyn WriteBehindLog>,
    conversation_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        router: Router,
        presence: Arc<PresenceRegistry>,
        typing: TypingTracker,
        limiter: Arc<RateLimiter>,
        log: Arc<dyn WriteBehindLog>,
    ) -> Self {
        Self {
            store,
            router,
            presence,
            typing,
            limiter,
            log,
            conversation_locks: DashMap::new(),
        }
    }

    /// Runs the full send path for `sender` on `connection_id`.
    ///
    /// On success the sending connection has already received
    /// `message:sent`. On failure nothing was persisted or broadcast; the
    /// caller reports the error to the sender.
    pub async fn send(
        &self,
        sender_id: Uuid,
        connection_id: ConnectionId,
        payload: SendMessagePayload,
    ) -> Result<SendOutcome, ChatError> {
        let result = self.send_inner(sender_id, connection_id, payload).await;
        match &result {
            Ok(outcome) if outcome.replayed => DUPLICATE_SENDS_TOTAL.inc(),
            Ok(_) => MESSAGES_ACCEPTED_TOTAL.inc(),
            Err(e) => metrics::record_rejection(e.reason()),
        }
        result
    }

    async fn send_inner(
        &self,
        sender_id: Uuid,
        connection_id: ConnectionId,
        payload: SendMessagePayload,
    ) -> Result<SendOutcome, ChatError> {
        self.limiter.check(sender_id)?;

        let new = validate(sender_id, payload)?;
        let conversation = self.authorize(new.conversation_id, sender_id).await?;
        if let Some(reply_to) = new.reply_to {
            self.check_reply_target(reply_to, conversation.id).await?;
        }

        if let Some(client_id) = &new.client_id {
            if let Some(existing) = self.store.find_by_client_id(sender_id, client_id).await? {
                return Ok(self.replay(connection_id, existing).await);
            }
        }

        let lock = self.conversation_lock(conversation.id);
        let accepted = {
            let _guard = lock.lock().await;
            self.accept_locked(sender_id, connection_id, new, &conversation)
                .await
        };
        drop(lock);
        self.release_lock(conversation.id);

        let message = match accepted? {
            Accepted::New(message) => message,
            Accepted::Replayed(outcome) => return Ok(outcome),
        };

        if let Err(e) = self
            .log
            .append(&WriteBehindEntry::from_message(&message))
            .await
        {
            tracing::warn!(error = %e, message_id = %message.id, "write-behind append failed");
        }

        tracing::debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            sequence = message.sequence_number,
            "message accepted"
        );
        Ok(SendOutcome {
            message,
            replayed: false,
        })
    }

    /// Persist through broadcast. Runs with the conversation lock held.
    async fn accept_locked(
        &self,
        sender_id: Uuid,
        connection_id: ConnectionId,
        new: NewMessage,
        conversation: &Conversation,
    ) -> Result<Accepted, ChatError> {
        let client_id = new.client_id.clone();
        let mut message = match self.store.insert_message(new).await {
            Ok(m) => m,
            Err(StoreError::Duplicate) => {
                // lost a race against a concurrent retry with the same client id
                let existing = match &client_id {
                    Some(cid) => self.store.find_by_client_id(sender_id, cid).await?,
                    None => None,
                };
                return match existing {
                    Some(existing) => Ok(Accepted::Replayed(
                        self.replay(connection_id, existing).await,
                    )),
                    None => Err(ChatError::PersistenceFailed(
                        "duplicate reported but no message found".into(),
                    )),
                };
            }
            Err(e) => {
                tracing::error!(error = %e, conversation_id = %conversation.id, "message insert failed");
                return Err(ChatError::PersistenceFailed(e.to_string()));
            }
        };

        let now = Utc::now();
        if let Err(e) = self
            .store
            .touch_conversation(conversation.id, message.id, now)
            .await
        {
            tracing::warn!(error = %e, conversation_id = %conversation.id, "conversation summary update failed");
        }

        let recipients: Vec<Uuid> = conversation
            .active_participant_ids()
            .into_iter()
            .filter(|id| *id != sender_id)
            .collect();

        for user_id in recipients.iter().copied() {
            if !self.presence.is_online(user_id) {
                continue;
            }
            match self.store.mark_delivered(message.id, user_id, now).await {
                Ok(_) => {
                    message.mark_delivered(user_id, now);
                }
                Err(e) => {
                    tracing::warn!(error = %e, message_id = %message.id, %user_id, "immediate delivery mark failed")
                }
            }
        }

        self.typing.stop(conversation.id, sender_id).await;

        self.router
            .reply(
                connection_id,
                &ServerEvent::MessageSent {
                    message: message.clone(),
                    client_id: message.client_id.clone(),
                },
            )
            .await;
        self.router
            .broadcast(
                FanoutTarget::room(conversation.id)
                    .with_users(recipients)
                    .excluding(sender_id),
                &ServerEvent::MessageReceived {
                    message: message.clone(),
                },
            )
            .await;
        Ok(Accepted::New(message))
    }

    async fn replay(&self, connection_id: ConnectionId, existing: Message) -> SendOutcome {
        tracing::debug!(message_id = %existing.id, "resolved retried send to existing message");
        self.router
            .reply(
                connection_id,
                &ServerEvent::MessageSent {
                    message: existing.clone(),
                    client_id: existing.client_id.clone(),
                },
            )
            .await;
        SendOutcome {
            message: existing,
            replayed: true,
        }
    }

    async fn authorize(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .filter(|c| !c.is_deleted())
            .ok_or(ChatError::NotFound)?;
        if !conversation.can_send(user_id) {
            return Err(ChatError::Forbidden);
        }
        Ok(conversation)
    }

    async fn check_reply_target(&self, reply_to: Uuid, conversation_id: Uuid) -> Result<(), ChatError> {
        match self.store.get_message(reply_to).await? {
            Some(target) if target.conversation_id == conversation_id => Ok(()),
            _ => Err(ChatError::InvalidPayload(
                "reply_to must reference a message in the same conversation".into(),
            )),
        }
    }

    fn conversation_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.conversation_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the conversation's lock once no other send holds or awaits it.
    fn release_lock(&self, conversation_id: Uuid) {
        self.conversation_locks
            .remove_if(&conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Sets or clears the caller's reaction and notifies the conversation.
    pub async fn react(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        emoji: Option<String>,
    ) -> Result<Message, ChatError> {
        let emoji = emoji.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        if emoji.as_ref().map(|e| e.chars().count() > 16).unwrap_or(false) {
            return Err(ChatError::InvalidPayload("emoji too long".into()));
        }

        let message = self.visible_message(message_id, user_id).await?;
        let conversation = self.authorize(message.conversation_id, user_id).await?;
        let updated = self
            .store
            .set_reaction(message_id, user_id, emoji.clone(), Utc::now())
            .await?;

        self.router
            .broadcast(
                FanoutTarget::room(conversation.id).with_users(conversation.active_participant_ids()),
                &ServerEvent::MessageReaction {
                    message_id,
                    conversation_id: conversation.id,
                    user_id,
                    emoji,
                },
            )
            .await;
        Ok(updated)
    }

    /// Sender-only edit of a live message.
    pub async fn edit(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        content: String,
    ) -> Result<Message, ChatError> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(ChatError::InvalidPayload("content must not be empty".into()));
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ChatError::InvalidPayload("content too long".into()));
        }

        let message = self.visible_message(message_id, user_id).await?;
        if message.sender_id != user_id {
            return Err(ChatError::Forbidden);
        }
        let conversation = self.authorize(message.conversation_id, user_id).await?;

        let updated = self
            .store
            .edit_message(message_id, content, Utc::now())
            .await?;
        self.router
            .broadcast(
                FanoutTarget::room(conversation.id).with_users(conversation.active_participant_ids()),
                &ServerEvent::MessageEdited {
                    message: updated.clone(),
                },
            )
            .await;
        Ok(updated)
    }

    /// `for_everyone` is sender-only and broadcast; otherwise the message is
    /// hidden for the caller alone and nobody is notified.
    pub async fn delete(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        for_everyone: bool,
    ) -> Result<(), ChatError> {
        let message = self.visible_message(message_id, user_id).await?;
        let conversation = self
            .store
            .get_conversation(message.conversation_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        if conversation.participant(user_id).is_none() {
            return Err(ChatError::Forbidden);
        }

        if !for_everyone {
            self.store.delete_for_user(message_id, user_id).await?;
            return Ok(());
        }

        if message.sender_id != user_id {
            return Err(ChatError::Forbidden);
        }
        self.store.delete_for_everyone(message_id, Utc::now()).await?;
        self.router
            .broadcast(
                FanoutTarget::room(conversation.id).with_users(conversation.active_participant_ids()),
                &ServerEvent::MessageDeleted {
                    message_id,
                    conversation_id: conversation.id,
                },
            )
            .await;
        Ok(())
    }

    async fn visible_message(&self, message_id: Uuid, user_id: Uuid) -> Result<Message, ChatError> {
        self.store
            .get_message(message_id)
            .await?
            .filter(|m| !m.deleted && m.is_visible_to(user_id))
            .ok_or(ChatError::NotFound)
    }
}

/// Shape validation. Produces the insert request on success.
pub fn validate(sender_id: Uuid, payload: SendMessagePayload) -> Result<NewMessage, ChatError> {
    let conversation_id = Uuid::parse_str(payload.conversation_id.trim())
        .map_err(|_| ChatError::InvalidPayload("conversation_id is not a valid id".into()))?;

    let content = payload
        .content
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if content.is_none() && payload.attachments.is_empty() {
        return Err(ChatError::InvalidPayload(
            "message needs content or at least one attachment".into(),
        ));
    }
    if content
        .as_ref()
        .map(|c| c.chars().count() > MAX_CONTENT_LEN)
        .unwrap_or(false)
    {
        return Err(ChatError::InvalidPayload("content too long".into()));
    }
    if payload.attachments.len() > MAX_ATTACHMENTS {
        return Err(ChatError::InvalidPayload("too many attachments".into()));
    }
    if payload.attachments.iter().any(|a| a.url.trim().is_empty()) {
        return Err(ChatError::InvalidPayload("attachment url is required".into()));
    }

    let client_id = payload
        .client_id
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if client_id
        .as_ref()
        .map(|c| c.len() > MAX_CLIENT_ID_LEN)
        .unwrap_or(false)
    {
        return Err(ChatError::InvalidPayload("client_id too long".into()));
    }

    Ok(NewMessage {
        conversation_id,
        sender_id,
        kind: payload.kind,
        content,
        attachments: payload.attachments,
        reply_to: payload.reply_to,
        client_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attachment, MessageKind};

    fn payload(conversation_id: &str, content: Option<&str>) -> SendMessagePayload {
        SendMessagePayload {
            conversation_id: conversation_id.to_string(),
            content: content.map(str::to_string),
            attachments: Vec::new(),
            kind: MessageKind::Text,
            reply_to: None,
            client_id: Some("c1".into()),
        }
    }

    #[test]
    fn test_validate_rejects_malformed_conversation_id() {
        let err = validate(Uuid::new_v4(), payload("not-a-uuid", Some("hi"))).unwrap_err();
        assert_eq!(err.reason(), "InvalidPayload");
    }

    #[test]
    fn test_validate_requires_content_or_attachment() {
        let conv = Uuid::new_v4().to_string();
        assert!(validate(Uuid::new_v4(), payload(&conv, None)).is_err());
        assert!(validate(Uuid::new_v4(), payload(&conv, Some("   "))).is_err());

        let mut with_attachment = payload(&conv, None);
        with_attachment.kind = MessageKind::Image;
        with_attachment.attachments.push(Attachment {
            kind: MessageKind::Image,
            url: "https://cdn.example.com/a.png".into(),
            size: 1024,
            mime_type: "image/png".into(),
            dimensions: None,
            duration: None,
        });
        let new = validate(Uuid::new_v4(), with_attachment).unwrap();
        assert!(new.content.is_none());
        assert_eq!(new.attachments.len(), 1);
    }

    #[test]
    fn test_validate_trims_client_id() {
        let conv = Uuid::new_v4().to_string();
        let mut p = payload(&conv, Some("hi"));
        p.client_id = Some("  ".into());
        assert!(validate(Uuid::new_v4(), p).unwrap().client_id.is_none());
    }

    #[tokio::test]
    async fn test_conversation_locks_are_released_after_send() {
        use crate::config::{RateLimitConfig, TypingConfig};
        use crate::services::write_behind::MemoryLog;
        use crate::store::MemoryStore;
        use crate::websocket::ConnectionRegistry;

        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new();
        let router = Router::new(registry.clone(), store.clone(), None, "test");
        let service = MessageService::new(
            store.clone(),
            router.clone(),
            Arc::new(PresenceRegistry::new(store.clone(), router.clone(), 100)),
            TypingTracker::new(router, TypingConfig::default()),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            Arc::new(MemoryLog::new()),
        );

        let owner = store.add_user("ann").await.id;
        let (connection_id, _rx) = registry.register(owner).await;
        for name in ["one", "two", "three"] {
            let conversation = store.create_group(name, owner, &[]).await;
            let mut p = payload(&conversation.id.to_string(), Some("hi"));
            p.client_id = Some(name.to_string());
            let outcome = service.send(owner, connection_id, p).await.unwrap();
            assert!(!outcome.replayed);
        }
        assert!(service.conversation_locks.is_empty());

        // a failed insert releases the lock too
        let conversation = store.create_group("four", owner, &[]).await;
        store.set_unavailable(true);
        let mut failing = payload(&conversation.id.to_string(), Some("hi"));
        failing.client_id = None;
        assert!(service.send(owner, connection_id, failing).await.is_err());
        assert!(service.conversation_locks.is_empty());
    }
}
