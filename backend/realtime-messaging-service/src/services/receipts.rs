use crate::error::ChatError;
use crate::models::Message;
use crate::store::ChatStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::{FanoutTarget, Router};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Delivery and read receipts.
///
/// All operations are idempotent: a repeated receipt records nothing and
/// notifies nobody. Notifications go to the original sender's personal
/// channel so every device of theirs sees them.
#[derive(Clone)]
pub struct ReceiptTracker {
    store: Arc<dyn ChatStore>,
    router: Router,
}

impl ReceiptTracker {
    pub fn new(store: Arc<dyn ChatStore>, router: Router) -> Self {
        Self { store, router }
    }

    async fn authorized_message(&self, message_id: Uuid, user_id: Uuid) -> Result<Message, ChatError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        let conversation = self
            .store
            .get_conversation(message.conversation_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        if !conversation.can_send(user_id) {
            return Err(ChatError::Forbidden);
        }
        Ok(message)
    }

    /// The receipt itself is already recorded, so a failure here is only logged.
    async fn advance_last_read(&self, conversation_id: Uuid, user_id: Uuid, read_at: DateTime<Utc>) {
        if let Err(e) = self
            .store
            .update_last_read(conversation_id, user_id, read_at)
            .await
        {
            tracing::warn!(error = %e, %conversation_id, %user_id, "last_read_at update failed");
        }
    }

    /// Returns true when the receipt was newly recorded.
    pub async fn mark_delivered(&self, message_id: Uuid, user_id: Uuid) -> Result<bool, ChatError> {
        let message = self.authorized_message(message_id, user_id).await?;
        if message.sender_id == user_id {
            return Ok(false);
        }

        let delivered_at = Utc::now();
        if !self
            .store
            .mark_delivered(message_id, user_id, delivered_at)
            .await?
        {
            return Ok(false);
        }

        self.router
            .broadcast(
                FanoutTarget::user(message.sender_id),
                &ServerEvent::DeliveryReceipt {
                    message_id,
                    conversation_id: message.conversation_id,
                    user_id,
                    delivered_at,
                },
            )
            .await;
        Ok(true)
    }

    /// Returns true when the receipt was newly recorded. Also moves the
    /// reader's `last_read_at` forward, best effort.
    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<bool, ChatError> {
        let message = self.authorized_message(message_id, user_id).await?;
        if message.sender_id == user_id {
            return Ok(false);
        }

        let read_at = Utc::now();
        if !self.store.mark_read(message_id, user_id, read_at).await? {
            return Ok(false);
        }
        self.advance_last_read(message.conversation_id, user_id, read_at)
            .await;

        self.router
            .broadcast(
                FanoutTarget::user(message.sender_id),
                &ServerEvent::ReadReceipt {
                    message_id,
                    conversation_id: message.conversation_id,
                    user_id,
                    read_at,
                },
            )
            .await;
        Ok(true)
    }

    /// Marks every unread message of the conversation as read by `user_id`
    /// and sends one batch receipt per original sender. Returns the number
    /// of messages marked.
    ///
    /// If the store fails partway, receipts still go out for the messages
    /// already marked before the error is returned; a retry picks up the rest.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<usize, ChatError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        if !conversation.can_send(user_id) {
            return Err(ChatError::Forbidden);
        }

        let read_at = Utc::now();
        let unread = self.store.unread_for(conversation_id, user_id).await?;

        let mut by_sender: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        let mut failure = None;
        for message in &unread {
            match self.store.mark_read(message.id, user_id, read_at).await {
                Ok(true) => by_sender.entry(message.sender_id).or_default().push(message.id),
                Ok(false) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            self.advance_last_read(conversation_id, user_id, read_at)
                .await;
        }

        let marked = by_sender.values().map(Vec::len).sum();
        for (sender_id, message_ids) in by_sender {
            self.router
                .broadcast(
                    FanoutTarget::user(sender_id),
                    &ServerEvent::ConversationReadReceipt {
                        conversation_id,
                        user_id,
                        message_ids,
                        read_at,
                    },
                )
                .await;
        }
        if let Some(e) = failure {
            tracing::warn!(error = %e, %conversation_id, %user_id, marked, "conversation read stopped partway");
            return Err(e.into());
        }
        tracing::debug!(%conversation_id, %user_id, marked, "conversation marked read");
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, NewMessage};
    use crate::store::MemoryStore;
    use crate::websocket::ConnectionRegistry;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        store: Arc<MemoryStore>,
        tracker: ReceiptTracker,
        conversation_id: Uuid,
        sender: Uuid,
        reader: Uuid,
        sender_rx: UnboundedReceiver<String>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new();
        let router = Router::new(registry.clone(), store.clone(), None, "test");
        let sender = store.add_user("ann").await.id;
        let reader = store.add_user("ben").await.id;
        let conversation_id = store.find_or_create_direct(sender, reader).await.unwrap().id;
        let (_, sender_rx) = registry.register(sender).await;
        Fixture {
            tracker: ReceiptTracker::new(store.clone(), router),
            store,
            conversation_id,
            sender,
            reader,
            sender_rx,
        }
    }

    async fn post(f: &Fixture, content: &str) -> Uuid {
        f.store
            .insert_message(NewMessage {
                conversation_id: f.conversation_id,
                sender_id: f.sender,
                kind: MessageKind::Text,
                content: Some(content.to_string()),
                attachments: Vec::new(),
                reply_to: None,
                client_id: None,
            })
            .await
            .unwrap()
            .id
    }

    fn event_name(frame: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value["event"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_read_receipt_survives_last_read_failure() {
        let mut f = fixture().await;
        let message_id = post(&f, "hello").await;

        f.store.set_last_read_failing(true);
        assert!(f.tracker.mark_read(message_id, f.reader).await.unwrap());
        assert_eq!(event_name(&f.sender_rx.recv().await.unwrap()), "message:read_receipt");

        // already recorded: the retry is a no-op
        assert!(!f.tracker.mark_read(message_id, f.reader).await.unwrap());
        assert!(f.sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_conversation_read_receipt_survives_last_read_failure() {
        let mut f = fixture().await;
        post(&f, "one").await;
        post(&f, "two").await;

        f.store.set_last_read_failing(true);
        let marked = f
            .tracker
            .mark_conversation_read(f.conversation_id, f.reader)
            .await
            .unwrap();
        assert_eq!(marked, 2);

        let frame: serde_json::Value =
            serde_json::from_str(&f.sender_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "conversation:read_receipt");
        assert_eq!(frame["data"]["message_ids"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_former_participant_cannot_send_receipts() {
        let mut f = fixture().await;
        let message_id = post(&f, "before you left").await;
        f.store.remove_participant(f.conversation_id, f.reader).await;

        let err = f.tracker.mark_delivered(message_id, f.reader).await.unwrap_err();
        assert_eq!(err.reason(), "Forbidden");
        let err = f.tracker.mark_read(message_id, f.reader).await.unwrap_err();
        assert_eq!(err.reason(), "Forbidden");
        let err = f
            .tracker
            .mark_conversation_read(f.conversation_id, f.reader)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "Forbidden");
        assert!(f.sender_rx.try_recv().is_err());
    }
}
