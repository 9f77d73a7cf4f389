use super::{ChatStore, StoreError, StoreResult, UserProfile};
use crate::models::{
    Attachment, Conversation, ConversationKind, Message, MessageKind, MessageStatus, NewMessage,
    Participant, ParticipantRole, PresenceStatus, Reaction, Receipt, WriteBehindEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::warn;
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = r#"
    m.id, m.conversation_id, m.sender_id, m.sequence_number, m.message_type,
    m.content, m.attachments, m.reply_to, m.status, m.edited, m.edited_at,
    m.deleted, m.deleted_for, m.client_id, m.created_at, m.updated_at,
    COALESCE((SELECT json_agg(json_build_object('user_id', r.user_id, 'at', r.at) ORDER BY r.at)
              FROM message_receipts r WHERE r.message_id = m.id AND r.kind = 'delivered'), '[]'::json),
    COALESCE((SELECT json_agg(json_build_object('user_id', r.user_id, 'at', r.at) ORDER BY r.at)
              FROM message_receipts r WHERE r.message_id = m.id AND r.kind = 'read'), '[]'::json),
    COALESCE((SELECT json_agg(json_build_object('user_id', x.user_id, 'emoji', x.emoji, 'at', x.at) ORDER BY x.at)
              FROM message_reactions x WHERE x.message_id = m.id), '[]'::json)
"#;

/// PostgreSQL [`ChatStore`] over a deadpool connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn load_message(
        &self,
        client: &deadpool_postgres::Client,
        message_id: Uuid,
    ) -> StoreResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = $1");
        let row = client.query_opt(sql.as_str(), &[&message_id]).await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    async fn load_conversation(
        &self,
        client: &deadpool_postgres::Client,
        conversation_id: Uuid,
    ) -> StoreResult<Option<Conversation>> {
        let Some(row) = client
            .query_opt(
                r#"
                SELECT id, kind, name, last_message_id, last_activity, deleted_at, created_at, updated_at
                FROM conversations
                WHERE id = $1
                "#,
                &[&conversation_id],
            )
            .await?
        else {
            return Ok(None);
        };

        let participants = client
            .query(
                r#"
                SELECT user_id, role, joined_at, left_at, is_active, last_read_at, is_archived, is_muted
                FROM conversation_participants
                WHERE conversation_id = $1
                ORDER BY joined_at, user_id
                "#,
                &[&conversation_id],
            )
            .await?
            .iter()
            .map(|p| Participant {
                user_id: p.get(0),
                role: ParticipantRole::parse(p.get::<_, &str>(1)).unwrap_or(ParticipantRole::Member),
                joined_at: p.get(2),
                left_at: p.get(3),
                is_active: p.get(4),
                last_read_at: p.get(5),
                is_archived: p.get(6),
                is_muted: p.get(7),
            })
            .collect();

        let kind: &str = row.get(1);
        Ok(Some(Conversation {
            id: row.get(0),
            kind: ConversationKind::parse(kind).unwrap_or(ConversationKind::Group),
            name: row.get(2),
            participants,
            last_message_id: row.get(3),
            last_activity: row.get(4),
            deleted_at: row.get(5),
            created_at: row.get(6),
            updated_at: row.get(7),
        }))
    }

    async fn add_receipt(
        &self,
        kind: &str,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let exists = client
            .query_opt("SELECT 1 FROM messages WHERE id = $1", &[&message_id])
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let inserted = client
            .execute(
                r#"
                INSERT INTO message_receipts (message_id, user_id, kind, at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (message_id, user_id, kind) DO NOTHING
                "#,
                &[&message_id, &user_id, &kind, &at],
            )
            .await?;

        if inserted > 0 {
            // status only moves forward: sent < delivered < read
            client
                .execute(
                    r#"
                    UPDATE messages
                    SET status = $2, updated_at = NOW()
                    WHERE id = $1
                      AND (status = 'sent' OR status = 'failed' OR ($2 = 'read' AND status = 'delivered'))
                    "#,
                    &[&message_id, &kind],
                )
                .await?;
        }
        Ok(inserted > 0)
    }

    async fn require_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let client = self.pool.get().await?;
        self.load_message(&client, message_id)
            .await?
            .ok_or(StoreError::NotFound)
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> StoreResult<T> {
    let value: serde_json::Value = row.get(idx);
    serde_json::from_value(value)
        .map_err(|e| StoreError::Unavailable(format!("decode column {idx}: {e}")))
}

fn message_from_row(row: &Row) -> StoreResult<Message> {
    let kind: &str = row.get(4);
    let status: &str = row.get(8);
    let attachments: Vec<Attachment> = decode_json(row, 6)?;
    let delivered_to: Vec<Receipt> = decode_json(row, 16)?;
    let read_by: Vec<Receipt> = decode_json(row, 17)?;
    let reactions: Vec<Reaction> = decode_json(row, 18)?;

    Ok(Message {
        id: row.get(0),
        conversation_id: row.get(1),
        sender_id: row.get(2),
        sequence_number: row.get(3),
        kind: MessageKind::parse(kind).unwrap_or_default(),
        content: row.get(5),
        attachments,
        reply_to: row.get(7),
        status: MessageStatus::parse(status).unwrap_or(MessageStatus::Sent),
        read_by,
        delivered_to,
        reactions,
        edited: row.get(9),
        edited_at: row.get(10),
        deleted: row.get(11),
        deleted_for: row.get(12),
        client_id: row.get(13),
        created_at: row.get(14),
        updated_at: row.get(15),
    })
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

#[async_trait]
impl ChatStore for PgStore {
    async fn find_user(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, display_name, verified FROM users WHERE id = $1 AND deleted_at IS NULL",
                &[&user_id],
            )
            .await?;
        Ok(row.map(|r| UserProfile {
            id: r.get(0),
            display_name: r.get(1),
            verified: r.get(2),
        }))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        self.load_conversation(&client, conversation_id).await
    }

    async fn list_user_conversations(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<Conversation>> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        let rows = client
            .query(
                r#"
                SELECT c.id
                FROM conversations c
                JOIN conversation_participants p ON p.conversation_id = c.id
                WHERE p.user_id = $1
                  AND p.is_active
                  AND p.left_at IS NULL
                  AND c.deleted_at IS NULL
                ORDER BY c.last_activity DESC
                LIMIT $2
                "#,
                &[&user_id, &limit],
            )
            .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(conv) = self.load_conversation(&client, row.get(0)).await? {
                conversations.push(conv);
            }
        }
        Ok(conversations)
    }

    async fn find_or_create_direct(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> StoreResult<Conversation> {
        let mut client = self.pool.get().await?;
        let key = direct_key(user_a, user_b);

        let tx = client.transaction().await?;
        let created = tx
            .query_opt(
                r#"
                INSERT INTO conversations (id, kind, direct_key)
                VALUES ($1, 'direct', $2)
                ON CONFLICT (direct_key) WHERE deleted_at IS NULL DO NOTHING
                RETURNING id
                "#,
                &[&Uuid::new_v4(), &key],
            )
            .await?;

        let conversation_id: Uuid = match created {
            Some(row) => {
                let id: Uuid = row.get(0);
                tx.execute(
                    r#"
                    INSERT INTO conversation_participants (conversation_id, user_id, role)
                    VALUES ($1, $2, 'member'), ($1, $3, 'member')
                    "#,
                    &[&id, &user_a, &user_b],
                )
                .await?;
                id
            }
            None => tx
                .query_one(
                    "SELECT id FROM conversations WHERE direct_key = $1 AND deleted_at IS NULL",
                    &[&key],
                )
                .await?
                .get(0),
        };
        tx.commit().await?;

        self.load_conversation(&client, conversation_id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        last_message_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE conversations
                SET last_message_id = $2, last_activity = $3, updated_at = $3
                WHERE id = $1
                "#,
                &[&conversation_id, &last_message_id, &at],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_last_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE conversation_participants
                SET last_read_at = GREATEST(COALESCE(last_read_at, $3), $3)
                WHERE conversation_id = $1 AND user_id = $2
                "#,
                &[&conversation_id, &user_id, &at],
            )
            .await?;
        Ok(())
    }

    async fn find_by_client_id(
        &self,
        sender_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.sender_id = $1 AND m.client_id = $2"
        );
        let row = client.query_opt(sql.as_str(), &[&sender_id, &client_id]).await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    async fn insert_message(&self, new: NewMessage) -> StoreResult<Message> {
        let client = self.pool.get().await?;
        let id = Uuid::new_v4();
        let attachments = serde_json::to_value(&new.attachments)
            .map_err(|e| StoreError::Unavailable(format!("encode attachments: {e}")))?;
        let kind = new.kind.as_str();

        let result = client
            .execute(
                r#"
                WITH next AS (
                    INSERT INTO conversation_counters (conversation_id, last_seq)
                    VALUES ($2, 1)
                    ON CONFLICT (conversation_id)
                    DO UPDATE SET last_seq = conversation_counters.last_seq + 1
                    RETURNING last_seq
                )
                INSERT INTO messages (
                    id, conversation_id, sender_id, sequence_number, message_type,
                    content, attachments, reply_to, client_id
                )
                SELECT $1, $2, $3, next.last_seq, $4, $5, $6, $7, $8
                FROM next
                "#,
                &[
                    &id,
                    &new.conversation_id,
                    &new.sender_id,
                    &kind,
                    &new.content,
                    &attachments,
                    &new.reply_to,
                    &new.client_id,
                ],
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::Duplicate),
            Err(e) => return Err(e.into()),
        }

        self.load_message(&client, id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn bulk_insert(&self, entries: &[WriteBehindEntry]) -> StoreResult<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let encoded: Vec<(serde_json::Value, &'static str)> = entries
            .iter()
            .map(|e| {
                serde_json::to_value(&e.attachments)
                    .map(|a| (a, e.kind.as_str()))
                    .map_err(|err| StoreError::Unavailable(format!("encode attachments: {err}")))
            })
            .collect::<StoreResult<_>>()?;

        let mut sql = String::from(
            "INSERT INTO messages (id, conversation_id, sender_id, sequence_number, message_type, \
             content, attachments, reply_to, client_id, created_at, updated_at) VALUES ",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(entries.len() * 10);
        for (i, (entry, (attachments, kind))) in entries.iter().zip(encoded.iter()).enumerate() {
            let base = i * 10;
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8,
                base + 9,
                base + 10,
                base + 10,
            ));
            params.push(&entry.message_id);
            params.push(&entry.conversation_id);
            params.push(&entry.sender_id);
            params.push(&entry.sequence_number);
            params.push(kind);
            params.push(&entry.content);
            params.push(attachments);
            params.push(&entry.reply_to);
            params.push(&entry.client_id);
            params.push(&entry.timestamp);
        }
        sql.push_str(" ON CONFLICT DO NOTHING");

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let written = tx.execute(sql.as_str(), &params).await?;

        // keep counters ahead of anything the log already assigned
        for entry in entries {
            tx.execute(
                r#"
                INSERT INTO conversation_counters (conversation_id, last_seq)
                VALUES ($1, $2)
                ON CONFLICT (conversation_id)
                DO UPDATE SET last_seq = GREATEST(conversation_counters.last_seq, EXCLUDED.last_seq)
                "#,
                &[&entry.conversation_id, &entry.sequence_number],
            )
            .await?;
        }
        tx.commit().await?;

        if written < entries.len() as u64 {
            warn!(
                skipped = entries.len() as u64 - written,
                "write-behind batch contained already persisted messages"
            );
        }
        Ok(written)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        let client = self.pool.get().await?;
        self.load_message(&client, message_id).await
    }

    async fn history(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = $1
              AND ($2::BIGINT IS NULL OR m.sequence_number < $2)
            ORDER BY m.sequence_number DESC
            LIMIT $3
            "#
        );
        client
            .query(sql.as_str(), &[&conversation_id, &before, &limit])
            .await?
            .iter()
            .map(message_from_row)
            .collect()
    }

    async fn mark_delivered(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.add_receipt("delivered", message_id, user_id, at).await
    }

    async fn mark_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.add_receipt("read", message_id, user_id, at).await
    }

    async fn unread_for(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = $1
              AND m.sender_id <> $2
              AND NOT m.deleted
              AND NOT ($2 = ANY(m.deleted_for))
              AND NOT EXISTS (
                  SELECT 1 FROM message_receipts r
                  WHERE r.message_id = m.id AND r.user_id = $2 AND r.kind = 'read'
              )
            ORDER BY m.sequence_number
            "#
        );
        client
            .query(sql.as_str(), &[&conversation_id, &user_id])
            .await?
            .iter()
            .map(message_from_row)
            .collect()
    }

    async fn set_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        {
            let client = self.pool.get().await?;
            match &emoji {
                Some(emoji) => {
                    client
                        .execute(
                            r#"
                            INSERT INTO message_reactions (message_id, user_id, emoji, at)
                            VALUES ($1, $2, $3, $4)
                            ON CONFLICT (message_id, user_id)
                            DO UPDATE SET emoji = EXCLUDED.emoji, at = EXCLUDED.at
                            "#,
                            &[&message_id, &user_id, emoji, &at],
                        )
                        .await
                        .map_err(|e| {
                            if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                                StoreError::NotFound
                            } else {
                                StoreError::from(e)
                            }
                        })?;
                }
                None => {
                    client
                        .execute(
                            "DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2",
                            &[&message_id, &user_id],
                        )
                        .await?;
                }
            }
        }
        self.require_message(message_id).await
    }

    async fn edit_message(
        &self,
        message_id: Uuid,
        content: String,
        at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        {
            let client = self.pool.get().await?;
            let updated = client
                .execute(
                    r#"
                    UPDATE messages
                    SET content = $2, edited = TRUE, edited_at = $3, updated_at = $3
                    WHERE id = $1
                    "#,
                    &[&message_id, &content, &at],
                )
                .await?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
        }
        self.require_message(message_id).await
    }

    async fn delete_for_everyone(
        &self,
        message_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        {
            let client = self.pool.get().await?;
            let updated = client
                .execute(
                    r#"
                    UPDATE messages
                    SET deleted = TRUE, content = NULL, attachments = '[]'::jsonb, updated_at = $2
                    WHERE id = $1
                    "#,
                    &[&message_id, &at],
                )
                .await?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
        }
        self.require_message(message_id).await
    }

    async fn delete_for_user(&self, message_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE messages
                SET deleted_for = CASE
                    WHEN $2 = ANY(deleted_for) THEN deleted_for
                    ELSE array_append(deleted_for, $2)
                END
                WHERE id = $1
                "#,
                &[&message_id, &user_id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE users SET presence_status = $2, last_seen = $3 WHERE id = $1",
                &[&user_id, &status.as_str(), &last_seen],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(a, b), direct_key(b, a));
    }
}
