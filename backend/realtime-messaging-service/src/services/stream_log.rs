//! Redis Streams backed write-behind log.
//!
//! One stream per namespace, one consumer group shared by every node. Each
//! node reads as its own consumer. Entries a consumer was handed but never
//! acknowledged are re-read by that consumer first; once they sit idle past
//! the claim threshold any consumer takes them over, so a node that crashed
//! and came back under a new name loses nothing.

use crate::error::QueueError;
use crate::models::WriteBehindEntry;
use crate::redis_client::RedisClient;
use crate::services::write_behind::{LogRecord, WriteBehindLog};
use async_trait::async_trait;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use std::time::Duration;

/// Approximate cap on retained stream entries.
const STREAM_MAX_LEN: usize = 100_000;

/// Pending entries idle this long are presumed abandoned by their consumer.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

pub struct RedisStreamLog {
    redis: RedisClient,
    key: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
}

impl RedisStreamLog {
    pub fn new(redis: RedisClient, namespace: &str, consumer: &str) -> Self {
        Self {
            redis,
            key: format!("{namespace}:write-behind"),
            group: format!("{namespace}-persist"),
            consumer: consumer.to_string(),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Moves up to `max` idle entries from other consumers' pending lists onto
    /// this consumer's. Needs Redis 6.2 or later.
    async fn claim_abandoned(&self, max: usize) -> Result<(), QueueError> {
        let mut conn = self.redis.manager();
        let _: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0")
            .arg("COUNT")
            .arg(max)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Creates the consumer group (and stream) if missing. Idempotent.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.manager();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_from(&self, start: &str, max: usize) -> Result<Vec<LogRecord>, QueueError> {
        let mut conn = self.redis.manager();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("STREAMS")
            .arg(&self.key)
            .arg(start)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::new();
        let mut poisoned = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for item in stream.ids {
                let decoded = item
                    .get::<String>("entry")
                    .map(|raw| serde_json::from_str::<WriteBehindEntry>(&raw));
                match decoded {
                    Some(Ok(entry)) => records.push(LogRecord { id: item.id, entry }),
                    Some(Err(e)) => {
                        tracing::warn!(id = %item.id, error = %e, "dropping undecodable write-behind entry");
                        poisoned.push(item.id);
                    }
                    None => {
                        tracing::warn!(id = %item.id, "dropping write-behind entry without payload");
                        poisoned.push(item.id);
                    }
                }
            }
        }

        if !poisoned.is_empty() {
            self.ack(&poisoned).await?;
        }
        Ok(records)
    }
}

#[async_trait]
impl WriteBehindLog for RedisStreamLog {
    async fn append(&self, entry: &WriteBehindEntry) -> Result<(), QueueError> {
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.redis.manager();
        redis::cmd("XADD")
            .arg(&self.key)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("entry")
            .arg(payload)
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_batch(&self, max: usize) -> Result<Vec<LogRecord>, QueueError> {
        // "0" replays this consumer's pending entries, ">" reads new ones
        let pending = self.read_from("0", max).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        self.claim_abandoned(max).await?;
        let claimed = self.read_from("0", max).await?;
        if !claimed.is_empty() {
            tracing::info!(count = claimed.len(), consumer = %self.consumer, "reclaimed abandoned write-behind entries");
            return Ok(claimed);
        }
        self.read_from(">", max).await
    }

    async fn ack(&self, ids: &[String]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.manager();
        let _: i64 = conn.xack(&self.key, &self.group, ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, WriteBehindEntry};
    use chrono::Utc;
    use uuid::Uuid;

    async fn log(namespace: &str, consumer: &str) -> RedisStreamLog {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let redis = RedisClient::from_url(&url).await.unwrap();
        let log = RedisStreamLog::new(redis, namespace, consumer).with_claim_idle(Duration::ZERO);
        log.ensure_group().await.unwrap();
        log
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_entries_of_vanished_consumer_are_reclaimed() {
        let namespace = format!("wb-test-{}", Uuid::new_v4());
        let entry = WriteBehindEntry {
            message_id: Uuid::new_v4(),
            sequence_number: 1,
            client_id: None,
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: Some("orphaned".into()),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            reply_to: None,
            timestamp: Utc::now(),
        };

        // first node reads the entry and dies before acknowledging it
        let crashed = log(&namespace, "node-a").await;
        crashed.append(&entry).await.unwrap();
        assert_eq!(crashed.read_batch(10).await.unwrap().len(), 1);
        drop(crashed);

        let restarted = log(&namespace, "node-b").await;
        let batch = restarted.read_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entry.message_id, entry.message_id);

        let ids: Vec<String> = batch.into_iter().map(|r| r.id).collect();
        restarted.ack(&ids).await.unwrap();
        assert!(restarted.read_batch(10).await.unwrap().is_empty());

        let mut conn = restarted.redis.manager();
        let _: i64 = conn.del(&restarted.key).await.unwrap();
    }
}
