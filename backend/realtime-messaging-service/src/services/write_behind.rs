//! Durable write-behind queue.
//!
//! Accepted messages are appended to an ordered, at-least-once log. A
//! consumer drains the log in small batches and bulk-inserts each batch.
//! Entries carry the persisted id and sequence number, so replays are
//! harmless.

use crate::config::WriteBehindConfig;
use crate::error::QueueError;
use crate::metrics::{record_flush, WRITE_BEHIND_FAILURES_TOTAL};
use crate::models::WriteBehindEntry;
use crate::store::ChatStore;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Log position, used to acknowledge the record.
    pub id: String,
    pub entry: WriteBehindEntry,
}

#[async_trait]
pub trait WriteBehindLog: Send + Sync {
    async fn append(&self, entry: &WriteBehindEntry) -> Result<(), QueueError>;

    /// Next batch to persist. Records handed out earlier but never
    /// acknowledged come first.
    async fn read_batch(&self, max: usize) -> Result<Vec<LogRecord>, QueueError>;

    async fn ack(&self, ids: &[String]) -> Result<(), QueueError>;
}

/// In-process log for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<VecDeque<LogRecord>>,
    next_id: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl WriteBehindLog for MemoryLog {
    async fn append(&self, entry: &WriteBehindEntry) -> Result<(), QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.records.lock().await.push_back(LogRecord {
            id: id.to_string(),
            entry: entry.clone(),
        });
        Ok(())
    }

    async fn read_batch(&self, max: usize) -> Result<Vec<LogRecord>, QueueError> {
        let records = self.records.lock().await;
        Ok(records.iter().take(max).cloned().collect())
    }

    async fn ack(&self, ids: &[String]) -> Result<(), QueueError> {
        self.records
            .lock()
            .await
            .retain(|record| !ids.contains(&record.id));
        Ok(())
    }
}

/// Consumer loop draining the log into the store.
pub struct WriteBehindWorker {
    log: Arc<dyn WriteBehindLog>,
    store: Arc<dyn ChatStore>,
    config: WriteBehindConfig,
}

impl WriteBehindWorker {
    pub fn new(
        log: Arc<dyn WriteBehindLog>,
        store: Arc<dyn ChatStore>,
        config: WriteBehindConfig,
    ) -> Self {
        Self { log, store, config }
    }

    /// Persists one batch. Returns the number of records consumed; zero means
    /// the log was empty.
    pub async fn drain_once(&self) -> Result<usize, QueueError> {
        let batch = self.log.read_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let entries: Vec<WriteBehindEntry> = batch.iter().map(|r| r.entry.clone()).collect();
        let written = self.store.bulk_insert(&entries).await?;

        let ids: Vec<String> = batch.into_iter().map(|r| r.id).collect();
        self.log.ack(&ids).await?;

        record_flush(written);
        tracing::debug!(consumed = ids.len(), written, "write-behind batch flushed");
        Ok(ids.len())
    }

    /// Never terminates. A failed batch is logged and retried after the backoff.
    pub async fn run(self) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "write-behind consumer started"
        );
        loop {
            match self.drain_once().await {
                Ok(0) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(_) => tokio::task::yield_now().await,
                Err(e) => {
                    WRITE_BEHIND_FAILURES_TOTAL.inc();
                    tracing::error!(error = %e, "write-behind batch failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, NewMessage};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn entry(conversation_id: Uuid, seq: i64) -> WriteBehindEntry {
        WriteBehindEntry {
            message_id: Uuid::new_v4(),
            sequence_number: seq,
            client_id: Some(format!("c{seq}")),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: Some("queued".into()),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    fn config(batch_size: usize) -> WriteBehindConfig {
        WriteBehindConfig {
            batch_size,
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(50),
            claim_idle: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_drains_in_batches() {
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(MemoryStore::new());
        let conv = Uuid::new_v4();
        for seq in 1..=5 {
            log.append(&entry(conv, seq)).await.unwrap();
        }

        let worker = WriteBehindWorker::new(log.clone(), store.clone(), config(2));
        assert_eq!(worker.drain_once().await.unwrap(), 2);
        assert_eq!(worker.drain_once().await.unwrap(), 2);
        assert_eq!(worker.drain_once().await.unwrap(), 1);
        assert_eq!(worker.drain_once().await.unwrap(), 0);

        assert!(log.is_empty().await);
        assert_eq!(store.message_count(conv).await, 5);
    }

    #[tokio::test]
    async fn test_failed_batch_stays_in_log() {
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(MemoryStore::new());
        let conv = Uuid::new_v4();
        log.append(&entry(conv, 1)).await.unwrap();

        let worker = WriteBehindWorker::new(log.clone(), store.clone(), config(10));
        store.set_unavailable(true);
        assert!(worker.drain_once().await.is_err());
        assert_eq!(log.len().await, 1);

        store.set_unavailable(false);
        assert_eq!(worker.drain_once().await.unwrap(), 1);
        assert_eq!(store.message_count(conv).await, 1);
    }

    #[tokio::test]
    async fn test_replayed_entries_are_not_duplicated() {
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(MemoryStore::new());
        let sender = store.add_user("s").await.id;
        let conv = store.create_group("g", sender, &[]).await;
        let persisted = store
            .insert_message(NewMessage {
                conversation_id: conv.id,
                sender_id: sender,
                kind: MessageKind::Text,
                content: Some("hi".into()),
                attachments: Vec::new(),
                reply_to: None,
                client_id: Some("c1".into()),
            })
            .await
            .unwrap();

        let replay = WriteBehindEntry::from_message(&persisted);
        log.append(&replay).await.unwrap();
        log.append(&replay).await.unwrap();

        let worker = WriteBehindWorker::new(log.clone(), store.clone(), config(10));
        assert_eq!(worker.drain_once().await.unwrap(), 2);
        assert_eq!(store.message_count(conv.id).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failures() {
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(MemoryStore::new());
        let conv = Uuid::new_v4();
        log.append(&entry(conv, 1)).await.unwrap();
        store.set_unavailable(true);

        let handle = tokio::spawn(WriteBehindWorker::new(log.clone(), store.clone(), config(10)).run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(log.len().await, 1);

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(log.is_empty().await);
        assert_eq!(store.message_count(conv).await, 1);
        handle.abort();
    }
}
