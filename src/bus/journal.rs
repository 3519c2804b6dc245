//! Write-ahead journal for the embedded broker
//!
//! Streams, durable consumer bindings and retained messages (with the set
//! of consumers still owing an ack) are persisted so that a restarted
//! process redelivers everything that was accepted but not yet processed.

use super::StreamConfig;
use crate::storage::{open_pool, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledStream {
    pub config: StreamConfig,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledConsumer {
    pub stream: String,
    pub durable: String,
    pub subject: String,
    pub queue_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledMessage {
    pub stream: String,
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    /// Durables that have not acknowledged the message
    pub interest: Vec<String>,
}

/// Everything needed to rebuild broker state
#[derive(Debug, Default)]
pub struct JournalSnapshot {
    pub streams: Vec<JournaledStream>,
    pub consumers: Vec<JournaledConsumer>,
    /// In stream sequence order
    pub messages: Vec<JournaledMessage>,
}

/// Durable storage behind the broker
#[async_trait]
pub trait BusJournal: Send + Sync + 'static {
    async fn load(&self) -> Result<JournalSnapshot, StoreError>;

    /// Record the stream definition, creating or replacing it
    async fn save_stream(&self, stream: &StreamConfig) -> Result<(), StoreError>;

    /// Persist one retained message and advance the stream's sequence
    async fn append(
        &self,
        stream: &str,
        sequence: u64,
        subject: &str,
        payload: &[u8],
        interest: &[String],
    ) -> Result<(), StoreError>;

    async fn save_consumer(&self, consumer: &JournaledConsumer) -> Result<(), StoreError>;

    /// Drop `durable` from the message's interest, deleting the message
    /// once nobody owes an ack
    async fn release(&self, stream: &str, sequence: u64, durable: &str) -> Result<(), StoreError>;
}

/// SQLite journal sharing the key-value store's pool tuning
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = open_pool(database_url).await?;

        let mut migrator = sqlx::migrate!("./migrations/bus");
        migrator.set_ignore_missing(true);
        migrator.run(&pool).await?;
        info!(url = database_url, "Bus journal ready");

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_sequence(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative sequence {}", value)))
}

fn to_column(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence)
        .map_err(|_| StoreError::Corrupt(format!("sequence {} out of range", sequence)))
}

#[async_trait]
impl BusJournal for SqliteJournal {
    async fn load(&self) -> Result<JournalSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut streams = Vec::new();
        for row in sqlx::query("SELECT name, subjects, last_sequence FROM bus_streams ORDER BY name")
            .fetch_all(&mut *tx)
            .await?
        {
            let name: String = row.try_get("name")?;
            let subjects: String = row.try_get("subjects")?;
            let subjects: Vec<String> = serde_json::from_str(&subjects).map_err(|e| {
                StoreError::Corrupt(format!("subjects of stream '{}': {}", name, e))
            })?;
            streams.push(JournaledStream {
                config: StreamConfig { name, subjects },
                last_sequence: to_sequence(row.try_get("last_sequence")?)?,
            });
        }

        let consumers = sqlx::query(
            "SELECT stream, durable, subject, queue_group FROM bus_consumers ORDER BY stream, durable",
        )
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| -> Result<JournaledConsumer, StoreError> {
            Ok(JournaledConsumer {
                stream: row.try_get("stream")?,
                durable: row.try_get("durable")?,
                subject: row.try_get("subject")?,
                queue_group: row.try_get("queue_group")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        let mut interest: HashMap<(String, i64), Vec<String>> = HashMap::new();
        for row in sqlx::query("SELECT stream, sequence, durable FROM bus_interest")
            .fetch_all(&mut *tx)
            .await?
        {
            interest
                .entry((row.try_get("stream")?, row.try_get("sequence")?))
                .or_default()
                .push(row.try_get("durable")?);
        }

        let mut messages = Vec::new();
        for row in sqlx::query(
            "SELECT stream, sequence, subject, payload FROM bus_messages ORDER BY stream, sequence",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            let stream: String = row.try_get("stream")?;
            let sequence: i64 = row.try_get("sequence")?;
            let owed = interest.remove(&(stream.clone(), sequence)).unwrap_or_default();
            messages.push(JournaledMessage {
                stream,
                sequence: to_sequence(sequence)?,
                subject: row.try_get("subject")?,
                payload: row.try_get("payload")?,
                interest: owed,
            });
        }

        tx.commit().await?;

        Ok(JournalSnapshot {
            streams,
            consumers,
            messages,
        })
    }

    async fn save_stream(&self, stream: &StreamConfig) -> Result<(), StoreError> {
        let subjects = serde_json::to_string(&stream.subjects)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO bus_streams (name, subjects, last_sequence) VALUES (?, ?, 0)
             ON CONFLICT(name) DO UPDATE SET subjects = excluded.subjects",
        )
        .bind(&stream.name)
        .bind(subjects)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        sequence: u64,
        subject: &str,
        payload: &[u8],
        interest: &[String],
    ) -> Result<(), StoreError> {
        let sequence = to_column(sequence)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE bus_streams SET last_sequence = MAX(last_sequence, ?) WHERE name = ?")
            .bind(sequence)
            .bind(stream)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO bus_messages (stream, sequence, subject, payload)
             VALUES (?, ?, ?, ?)",
        )
        .bind(stream)
        .bind(sequence)
        .bind(subject)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        for durable in interest {
            sqlx::query(
                "INSERT OR IGNORE INTO bus_interest (stream, sequence, durable) VALUES (?, ?, ?)",
            )
            .bind(stream)
            .bind(sequence)
            .bind(durable)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_consumer(&self, consumer: &JournaledConsumer) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO bus_consumers (stream, durable, subject, queue_group) VALUES (?, ?, ?, ?)
             ON CONFLICT(stream, durable) DO UPDATE
             SET subject = excluded.subject, queue_group = excluded.queue_group",
        )
        .bind(&consumer.stream)
        .bind(&consumer.durable)
        .bind(&consumer.subject)
        .bind(&consumer.queue_group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, stream: &str, sequence: u64, durable: &str) -> Result<(), StoreError> {
        let sequence = to_column(sequence)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM bus_interest WHERE stream = ? AND sequence = ? AND durable = ?")
            .bind(stream)
            .bind(sequence)
            .bind(durable)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM bus_messages WHERE stream = ? AND sequence = ?
             AND NOT EXISTS (
                 SELECT 1 FROM bus_interest WHERE stream = ? AND sequence = ?
             )",
        )
        .bind(stream)
        .bind(sequence)
        .bind(stream)
        .bind(sequence)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

// ============================================================
// Background writer
// ============================================================

enum JournalOp {
    Release {
        stream: String,
        sequence: u64,
        durable: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Journal plus a queue for writes issued from synchronous ack paths
///
/// Releases are applied in order by one writer task. A lost release only
/// causes a duplicate delivery after restart.
pub(crate) struct JournalHandle {
    journal: Arc<dyn BusJournal>,
    ops: mpsc::UnboundedSender<JournalOp>,
}

impl JournalHandle {
    pub(crate) fn spawn(journal: Arc<dyn BusJournal>) -> Self {
        let (ops, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(journal.clone(), receiver));
        Self { journal, ops }
    }

    pub(crate) fn journal(&self) -> &dyn BusJournal {
        self.journal.as_ref()
    }

    pub(crate) fn release(&self, stream: &str, sequence: u64, durable: &str) {
        let op = JournalOp::Release {
            stream: stream.to_string(),
            sequence,
            durable: durable.to_string(),
        };
        if self.ops.send(op).is_err() {
            warn!(sequence = sequence, "Journal writer stopped, release not recorded");
        }
    }

    /// Wait until every queued write has been applied
    pub(crate) async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        if self.ops.send(JournalOp::Flush(done)).is_ok() {
            let _ = applied.await;
        }
    }
}

async fn run_writer(journal: Arc<dyn BusJournal>, mut ops: mpsc::UnboundedReceiver<JournalOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            JournalOp::Release {
                stream,
                sequence,
                durable,
            } => {
                if let Err(e) = journal.release(&stream, sequence, &durable).await {
                    warn!(
                        error = %e,
                        stream = %stream,
                        sequence = sequence,
                        durable = %durable,
                        "Failed to record acknowledgment in bus journal"
                    );
                }
            }
            JournalOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs_stream() -> StreamConfig {
        StreamConfig {
            name: "LOGS".to_string(),
            subjects: vec!["log.events".to_string()],
        }
    }

    async fn memory_journal() -> SqliteJournal {
        SqliteJournal::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_empty_journal_loads_nothing() {
        let journal = memory_journal().await;
        let snapshot = journal.load().await.unwrap();
        assert!(snapshot.streams.is_empty());
        assert!(snapshot.consumers.is_empty());
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let journal = memory_journal().await;
        journal.save_stream(&logs_stream()).await.unwrap();
        journal
            .save_consumer(&JournaledConsumer {
                stream: "LOGS".into(),
                durable: "hot".into(),
                subject: "log.events".into(),
                queue_group: "hot".into(),
            })
            .await
            .unwrap();
        journal
            .append("LOGS", 7, "log.events", b"{}", &["hot".to_string()])
            .await
            .unwrap();

        let snapshot = journal.load().await.unwrap();
        assert_eq!(snapshot.streams.len(), 1);
        assert_eq!(snapshot.streams[0].config, logs_stream());
        assert_eq!(snapshot.streams[0].last_sequence, 7);
        assert_eq!(snapshot.consumers[0].durable, "hot");
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].sequence, 7);
        assert_eq!(snapshot.messages[0].payload, b"{}".to_vec());
        assert_eq!(snapshot.messages[0].interest, vec!["hot".to_string()]);
    }

    #[tokio::test]
    async fn test_release_deletes_message_after_last_ack() {
        let journal = memory_journal().await;
        journal.save_stream(&logs_stream()).await.unwrap();
        let interest = vec!["archiver".to_string(), "hot".to_string()];
        journal
            .append("LOGS", 1, "log.events", b"a", &interest)
            .await
            .unwrap();

        journal.release("LOGS", 1, "hot").await.unwrap();
        let snapshot = journal.load().await.unwrap();
        assert_eq!(snapshot.messages[0].interest, vec!["archiver".to_string()]);

        journal.release("LOGS", 1, "archiver").await.unwrap();
        let snapshot = journal.load().await.unwrap();
        assert!(snapshot.messages.is_empty());
        // The high-water mark outlives the message
        assert_eq!(snapshot.streams[0].last_sequence, 1);
    }

    #[tokio::test]
    async fn test_save_stream_keeps_sequence() {
        let journal = memory_journal().await;
        journal.save_stream(&logs_stream()).await.unwrap();
        journal
            .append("LOGS", 3, "log.events", b"a", &["hot".to_string()])
            .await
            .unwrap();

        let mut updated = logs_stream();
        updated.subjects.push("log.audit".to_string());
        journal.save_stream(&updated).await.unwrap();

        let snapshot = journal.load().await.unwrap();
        assert_eq!(snapshot.streams[0].config.subjects.len(), 2);
        assert_eq!(snapshot.streams[0].last_sequence, 3);
    }

    #[tokio::test]
    async fn test_handle_flush_waits_for_queued_releases() {
        let journal = Arc::new(memory_journal().await);
        journal.save_stream(&logs_stream()).await.unwrap();
        journal
            .append("LOGS", 1, "log.events", b"a", &["hot".to_string()])
            .await
            .unwrap();

        let handle = JournalHandle::spawn(journal.clone());
        handle.release("LOGS", 1, "hot");
        handle.flush().await;

        assert!(journal.load().await.unwrap().messages.is_empty());
    }
}
