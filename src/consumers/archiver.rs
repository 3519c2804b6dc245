//! Cold archiver consumer
//!
//! Every record is written as its own gzip-compressed JSON object under
//! `YYYY/MM/DD/<uuid>.gz`. Object-store failures are logged and the
//! message is acknowledged anyway; there is no dead-letter path.

use crate::bus::{Message, MessageHandler};
use crate::model::{LogRecord, RecordError};
use crate::storage::{ObjectStore, StoreError};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

const CONSUMER: &str = "archiver";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("error encoding log: {0}")]
    Encode(#[from] RecordError),

    #[error("error compressing log: {0}")]
    Compress(#[from] std::io::Error),

    #[error("error writing to object store: {0}")]
    Store(#[from] StoreError),
}

pub fn gzip_encode(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gzip_decode(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Writes compressed records into one bucket
pub struct ArchiveWriter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ArchiveWriter {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Date partition of the record (UTC) plus a fresh random identifier
    pub fn object_key(record: &LogRecord) -> String {
        format!(
            "{}/{}.gz",
            record.timestamp.format("%Y/%m/%d"),
            uuid::Uuid::new_v4()
        )
    }

    /// Create the bucket, retrying while the backing store comes up
    pub async fn ensure_bucket(&self, attempts: u32, delay: Duration) -> Result<(), StoreError> {
        let store = &self.store;
        let bucket = self.bucket.as_str();
        crate::retry::retry_fixed(attempts, delay, "ensure archive bucket", move || {
            store.ensure_bucket(bucket)
        })
        .await?;
        info!(bucket = %self.bucket, "Archive bucket ready");
        Ok(())
    }

    /// Compress and store one record, returning its object key
    pub async fn write(&self, record: &LogRecord) -> Result<String, ArchiveError> {
        let compressed = gzip_encode(&record.to_json_vec()?)?;
        let key = Self::object_key(record);

        self.store
            .write(&self.bucket, &key, compressed, ARCHIVE_CONTENT_TYPE)
            .await?;

        Ok(key)
    }
}

pub struct ArchiverConsumer {
    writer: ArchiveWriter,
}

impl ArchiverConsumer {
    pub fn new(writer: ArchiveWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl MessageHandler for ArchiverConsumer {
    async fn handle(&self, message: Message) {
        let record = match LogRecord::from_slice(message.payload()) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    consumer = CONSUMER,
                    sequence = message.sequence(),
                    error = %e,
                    "Dropping undecodable message"
                );
                crate::metrics::record_consumer_message(CONSUMER, "malformed");
                message.ack();
                return;
            }
        };

        match self.writer.write(&record).await {
            Ok(object_key) => {
                debug!(
                    consumer = CONSUMER,
                    bucket = self.writer.bucket(),
                    object_key = %object_key,
                    "Archived log"
                );
                crate::metrics::record_consumer_message(CONSUMER, "archived");
            }
            Err(e) => {
                // Acked anyway: redelivering a persistent failure would loop forever
                error!(
                    consumer = CONSUMER,
                    sequence = message.sequence(),
                    delivery = message.delivery_count(),
                    error = %e,
                    "Archive write failed, acknowledging without archiving"
                );
                crate::metrics::record_consumer_message(CONSUMER, "write_failed");
            }
        }

        message.ack();
    }
}
