//! Hot-storage consumer
//!
//! Dual write without a transaction:
//! 1. raw payload into the key-value store under a fresh hit id
//! 2. decoded record into the index under the same id
//!
//! A failed step 1 is negatively acknowledged and retried by the bus. A
//! failed step 2 is acknowledged anyway: the record is stored but not
//! searchable until `reconcile_index` sweeps it back in.

use crate::bus::{Message, MessageHandler};
use crate::index::{IndexError, SearchIndex};
use crate::model::LogRecord;
use crate::retry::{backoff_delay, NAK_BASE_DELAY, NAK_MAX_DELAY};
use crate::storage::{KeyValueStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CONSUMER: &str = "hot_storage";

pub struct HotStorageConsumer {
    kv: Arc<dyn KeyValueStore>,
    index: Arc<dyn SearchIndex>,
}

impl HotStorageConsumer {
    pub fn new(kv: Arc<dyn KeyValueStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self { kv, index }
    }
}

#[async_trait]
impl MessageHandler for HotStorageConsumer {
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

        let hit_id = uuid::Uuid::new_v4().to_string();

        if let Err(e) = self.kv.set(hit_id.as_bytes(), message.payload()).await {
            let delay = backoff_delay(message.delivery_count(), NAK_BASE_DELAY, NAK_MAX_DELAY);
            error!(
                consumer = CONSUMER,
                hit_id = %hit_id,
                delivery = message.delivery_count(),
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Key-value write failed, requesting redelivery"
            );
            crate::metrics::record_consumer_message(CONSUMER, "store_failed");
            message.nak_with_delay(delay);
            return;
        }

        if let Err(e) = self.index.index(&hit_id, &record).await {
            error!(
                consumer = CONSUMER,
                hit_id = %hit_id,
                error = %e,
                "Indexing failed, record stored but not searchable"
            );
            crate::metrics::record_consumer_message(CONSUMER, "index_failed");
            message.ack();
            return;
        }

        debug!(consumer = CONSUMER, hit_id = %hit_id, "Indexed log");
        crate::metrics::record_consumer_message(CONSUMER, "indexed");
        message.ack();
    }
}

// ============================================================
// Reconciliation
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: u64,
    pub indexed: u64,
    pub undecodable: u64,
    pub failed: u64,
}

/// Re-index every decodable record in the key-value store under its key
///
/// Walks the store in key order, `batch` entries at a time. Undecodable
/// entries and per-record index failures are counted, not fatal; a store
/// error aborts the sweep.
pub async fn reconcile_index(
    kv: &dyn KeyValueStore,
    index: &dyn SearchIndex,
    batch: usize,
) -> Result<ReconcileReport, StoreError> {
    let batch = batch.max(1);
    let mut report = ReconcileReport::default();
    let mut cursor: Option<Vec<u8>> = None;

    loop {
        let entries = kv.scan(cursor.as_deref(), batch).await?;
        let Some((last_key, _)) = entries.last() else {
            break;
        };
        let next_cursor = last_key.clone();
        let full_batch = entries.len() == batch;

        for (key, value) in entries {
            report.scanned += 1;

            let id = String::from_utf8_lossy(&key);
            let record = match LogRecord::from_slice(&value) {
                Ok(record) => record,
                Err(e) => {
                    debug!(hit_id = %id, error = %e, "Skipping undecodable stored record");
                    report.undecodable += 1;
                    continue;
                }
            };

            match index.index(&id, &record).await {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    warn!(hit_id = %id, error = %e, "Re-indexing failed");
                    report.failed += 1;
                }
            }
        }

        if !full_batch {
            break;
        }
        cursor = Some(next_cursor);
    }

    info!(
        scanned = report.scanned,
        indexed = report.indexed,
        undecodable = report.undecodable,
        failed = report.failed,
        "Index reconciliation finished"
    );
    Ok(report)
}
