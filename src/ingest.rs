//! Ingest gateway: normalize, stamp, publish

use crate::bus::{BusError, EventBus};
use crate::model::{LogRecord, RecordError};
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0}")]
    Malformed(#[from] RecordError),

    #[error("failed to publish log: {0}")]
    Publish(#[from] BusError),
}

pub struct IngestGateway {
    bus: Arc<dyn EventBus>,
    subject: String,
}

impl IngestGateway {
    pub fn new(bus: Arc<dyn EventBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    /// Decode a submitted payload and publish it
    ///
    /// Returns once the bus accepted the record; consumers run later.
    /// Nothing is published for a malformed payload.
    pub async fn ingest(&self, payload: &[u8]) -> Result<LogRecord, IngestError> {
        let record = match LogRecord::from_slice(payload) {
            Ok(record) => record,
            Err(e) => {
                crate::metrics::record_ingest("rejected");
                return Err(e.into());
            }
        };
        self.publish(record).await
    }

    /// Publish an already decoded record, stamping a zero timestamp
    pub async fn publish(&self, mut record: LogRecord) -> Result<LogRecord, IngestError> {
        record.ensure_timestamp(Utc::now());

        let payload = record.to_json_vec()?;
        if let Err(e) = self.bus.publish(&self.subject, payload).await {
            tracing::error!(subject = %self.subject, error = %e, "Error publishing log");
            crate::metrics::record_ingest("publish_failed");
            return Err(e.into());
        }

        crate::metrics::record_ingest("accepted");
        Ok(record)
    }
}
