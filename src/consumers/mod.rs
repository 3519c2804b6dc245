//! Durable queue-group consumers
//!
//! Each consumer family uses its own queue group, so both receive every
//! record while instances within a family split the load.

pub mod archiver;
pub mod hot_storage;

pub use archiver::{ArchiveError, ArchiveWriter, ArchiverConsumer};
pub use hot_storage::{reconcile_index, HotStorageConsumer, ReconcileReport};

use crate::bus::{BusError, EventBus, MessageHandler, Subscription};
use std::sync::Arc;

/// Default queue group (and durable name) of the archiver
pub const ARCHIVER_GROUP: &str = "archiver-processor";

/// Default queue group (and durable name) of the hot-storage consumer
pub const HOT_STORAGE_GROUP: &str = "hot-storage-processor";

/// Join `queue_group` on `subject`, using the group name as durable name
pub async fn start_consumer(
    bus: &dyn EventBus,
    subject: &str,
    queue_group: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<Subscription, BusError> {
    let subscription = bus.subscribe(subject, queue_group, queue_group, handler).await?;
    tracing::info!(
        subject = subject,
        queue_group = queue_group,
        "Consumer subscribed"
    );
    Ok(subscription)
}
