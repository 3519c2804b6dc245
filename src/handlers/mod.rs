pub mod health;
pub mod ingest;
pub mod metrics_handler;
pub mod search;
pub mod tail;

use crate::ingest::IngestGateway;
use crate::search::SearchService;
use crate::tail::LiveTail;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared state for the log API handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestGateway>,
    pub search: Arc<SearchService>,
    pub tail: Arc<LiveTail>,
    /// Cancelled on server shutdown; tail sessions derive child tokens from it
    pub shutdown: CancellationToken,
}
