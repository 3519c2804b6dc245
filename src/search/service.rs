//! Search execution and hit resolution

use super::translator::{translate, QueryError};
use crate::index::{IndexError, SearchIndex};
use crate::model::{LogRecord, RecordError};
use crate::storage::{KeyValueStore, StoreError};
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("search execution failed: {0}")]
    Index(#[from] IndexError),

    #[error("hit resolution failed: {0}")]
    Resolve(#[from] StoreError),

    #[error("stored record for hit '{id}' is undecodable: {source}")]
    Decode {
        id: String,
        #[source]
        source: RecordError,
    },
}

impl SearchError {
    /// True for errors caused by the request rather than the backend
    pub fn is_client_error(&self) -> bool {
        matches!(self, SearchError::Query(_))
    }
}

/// Clamped page/size pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    /// Page < 1 becomes 1; size outside 1..=100 becomes the default
    pub fn new(page: i64, size: i64) -> Self {
        let page = if page < 1 { 1 } else { page as usize };
        let size = if size < 1 || size > MAX_PAGE_SIZE as i64 {
            DEFAULT_PAGE_SIZE
        } else {
            size as usize
        };
        Self { page, size }
    }

    /// Lenient parse of raw query parameters; unparseable values clamp
    pub fn from_params(page: Option<&str>, size: Option<&str>) -> Self {
        let page = page.map_or(1, |p| p.trim().parse().unwrap_or(0));
        let size = size.map_or(DEFAULT_PAGE_SIZE as i64, |s| s.trim().parse().unwrap_or(0));
        Self::new(page, size)
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.size)
    }
}

/// Executes translated queries and resolves hits to full records
pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    kv: Arc<dyn KeyValueStore>,
}

impl SearchService {
    pub fn new(index: Arc<dyn SearchIndex>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { index, kv }
    }

    /// Run a query and return one page of records in index order
    ///
    /// Resolution is all-or-nothing: one missing or undecodable record
    /// fails the request.
    pub async fn search(
        &self,
        query: &str,
        pagination: Pagination,
    ) -> Result<Vec<LogRecord>, SearchError> {
        let start = Instant::now();
        let result = self.execute(query, pagination).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "error",
        };
        crate::metrics::record_search(outcome, start.elapsed());

        result
    }

    async fn execute(
        &self,
        query: &str,
        pagination: Pagination,
    ) -> Result<Vec<LogRecord>, SearchError> {
        let index_query = translate(query)?;

        let results = self
            .index
            .search(&index_query, pagination.offset(), pagination.size)
            .await?;

        tracing::debug!(
            query = query,
            total = results.total,
            page = pagination.page,
            size = pagination.size,
            hits = results.hits.len(),
            "Search executed"
        );

        let keys: Vec<Vec<u8>> = results
            .hits
            .iter()
            .map(|hit| hit.id.as_bytes().to_vec())
            .collect();
        let raw = self.kv.get_many(&keys).await?;

        results
            .hits
            .iter()
            .zip(raw)
            .map(|(hit, bytes)| {
                LogRecord::from_slice(&bytes).map_err(|source| SearchError::Decode {
                    id: hit.id.clone(),
                    source,
                })
            })
            .collect()
    }
}
