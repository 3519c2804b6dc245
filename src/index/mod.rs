//! Full-text index contract and the in-process `MemoryIndex`
//!
//! Documents are flattened into `level`, `message`, `timestamp` and one
//! `labels.<key>` field per label. Field names are case-insensitive.

pub mod query_string;

use crate::model::LogRecord;
use async_trait::async_trait;
use query_string::{analyze, BooleanQuery, Fields};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid query string '{query}': {reason}")]
    Parse { query: String, reason: String },

    #[error("index unavailable: {0}")]
    Unavailable(String),
}

/// Structured query handed to the index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    /// Free-text query parsed by the index's own grammar
    QueryString(String),
    /// Every sub-query must match
    Conjunction(Vec<IndexQuery>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub score: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    /// Total matches before pagination
    pub total: usize,
    pub hits: Vec<Hit>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index (or re-index, overwriting) a record under `id`
    async fn index(&self, id: &str, record: &LogRecord) -> Result<(), IndexError>;

    async fn search(
        &self,
        query: &IndexQuery,
        from: usize,
        size: usize,
    ) -> Result<SearchResults, IndexError>;

    async fn doc_count(&self) -> Result<u64, IndexError>;
}

/// Flatten a record into analyzed fields
pub fn document_fields(record: &LogRecord) -> Fields {
    let mut fields = Fields::new();
    fields.insert("level".to_string(), analyze(&record.level));
    fields.insert("message".to_string(), analyze(&record.message));
    fields.insert("timestamp".to_string(), analyze(&record.timestamp.to_rfc3339()));
    for (key, value) in &record.labels {
        fields.insert(format!("labels.{}", key.to_lowercase()), analyze(value));
    }
    fields
}

// ============================================================
// MemoryIndex
// ============================================================

struct Document {
    seq: u64,
    fields: Fields,
}

#[derive(Default)]
struct IndexState {
    docs: HashMap<String, Document>,
    next_seq: u64,
}

/// In-process index, safe for concurrent use
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

enum Compiled {
    Query(BooleanQuery),
    All(Vec<Compiled>),
}

impl Compiled {
    fn build(query: &IndexQuery) -> Result<Self, IndexError> {
        match query {
            IndexQuery::QueryString(text) => query_string::parse(text)
                .map(Compiled::Query)
                .map_err(|reason| IndexError::Parse {
                    query: text.clone(),
                    reason,
                }),
            IndexQuery::Conjunction(parts) => parts
                .iter()
                .map(Compiled::build)
                .collect::<Result<Vec<_>, _>>()
                .map(Compiled::All),
        }
    }

    fn score(&self, fields: &Fields) -> Option<u32> {
        match self {
            Compiled::Query(q) => query_string::score(q, fields),
            Compiled::All(parts) => parts
                .iter()
                .try_fold(0, |acc, part| part.score(fields).map(|s| acc + s)),
        }
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn index(&self, id: &str, record: &LogRecord) -> Result<(), IndexError> {
        let fields = document_fields(record);
        let mut state = self.write();

        let seq = match state.docs.get(id) {
            Some(existing) => existing.seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        state.docs.insert(id.to_string(), Document { seq, fields });
        Ok(())
    }

    async fn search(
        &self,
        query: &IndexQuery,
        from: usize,
        size: usize,
    ) -> Result<SearchResults, IndexError> {
        let compiled = Compiled::build(query)?;
        let state = self.read();

        let mut matched: Vec<(u32, u64, &String)> = state
            .docs
            .iter()
            .filter_map(|(id, doc)| compiled.score(&doc.fields).map(|s| (s, doc.seq, id)))
            .collect();

        matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let total = matched.len();
        let hits = matched
            .into_iter()
            .skip(from)
            .take(size)
            .map(|(score, _, id)| Hit {
                id: id.clone(),
                score,
            })
            .collect();

        Ok(SearchResults { total, hits })
    }

    async fn doc_count(&self) -> Result<u64, IndexError> {
        Ok(self.read().docs.len() as u64)
    }
}
