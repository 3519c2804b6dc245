//! Query translation and paginated search over the hot store

pub mod service;
pub mod translator;

pub use service::{Pagination, SearchError, SearchService, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use translator::{rewrite_fields, split_clauses, strip_outer_parentheses, translate, QueryError};
