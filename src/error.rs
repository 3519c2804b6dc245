use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::ingest::IngestError;
use crate::search::SearchError;
use crate::tail::TailError;

/// HTTP-facing error
///
/// Server errors carry a fixed, opaque message; the underlying cause is
/// logged where the error is converted.
#[derive(Debug)]
pub enum AppError {
    /// Malformed request (bad JSON, missing query)
    BadRequest(String),
    /// Internal failure with an opaque message
    Internal(&'static str),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Malformed(e) => Self::BadRequest(e.to_string()),
            IngestError::Publish(e) => {
                tracing::error!(error = %e, "Ingest publish failed");
                Self::Internal("Failed to process log")
            }
        }
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Query(e) => Self::BadRequest(e.to_string()),
            SearchError::Index(e) => {
                tracing::error!(error = %e, "Search execution failed");
                Self::Internal("Failed to execute search")
            }
            e @ (SearchError::Resolve(_) | SearchError::Decode { .. }) => {
                tracing::error!(error = %e, "Search hit resolution failed");
                Self::Internal("Failed to retrieve full logs")
            }
        }
    }
}

impl From<TailError> for AppError {
    fn from(err: TailError) -> Self {
        tracing::error!(error = %err, "Tail subscription failed");
        Self::Internal("Failed to subscribe to logs")
    }
}
