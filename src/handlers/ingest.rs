use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use super::AppState;
use crate::error::AppError;

/// Handle POST /ingest
///
/// The body is decoded by the gateway rather than axum's `Json` extractor
/// so malformed payloads get the same 400 shape as every other error.
pub async fn ingest_log(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let record = state.gateway.ingest(&body).await?;

    tracing::debug!(level = %record.level, labels = record.labels.len(), "Log accepted");

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}
