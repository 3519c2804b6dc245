use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::AppState;
use crate::error::AppError;
use crate::search::Pagination;

/// Raw query parameters
///
/// `page` and `size` stay strings so unparseable values fall back to the
/// defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

/// Handle GET /search
pub async fn search_logs(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, AppError> {
    let pagination = Pagination::from_params(params.page.as_deref(), params.size.as_deref());
    let query = params.q.unwrap_or_default();

    let records = state.search.search(&query, pagination).await?;

    Ok(Json(records))
}
