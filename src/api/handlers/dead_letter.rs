//! Dead-letter queue handlers.

use axum::extract::{Extension, State};
use axum::Json;
use serde::Serialize;

use crate::api::auth_helpers::{ensure_operate, ensure_read};
use crate::api::error::ApiError;
use crate::api::extract::{ApiPath, ApiQuery};
use crate::api::types::{DeadLetterListQuery, TransitionQuery};
use crate::api::utils::parse_dead_letter_status;
use crate::auth::AuthContextExt;
use crate::domain::DeadLetterEntry;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub entries: Vec<DeadLetterEntry>,
    pub count: usize,
}

/// GET /dead-letter?status=&limit=
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiQuery(query): ApiQuery<DeadLetterListQuery>,
) -> Result<Json<DeadLetterListResponse>, ApiError> {
    ensure_read(&auth)?;
    let status = query
        .status
        .as_deref()
        .map(|s| parse_dead_letter_status("status", s))
        .transpose()?;

    let entries = state.dead_letters.list(status, query.limit).await?;
    Ok(Json(DeadLetterListResponse {
        count: entries.len(),
        entries,
    }))
}

/// GET /dead-letter/:key
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiPath(key): ApiPath<String>,
) -> Result<Json<DeadLetterEntry>, ApiError> {
    ensure_read(&auth)?;
    Ok(Json(state.dead_letters.get(&key).await?))
}

/// PATCH /dead-letter/:key/status/:status[?expected=STATUS]
pub async fn transition_dead_letter(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiPath((key, status)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<TransitionQuery>,
) -> Result<Json<DeadLetterEntry>, ApiError> {
    ensure_operate(&auth)?;
    let to = parse_dead_letter_status("status", &status)?;
    let expected = query
        .expected
        .as_deref()
        .map(|s| parse_dead_letter_status("expected", s))
        .transpose()?;

    let entry = state
        .dead_letters
        .operator_transition(&key, to, expected, &auth.actor)
        .await?;
    Ok(Json(entry))
}
