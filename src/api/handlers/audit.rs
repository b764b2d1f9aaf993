//! Audit log query handler.

use axum::extract::{Extension, State};
use axum::Json;
use serde::Serialize;

use crate::api::auth_helpers::ensure_read;
use crate::api::error::ApiError;
use crate::api::extract::ApiQuery;
use crate::api::types::AuditEventsQuery;
use crate::auth::AuthContextExt;
use crate::domain::{AuditEvent, AuditEventType, AuditQuery};
use crate::server::AppState;

pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 1_000;

#[derive(Debug, Serialize)]
pub struct AuditEventsResponse {
    pub events: Vec<AuditEvent>,
    pub count: usize,
}

/// GET /audit/events?limit=N[&actor=][&eventType=][&subjectId=]
///
/// Newest first.
pub async fn list_audit_events(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiQuery(query): ApiQuery<AuditEventsQuery>,
) -> Result<Json<AuditEventsResponse>, ApiError> {
    ensure_read(&auth)?;

    let query = AuditQuery {
        actor: query.actor.filter(|a| !a.is_empty()),
        event_type: query
            .event_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(AuditEventType::parse),
        subject_id: query.subject_id.filter(|s| !s.is_empty()),
        limit: query
            .limit
            .unwrap_or(DEFAULT_AUDIT_LIMIT)
            .clamp(1, MAX_AUDIT_LIMIT),
    };

    let events = state.audit.query(&query).await?;
    Ok(Json(AuditEventsResponse {
        count: events.len(),
        events,
    }))
}
