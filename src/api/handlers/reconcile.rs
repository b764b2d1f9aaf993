//! Reconciliation handlers.

use axum::extract::{Extension, State};
use axum::Json;

use crate::api::auth_helpers::ensure_read;
use crate::api::error::{ApiError, ErrorCode};
use crate::auth::AuthContextExt;
use crate::reconcile::ReconciliationReport;
use crate::server::AppState;

/// POST /reconciliation - Run a reconciliation now.
///
/// Read-only: the report lists mismatches but nothing is corrected.
pub async fn run_reconciliation(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    ensure_read(&auth)?;
    Ok(Json(state.scheduler.run_now(&auth.actor).await?))
}

/// GET /reconciliation/latest - Most recent report from any run.
pub async fn latest_reconciliation(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    ensure_read(&auth)?;
    state.scheduler.latest().await.map(Json).ok_or_else(|| {
        ApiError::new(
            ErrorCode::ServiceUnavailable,
            "no reconciliation has completed yet",
        )
    })
}
