//! REST routes for the ingestion core.

use axum::routing::{get, patch, post};
use axum::Router;

use crate::api::handlers::*;
use crate::server::AppState;

/// Build the authenticated router, mounted by the server under the API base path.
///
/// `ingest_path` is the collection route for booking events, e.g. `/ingest/bookings`.
pub fn router(ingest_path: &str) -> Router<AppState> {
    Router::new()
        .route(ingest_path, post(ingest_booking))
        .route(&format!("{ingest_path}/:event_id"), get(get_booking_event))
        .route(
            &format!("{ingest_path}/:event_id/fail"),
            post(fail_booking_event),
        )
        .route(
            &format!("{ingest_path}/:event_id/replay"),
            post(replay_booking_event),
        )
        // Dead-letter queue
        .route("/dead-letter", get(list_dead_letters))
        .route("/dead-letter/:key", get(get_dead_letter))
        .route(
            "/dead-letter/:key/status/:status",
            patch(transition_dead_letter),
        )
        // Metrics
        .route("/metrics/queue", get(queue_metrics))
        .route("/metrics/processing", get(processing_metrics))
        .route("/metrics/slo", get(slo_evaluation))
        .route("/metrics/prometheus", get(prometheus_metrics))
        // Reconciliation
        .route("/reconciliation", post(run_reconciliation))
        .route("/reconciliation/latest", get(latest_reconciliation))
        // Audit
        .route("/audit/events", get(list_audit_events))
}

/// Unauthenticated health checks, mounted outside the base path.
pub fn health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
}
