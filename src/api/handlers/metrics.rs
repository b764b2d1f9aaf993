//! Metrics handlers: queue depth, windowed processing, SLO gate, Prometheus.

use axum::extract::{Extension, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::auth_helpers::ensure_read;
use crate::api::error::ApiError;
use crate::api::extract::ApiQuery;
use crate::api::types::WindowQuery;
use crate::auth::AuthContextExt;
use crate::metrics::{metric_names, ProcessingMetrics, QueueMetrics, SloEvaluation};
use crate::server::AppState;

/// GET /metrics/queue
pub async fn queue_metrics(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
) -> Result<Json<QueueMetrics>, ApiError> {
    ensure_read(&auth)?;
    Ok(Json(state.aggregator.queue_metrics().await?))
}

/// GET /metrics/processing?windowMinutes=N
pub async fn processing_metrics(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiQuery(query): ApiQuery<WindowQuery>,
) -> Result<Json<ProcessingMetrics>, ApiError> {
    ensure_read(&auth)?;
    Ok(Json(
        state
            .aggregator
            .processing_metrics(query.window_minutes)
            .await?,
    ))
}

/// GET /metrics/slo?windowMinutes=N
pub async fn slo_evaluation(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiQuery(query): ApiQuery<WindowQuery>,
) -> Result<Json<SloEvaluation>, ApiError> {
    ensure_read(&auth)?;
    Ok(Json(
        state
            .aggregator
            .evaluate_slo(&state.slo, query.window_minutes)
            .await?,
    ))
}

/// GET /metrics/prometheus
pub async fn prometheus_metrics(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_read(&auth)?;

    // Gauges are refreshed on scrape.
    if let Ok(snapshot) = state.aggregator.queue_metrics().await {
        let gauges = [
            (metric_names::QUEUE_WAITING, snapshot.counts.waiting),
            (metric_names::QUEUE_ACTIVE, snapshot.counts.active),
            (metric_names::QUEUE_DELAYED, snapshot.counts.delayed),
            (metric_names::DEAD_LETTER_TOTAL, snapshot.dead_letter.total),
        ];
        for (name, value) in gauges {
            state.metrics.set_gauge(name, value).await;
        }
    }

    Ok((
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    ))
}
