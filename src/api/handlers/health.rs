//! Health check handlers
//!
//! `/health` is a liveness check and never touches storage. `/ready` pings
//! the event store and, when enabled, the job queue.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::CircuitState;
use crate::server::AppState;

/// Response for the basic health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Queue degraded, inline processing still works
    Degraded,
    /// Event store unreachable
    Unhealthy,
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Individual component status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub components: Vec<ComponentStatus>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        service: "booking-ingest",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /ready
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let mut components = Vec::with_capacity(2);

    let start = std::time::Instant::now();
    let store = state.events.ping().await;
    components.push(ComponentStatus {
        name: "event_store",
        status: if store.is_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
        message: store.err().map(|e| e.to_string()),
        response_time_ms: Some(start.elapsed().as_millis() as u64),
    });

    if let Some(queue) = state.dispatcher.queue() {
        let start = std::time::Instant::now();
        let ping = queue.ping().await;
        let circuit = state.dispatcher.circuit_state().await;
        let status = match (&ping, circuit) {
            (Ok(()), CircuitState::Closed) => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        };
        let message = match ping {
            Err(e) => Some(e.to_string()),
            Ok(()) if circuit != CircuitState::Closed => Some(format!("circuit {circuit:?}")),
            Ok(()) => None,
        };
        components.push(ComponentStatus {
            name: "job_queue",
            status,
            message,
            response_time_ms: Some(start.elapsed().as_millis() as u64),
        });
    }

    let overall = determine_overall_status(&components);
    let code = if overall.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(ReadinessResponse {
            status: overall,
            components,
        }),
    )
}

/// The worst component status wins
fn determine_overall_status(components: &[ComponentStatus]) -> HealthStatus {
    if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
