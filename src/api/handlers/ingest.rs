//! Booking event ingestion handlers.

use axum::body::Bytes;
use axum::extract::{Extension, OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::Json;
use tracing::{info, warn};

use crate::api::auth_helpers::{ensure_ingest, ensure_operate, ensure_read};
use crate::api::error::ApiError;
use crate::api::extract::{ApiJson, ApiPath};
use crate::api::utils::parse_event_id;
use crate::auth::signature::SignedRequest;
use crate::auth::AuthContextExt;
use crate::dead_letter::ReplayReceipt;
use crate::ingest::{EventView, ForceFailReceipt, ForceFailRequest, IngestReceipt};
use crate::metrics::metric_names;
use crate::server::AppState;

/// POST {ingestPath} - Accept a signed booking event.
///
/// The signature covers the raw body, so the body is read as bytes and only
/// parsed after it verifies.
pub async fn ingest_booking(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReceipt>), ApiError> {
    ensure_ingest(&auth)?;

    let signed = SignedRequest::from_headers(method.as_str(), uri.path(), &headers, &body)?;
    if let Err(e) = state.verifier.verify(&signed).await {
        state
            .metrics
            .inc_counter(metric_names::SIGNATURE_FAILURES)
            .await;
        warn!(actor = %auth.actor, error = %e, "Rejected ingest signature");
        return Err(e.into());
    }

    let receipt = state
        .ingest
        .accept_raw(&auth.actor, signed.idempotency_key, &body)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// GET {ingestPath}/:event_id - Event with its dead-letter entry, if any.
pub async fn get_booking_event(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiPath(event_id): ApiPath<String>,
) -> Result<Json<EventView>, ApiError> {
    ensure_read(&auth)?;
    let event_id = parse_event_id(&event_id)?;
    Ok(Json(state.ingest.get_event(event_id).await?))
}

/// POST {ingestPath}/:event_id/fail - Force an event into the dead-letter queue.
pub async fn fail_booking_event(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiPath(event_id): ApiPath<String>,
    ApiJson(request): ApiJson<ForceFailRequest>,
) -> Result<(StatusCode, Json<ForceFailReceipt>), ApiError> {
    ensure_operate(&auth)?;
    let event_id = parse_event_id(&event_id)?;

    let receipt = state
        .ingest
        .force_fail(event_id, &auth.actor, request)
        .await?;
    info!(
        %event_id,
        dead_letter_key = %receipt.dead_letter_key,
        actor = %auth.actor,
        "Event force-failed"
    );

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// POST {ingestPath}/:event_id/replay - Replay a READY dead-letter entry.
pub async fn replay_booking_event(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    ApiPath(event_id): ApiPath<String>,
) -> Result<(StatusCode, Json<ReplayReceipt>), ApiError> {
    ensure_operate(&auth)?;
    let event_id = parse_event_id(&event_id)?;

    let receipt = state.replay.replay(event_id, &auth.actor).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
