//! REST API integration tests for the booking ingestion core.
//!
//! Each test drives the full router over in-memory storage with auth
//! disabled, so requests act as the local operator.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use booking_ingest::auth::signature::{
    sign, HEADER_IDEMPOTENCY_KEY, HEADER_NONCE, HEADER_SIGNATURE, HEADER_SIGNATURE_ALGORITHM,
    HEADER_TIMESTAMP,
};
use booking_ingest::auth::LOCAL_OPERATOR_ACTOR;

use common::*;

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

// ============================================================================
// End-to-end lifecycle
// ============================================================================

#[tokio::test]
async fn test_smoke_submit_fail_ready_replay() {
    let app = TestApp::new();

    let (status, receipt) = app
        .submit("smoke-key-1", &booking_payload("SMOKE-1", "CREATED"))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{receipt}");
    assert_eq!(receipt["idempotentReplay"], false);
    assert_eq!(receipt["processedInline"], true);
    assert_eq!(receipt["queued"], false);
    assert_eq!(receipt["processStatus"], "DONE");
    let event_id = receipt["eventId"].as_str().unwrap().to_string();

    let (status, event) = app.get(&event_path(&event_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["processStatus"], "DONE");
    assert_eq!(event["idempotencyKey"], "smoke-key-1");
    assert!(event["deadLetter"].is_null());

    let (status, failed) = app
        .post_json(
            &format!("{}/fail", event_path(&event_id)),
            json!({
                "reasonCode": "SMOKE_FAILURE",
                "reasonDetail": "forced by smoke test",
                "poisonMessage": false
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{failed}");
    let key = failed["deadLetterKey"].as_str().unwrap().to_string();
    assert!(key.starts_with("dlq_"));

    let (_, event) = app.get(&event_path(&event_id)).await;
    assert_eq!(event["processStatus"], "DEAD_LETTER");
    assert_eq!(event["deadLetter"]["status"], "OPEN");
    assert_eq!(event["deadLetter"]["reasonCode"], "SMOKE_FAILURE");

    let (status, entry) = app
        .patch(&format!("/api/v1/dead-letter/{key}/status/READY"))
        .await;
    assert_eq!(status, StatusCode::OK, "{entry}");
    assert_eq!(entry["status"], "READY");

    let (status, replay) = app
        .post_empty(&format!("{}/replay", event_path(&event_id)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{replay}");
    assert_eq!(replay["processedInline"], true);
    assert_eq!(replay["alreadySucceeded"], false);
    assert_eq!(replay["inFlight"], false);

    let (status, entry) = app.get(&format!("/api/v1/dead-letter/{key}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["status"], "SUCCEEDED");

    let (_, event) = app.get(&event_path(&event_id)).await;
    assert_eq!(event["processStatus"], "DONE");

    let (status, audit) = app
        .get(&format!(
            "/api/v1/audit/events?limit=50&actor={LOCAL_OPERATOR_ACTOR}"
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = audit["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["eventType"].as_str().unwrap())
        .collect();
    for expected in [
        "INGEST_EVENT_MARKED_FAILED",
        "INGEST_DEAD_LETTER_STATUS_UPDATED",
        "INGEST_REPLAY_REQUESTED",
    ] {
        assert!(types.contains(&expected), "missing {expected} in {types:?}");
    }
}

#[tokio::test]
async fn test_replaying_succeeded_entry_is_noop() {
    let app = TestApp::new();
    let (_, receipt) = app
        .submit("noop-key", &booking_payload("NOOP-1", "CREATED"))
        .await;
    let event_id = receipt["eventId"].as_str().unwrap().to_string();

    let (_, failed) = app
        .post_json(
            &format!("{}/fail", event_path(&event_id)),
            json!({ "reasonCode": "MANUAL" }),
        )
        .await;
    let key = failed["deadLetterKey"].as_str().unwrap().to_string();
    app.patch(&format!("/api/v1/dead-letter/{key}/status/READY"))
        .await;
    let (status, _) = app
        .post_empty(&format!("{}/replay", event_path(&event_id)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, again) = app
        .post_empty(&format!("{}/replay", event_path(&event_id)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(again["alreadySucceeded"], true);

    // A resolved entry cannot be failed again.
    let (status, body) = app
        .post_json(
            &format!("{}/fail", event_path(&event_id)),
            json!({ "reasonCode": "MANUAL" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "DEAD_LETTER_RESOLVED");
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_duplicate_submission_returns_same_event() {
    let app = TestApp::new();
    let body = booking_payload("DUP-1", "CREATED");

    let (status, first) = app.submit("dup-key", &body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, second) = app.submit("dup-key", &body).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    assert_eq!(first["eventId"], second["eventId"]);
    assert_eq!(first["idempotentReplay"], false);
    assert_eq!(second["idempotentReplay"], true);
    assert_eq!(second["processedInline"], false);
    assert_eq!(app.domain.applied_count().await, 1);
}

// ============================================================================
// Signature verification
// ============================================================================

#[tokio::test]
async fn test_tampered_body_is_rejected() {
    let app = TestApp::new();
    let original = serde_json::to_vec(&booking_payload("SIG-1", "CREATED")).unwrap();
    let headers = sign_headers(INGEST_ROUTE, "sig-key", &original);

    let tampered = serde_json::to_vec(&booking_payload("SIG-2", "CREATED")).unwrap();
    let (status, body) = app
        .send(request_with_headers(INGEST_ROUTE, "sig-key", &headers, tampered))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "SIGNATURE_INVALID");
}

#[tokio::test]
async fn test_reused_nonce_is_rejected() {
    let app = TestApp::new();
    let bytes = serde_json::to_vec(&booking_payload("NONCE-1", "CREATED")).unwrap();
    let headers = sign_headers(INGEST_ROUTE, "nonce-key", &bytes);

    let (status, _) = app
        .send(request_with_headers(
            INGEST_ROUTE,
            "nonce-key",
            &headers,
            bytes.clone(),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = app
        .send(request_with_headers(INGEST_ROUTE, "nonce-key", &headers, bytes))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "NONCE_REPLAY");
}

#[tokio::test]
async fn test_stale_timestamp_is_rejected() {
    let app = TestApp::new();
    let bytes = serde_json::to_vec(&booking_payload("SKEW-1", "CREATED")).unwrap();
    let timestamp = (Utc::now() - Duration::hours(1)).to_rfc3339();
    let signature = sign(
        TEST_SECRET.as_bytes(),
        "POST",
        INGEST_ROUTE,
        &timestamp,
        "nonce-skew",
        "skew-key",
        &bytes,
    )
    .unwrap();
    let headers = SignedHeaders {
        signature,
        timestamp,
        nonce: "nonce-skew".to_string(),
    };

    let (status, body) = app
        .send(request_with_headers(INGEST_ROUTE, "skew-key", &headers, bytes))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "TIMESTAMP_SKEW");
}

#[tokio::test]
async fn test_missing_signature_header() {
    let app = TestApp::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri(INGEST_ROUTE)
        .header(HEADER_SIGNATURE_ALGORITHM, "HMAC-SHA256")
        .header(HEADER_TIMESTAMP, Utc::now().to_rfc3339())
        .header(HEADER_NONCE, "n-1")
        .header(HEADER_IDEMPOTENCY_KEY, "k-1")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "MISSING_HEADER");
}

#[tokio::test]
async fn test_unsupported_signature_algorithm() {
    let app = TestApp::new();
    let bytes = serde_json::to_vec(&booking_payload("ALG-1", "CREATED")).unwrap();
    let headers = sign_headers(INGEST_ROUTE, "alg-key", &bytes);
    let request = Request::builder()
        .method(Method::POST)
        .uri(INGEST_ROUTE)
        .header(HEADER_SIGNATURE, &headers.signature)
        .header(HEADER_SIGNATURE_ALGORITHM, "HMAC-SHA1")
        .header(HEADER_TIMESTAMP, &headers.timestamp)
        .header(HEADER_NONCE, &headers.nonce)
        .header(HEADER_IDEMPOTENCY_KEY, "alg-key")
        .body(Body::from(bytes))
        .unwrap();

    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "UNSUPPORTED_SIGNATURE_ALGORITHM");
}

// ============================================================================
// Payload validation and error bodies
// ============================================================================

#[tokio::test]
async fn test_unsupported_payload_version() {
    let app = TestApp::new();
    let mut body = booking_payload("VER-1", "CREATED");
    body["payloadVersion"] = json!("v2");

    let (status, body) = app.submit("ver-key", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "UNSUPPORTED_PAYLOAD_VERSION");
    assert!(body["error"]["numericCode"].is_number());
}

#[tokio::test]
async fn test_schema_violation_is_validation_failed() {
    let app = TestApp::new();
    let mut body = booking_payload("BAD-1", "CREATED");
    body["booking"]["currency"] = json!("euro");

    let (status, body) = app.submit("bad-key", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_unknown_event_is_not_found() {
    let app = TestApp::new();
    let (status, body) = app
        .get(&event_path("00000000-0000-0000-0000-000000000000"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "EVENT_NOT_FOUND");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(event_path("not-a-uuid"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("x-error-code").unwrap(),
        "VALIDATION_FAILED"
    );
}

#[tokio::test]
async fn test_malformed_fail_body_has_error_code() {
    let app = TestApp::new();
    let (_, receipt) = app
        .submit("malformed-fail", &booking_payload("MALFORMED-1", "CREATED"))
        .await;
    let event_id = receipt["eventId"].as_str().unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("{}/fail", event_path(event_id)))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "reasonDetail": "x" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("x-error-code").unwrap(),
        "VALIDATION_FAILED"
    );

    let (status, body) = app
        .post_json(&format!("{}/fail", event_path(event_id)), json!("not an object"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "VALIDATION_FAILED");

    let (_, event) = app.get(&event_path(event_id)).await;
    assert!(event["deadLetter"].is_null());
}

#[tokio::test]
async fn test_malformed_query_has_error_code() {
    let app = TestApp::new();

    for path in [
        "/api/v1/metrics/processing?windowMinutes=abc",
        "/api/v1/metrics/slo?windowMinutes=ten",
        "/api/v1/dead-letter?limit=lots",
        "/api/v1/audit/events?limit=1.5",
    ] {
        let (status, body) = app.get(path).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path}: {body}");
        assert_eq!(error_code(&body), "VALIDATION_FAILED", "{path}");
        assert_eq!(body["error"]["numericCode"], 3001, "{path}");
    }
}

// ============================================================================
// Metrics, reconciliation and health checks
// ============================================================================

#[tokio::test]
async fn test_metrics_endpoints() {
    let app = TestApp::new();
    for i in 0..3 {
        app.submit(
            &format!("metrics-key-{i}"),
            &booking_payload(&format!("MET-{i}"), "CREATED"),
        )
        .await;
    }

    let (status, queue) = app.get("/api/v1/metrics/queue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["enabled"], false);
    assert_eq!(queue["healthy"], true);

    let (status, processing) = app
        .get("/api/v1/metrics/processing?windowMinutes=30")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(processing["windowMinutes"], 30);
    assert_eq!(processing["totals"]["received"], 3);
    assert_eq!(processing["totals"]["done"], 3);
    assert_eq!(processing["successRate"], 1.0);
    assert_eq!(processing["latency"]["sampleCount"], 3);

    let (status, slo) = app.get("/api/v1/metrics/slo").await;
    assert_eq!(status, StatusCode::OK);
    // Default policy needs more traffic than this.
    assert_eq!(slo["skipped"], true);

    let (status, body) = app.get("/api/v1/metrics/processing?windowMinutes=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, text) = app.get("/api/v1/metrics/prometheus").await;
    assert_eq!(status, StatusCode::OK);
    let text = text.as_str().unwrap();
    assert!(text.contains("booking_ingest_events_received "), "{text}");
}

#[tokio::test]
async fn test_reconciliation_report() {
    let app = TestApp::new();

    let (status, body) = app.get("/api/v1/reconciliation/latest").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(&body), "SERVICE_UNAVAILABLE");

    app.submit("recon-key", &booking_payload("RECON-1", "CREATED"))
        .await;

    let (status, _) = app.get("/api/v1/reconciliation").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    let (status, body) = app.get("/api/v1/reconciliation/latest").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");

    let (status, report) = app.post_empty("/api/v1/reconciliation").await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["passed"], true);
    assert_eq!(report["eventsScanned"], 1);
    assert_eq!(report["domains"].as_array().unwrap().len(), 4);

    let (status, latest) = app.get("/api/v1/reconciliation/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["runId"], report["runId"]);
}

#[tokio::test]
async fn test_health_and_ready() {
    let app = TestApp::new();

    let (status, health) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "booking-ingest");

    let (status, ready) = app.get("/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["status"], "healthy");
}

#[tokio::test]
async fn test_queued_ingest_reports_queue_depth() {
    let app = TestApp::with_vars(&[("QUEUE_ENABLED", "true")]);

    let (status, receipt) = app
        .submit("queued-key", &booking_payload("Q-1", "CREATED"))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(receipt["queued"], true);
    assert_eq!(receipt["processedInline"], false);
    assert_eq!(receipt["processStatus"], "PENDING");

    let (_, queue) = app.get("/api/v1/metrics/queue").await;
    assert_eq!(queue["enabled"], true);
    assert_eq!(queue["waiting"], 1);

    let workers = app.app.workers.clone().unwrap();
    assert!(workers.run_once("test-worker").await.unwrap());

    let event_id = receipt["eventId"].as_str().unwrap();
    let (_, event) = app.get(&event_path(event_id)).await;
    assert_eq!(event["processStatus"], "DONE");
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_auth_required_rejects_anonymous() {
    let app = TestApp::with_vars(&[
        ("AUTH_MODE", "required"),
        ("BOOTSTRAP_API_KEY", "bk_test_bootstrap_key_0123456789"),
    ]);

    let (status, body) = app.get("/api/v1/dead-letter").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "AUTH_REQUIRED");

    let (status, body) = app
        .send(
            Request::builder()
                .uri("/api/v1/dead-letter")
                .header(
                    "authorization",
                    "Bearer bk_test_bootstrap_key_0123456789",
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["count"], 0);

    // Health checks stay open.
    let (status, _) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
}
