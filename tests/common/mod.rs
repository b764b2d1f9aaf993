//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use booking_ingest::auth::signature::{
    sign, HEADER_IDEMPOTENCY_KEY, HEADER_NONCE, HEADER_SIGNATURE, HEADER_SIGNATURE_ALGORITHM,
    HEADER_TIMESTAMP,
};
use booking_ingest::auth::SIGNATURE_ALGORITHM;
use booking_ingest::config::AppConfig;
use booking_ingest::infra::memory::InMemoryBookingDomain;
use booking_ingest::server::{auth_state, build_app, build_router, App, Storage};

pub const TEST_SECRET: &str = "test-signing-secret";
pub const INGEST_ROUTE: &str = "/api/v1/ingest/bookings";

/// Environment for an in-memory app with auth disabled and inline processing.
pub fn base_vars() -> HashMap<String, String> {
    [
        ("AUTH_MODE", "disabled"),
        ("SIGNATURE_SECRET", TEST_SECRET),
        ("QUEUE_ENABLED", "false"),
        ("RETRY_MAX_ATTEMPTS", "3"),
        ("RETRY_INITIAL_DELAY_MS", "1"),
        ("RETRY_MAX_DELAY_MS", "5"),
        ("RETRY_JITTER", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn test_config(overrides: &[(&str, &str)]) -> AppConfig {
    let mut vars = base_vars();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_map(&vars).expect("test config")
}

/// A fully wired in-memory application behind its router.
pub struct TestApp {
    pub router: Router,
    pub app: App,
    pub domain: Arc<InMemoryBookingDomain>,
    pub config: AppConfig,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_vars(&[])
    }

    pub fn with_vars(overrides: &[(&str, &str)]) -> Self {
        let config = test_config(overrides);
        let domain = Arc::new(InMemoryBookingDomain::new());
        let mut storage = Storage::memory(config.ingest.queue_enabled);
        storage.domain = domain.clone();

        let app = build_app(&config, storage).expect("build app");
        let router = build_router(app.state.clone(), &config, auth_state(&config.auth))
            .expect("build router");

        Self {
            router,
            app,
            domain,
            config,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        send(&self.router, request).await
    }

    /// Sign and submit `body` under `idempotency_key`.
    pub async fn submit(&self, idempotency_key: &str, body: &Value) -> (StatusCode, Value) {
        let bytes = serde_json::to_vec(body).unwrap();
        self.send(signed_request(INGEST_ROUTE, idempotency_key, bytes))
            .await
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::GET)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_empty(&self, path: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn patch(&self, path: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::PATCH)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

/// Signature headers for a request, with a fresh nonce and the current time.
pub struct SignedHeaders {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

pub fn sign_headers(path: &str, idempotency_key: &str, body: &[u8]) -> SignedHeaders {
    let timestamp = Utc::now().to_rfc3339();
    let nonce = Uuid::new_v4().to_string();
    let signature = sign(
        TEST_SECRET.as_bytes(),
        "POST",
        path,
        &timestamp,
        &nonce,
        idempotency_key,
        body,
    )
    .unwrap();
    SignedHeaders {
        signature,
        timestamp,
        nonce,
    }
}

pub fn request_with_headers(
    path: &str,
    idempotency_key: &str,
    headers: &SignedHeaders,
    body: Vec<u8>,
) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json")
        .header(HEADER_SIGNATURE, &headers.signature)
        .header(HEADER_SIGNATURE_ALGORITHM, SIGNATURE_ALGORITHM)
        .header(HEADER_TIMESTAMP, &headers.timestamp)
        .header(HEADER_NONCE, &headers.nonce)
        .header(HEADER_IDEMPOTENCY_KEY, idempotency_key)
        .body(Body::from(body))
        .unwrap()
}

pub fn signed_request(path: &str, idempotency_key: &str, body: Vec<u8>) -> Request<Body> {
    let headers = sign_headers(path, idempotency_key, &body);
    request_with_headers(path, idempotency_key, &headers, body)
}

/// A valid v1 booking payload
pub fn booking_payload(booking_ref: &str, event_type: &str) -> Value {
    json!({
        "payloadVersion": "v1",
        "eventType": event_type,
        "eventTime": Utc::now().to_rfc3339(),
        "source": "storefront",
        "externalBookingRef": booking_ref,
        "customer": {
            "name": "Grace Hopper",
            "email": "grace@example.com",
            "phone": "+1-555-0100"
        },
        "booking": {
            "tourDate": "2026-11-02",
            "tourTime": "09:30",
            "adult": 2,
            "child": 1,
            "currency": "EUR",
            "totalPrice": 189.5,
            "pickupLocation": "Hotel Lobby",
            "meetingPoint": "Harbour Gate",
            "note": null
        },
        "raw": {
            "providerPayload": { "orderId": booking_ref }
        }
    })
}

pub fn event_path(event_id: &str) -> String {
    format!("{INGEST_ROUTE}/{event_id}")
}

pub fn random_key(prefix: &str) -> String {
    format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..12])
}
