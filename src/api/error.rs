//! Structured API error responses with error codes
//!
//! Every failure leaves the API as
//! `{"error":{"code","numericCode","message","details"?}}` with the code
//! repeated in an `x-error-code` header.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::signature::SignatureError;
use crate::auth::AuthError;
use crate::infra::IngestError;
use crate::ingest::{AcceptError, PayloadError};

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors (1xxx)
    /// No authentication credentials provided
    AuthRequired,
    /// Invalid bearer token or API key
    InvalidToken,
    /// Token has expired
    TokenExpired,
    /// Insufficient permissions for this operation
    InsufficientPermissions,

    // Rate limiting (2xxx)
    RateLimitExceeded,

    // Validation errors (3xxx)
    /// Payload failed schema validation
    ValidationFailed,
    /// Body is not JSON or could not be decoded
    InvalidRequestBody,
    UnsupportedPayloadVersion,
    /// A required request header is absent
    MissingHeader,
    InvalidTimestamp,
    UnsupportedSignatureAlgorithm,

    // Resource errors (4xxx)
    EventNotFound,
    DeadLetterNotFound,

    // Conflict errors (5xxx)
    /// Compare-and-swap on a status lost
    StatusConflict,
    /// Dead-letter entry already succeeded
    DeadLetterResolved,

    // Signature errors (6xxx)
    SignatureInvalid,
    TimestampSkew,
    NonceReplay,

    // State errors (7xxx)
    /// Transition not allowed by the dead-letter state machine
    InvalidTransition,
    /// Replay requested for an entry that is not READY
    ReplayNotReady,

    // Infrastructure errors (8xxx)
    /// Database operation failed
    DatabaseError,
    QueueUnavailable,
    /// External service unavailable
    ServiceUnavailable,
    /// Operation timed out
    Timeout,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            // Auth (1xxx)
            ErrorCode::AuthRequired => 1001,
            ErrorCode::InvalidToken => 1002,
            ErrorCode::TokenExpired => 1003,
            ErrorCode::InsufficientPermissions => 1004,

            // Rate limiting (2xxx)
            ErrorCode::RateLimitExceeded => 2001,

            // Validation (3xxx)
            ErrorCode::ValidationFailed => 3001,
            ErrorCode::InvalidRequestBody => 3002,
            ErrorCode::UnsupportedPayloadVersion => 3003,
            ErrorCode::MissingHeader => 3004,
            ErrorCode::InvalidTimestamp => 3005,
            ErrorCode::UnsupportedSignatureAlgorithm => 3006,

            // Resource (4xxx)
            ErrorCode::EventNotFound => 4001,
            ErrorCode::DeadLetterNotFound => 4002,

            // Conflict (5xxx)
            ErrorCode::StatusConflict => 5001,
            ErrorCode::DeadLetterResolved => 5002,

            // Signature (6xxx)
            ErrorCode::SignatureInvalid => 6001,
            ErrorCode::TimestampSkew => 6002,
            ErrorCode::NonceReplay => 6003,

            // State (7xxx)
            ErrorCode::InvalidTransition => 7001,
            ErrorCode::ReplayNotReady => 7002,

            // Infrastructure (8xxx)
            ErrorCode::DatabaseError => 8001,
            ErrorCode::QueueUnavailable => 8002,
            ErrorCode::ServiceUnavailable => 8003,
            ErrorCode::Timeout => 8004,
            ErrorCode::InternalError => 8999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired
            | ErrorCode::InvalidToken
            | ErrorCode::TokenExpired
            | ErrorCode::SignatureInvalid
            | ErrorCode::TimestampSkew
            | ErrorCode::NonceReplay => StatusCode::UNAUTHORIZED,
            ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,

            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,

            ErrorCode::ValidationFailed
            | ErrorCode::InvalidRequestBody
            | ErrorCode::UnsupportedPayloadVersion
            | ErrorCode::MissingHeader
            | ErrorCode::InvalidTimestamp
            | ErrorCode::UnsupportedSignatureAlgorithm => StatusCode::BAD_REQUEST,

            ErrorCode::EventNotFound | ErrorCode::DeadLetterNotFound => StatusCode::NOT_FOUND,

            ErrorCode::StatusConflict
            | ErrorCode::DeadLetterResolved
            | ErrorCode::ReplayNotReady => StatusCode::CONFLICT,

            ErrorCode::InvalidTransition => StatusCode::BAD_REQUEST,

            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::QueueUnavailable | ErrorCode::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::UnsupportedPayloadVersion => "UNSUPPORTED_PAYLOAD_VERSION",
            ErrorCode::MissingHeader => "MISSING_HEADER",
            ErrorCode::InvalidTimestamp => "INVALID_TIMESTAMP",
            ErrorCode::UnsupportedSignatureAlgorithm => "UNSUPPORTED_SIGNATURE_ALGORITHM",
            ErrorCode::EventNotFound => "EVENT_NOT_FOUND",
            ErrorCode::DeadLetterNotFound => "DEAD_LETTER_NOT_FOUND",
            ErrorCode::StatusConflict => "STATUS_CONFLICT",
            ErrorCode::DeadLetterResolved => "DEAD_LETTER_RESOLVED",
            ErrorCode::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorCode::TimestampSkew => "TIMESTAMP_SKEW",
            ErrorCode::NonceReplay => "NONCE_REPLAY",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::ReplayNotReady => "REPLAY_NOT_READY",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::QueueUnavailable => "QUEUE_UNAVAILABLE",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds until a rate-limited client may retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                retry_after: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.error.retry_after = Some(seconds);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.error.code.as_str();
        let mut response = (status, Json(self)).into_response();

        response.headers_mut().insert(
            axum::http::header::HeaderName::from_static("x-error-code"),
            axum::http::HeaderValue::from_static(code),
        );
        if status == StatusCode::TOO_MANY_REQUESTS {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from_static("60"),
            );
        }

        response
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                ApiError::new(ErrorCode::DatabaseError, "database error")
            }
            IngestError::EventNotFound(id) => {
                ApiError::new(ErrorCode::EventNotFound, format!("event not found: {}", id))
                    .with_details(serde_json::json!({ "eventId": id }))
            }
            IngestError::DeadLetterNotFound(key) => ApiError::new(
                ErrorCode::DeadLetterNotFound,
                format!("dead-letter entry not found: {}", key),
            )
            .with_details(serde_json::json!({ "deadLetterKey": key })),
            IngestError::EventStatusConflict {
                event_id,
                expected,
                actual,
            } => ApiError::new(
                ErrorCode::StatusConflict,
                format!(
                    "event {} status conflict: expected {}, found {}",
                    event_id, expected, actual
                ),
            )
            .with_details(serde_json::json!({
                "eventId": event_id,
                "expected": expected,
                "actual": actual,
            })),
            IngestError::DeadLetterStatusConflict {
                key,
                expected,
                actual,
            } => ApiError::new(
                ErrorCode::StatusConflict,
                format!(
                    "dead-letter {} status conflict: expected {}, found {}",
                    key, expected, actual
                ),
            )
            .with_details(serde_json::json!({
                "deadLetterKey": key,
                "expected": expected,
                "actual": actual,
            })),
            IngestError::InvalidTransition { key, from, to } => ApiError::new(
                ErrorCode::InvalidTransition,
                format!("invalid transition {} -> {}", from, to),
            )
            .with_details(serde_json::json!({
                "deadLetterKey": key,
                "from": from,
                "to": to,
            })),
            IngestError::ReplayNotReady { key, status } => ApiError::new(
                ErrorCode::ReplayNotReady,
                format!("dead-letter entry is {}, replay requires READY", status),
            )
            .with_details(serde_json::json!({
                "deadLetterKey": key,
                "status": status,
            })),
            IngestError::DeadLetterResolved(key) => ApiError::new(
                ErrorCode::DeadLetterResolved,
                format!("dead-letter entry already succeeded: {}", key),
            )
            .with_details(serde_json::json!({ "deadLetterKey": key })),
            IngestError::Validation(msg) => ApiError::new(ErrorCode::ValidationFailed, msg),
            IngestError::QueueUnavailable(msg) => ApiError::new(ErrorCode::QueueUnavailable, msg),
            IngestError::Timeout(msg) => ApiError::new(ErrorCode::Timeout, msg),
            IngestError::RateLimited => rate_limited(60),
            IngestError::Serialization(e) => {
                ApiError::new(ErrorCode::InternalError, format!("serialization error: {}", e))
            }
            IngestError::Configuration(msg) | IngestError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::new(ErrorCode::InternalError, msg)
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuth => {
                ApiError::new(ErrorCode::AuthRequired, "authentication required")
            }
            AuthError::InvalidApiKey => ApiError::new(ErrorCode::InvalidToken, "invalid API key"),
            AuthError::InvalidJwt(msg) => {
                ApiError::new(ErrorCode::InvalidToken, format!("invalid token: {}", msg))
            }
            AuthError::TokenExpired => ApiError::new(ErrorCode::TokenExpired, "token expired"),
            AuthError::InsufficientPermissions => forbidden("insufficient permissions"),
            AuthError::RateLimited => rate_limited(60),
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::MissingHeader(name) => {
                ApiError::new(ErrorCode::MissingHeader, format!("missing header: {}", name))
                    .with_details(serde_json::json!({ "header": name }))
            }
            SignatureError::UnsupportedAlgorithm(alg) => ApiError::new(
                ErrorCode::UnsupportedSignatureAlgorithm,
                format!("unsupported signature algorithm: {}", alg),
            ),
            SignatureError::InvalidTimestamp(ts) => {
                ApiError::new(ErrorCode::InvalidTimestamp, format!("invalid timestamp: {}", ts))
            }
            SignatureError::SignatureInvalid => {
                ApiError::new(ErrorCode::SignatureInvalid, "signature mismatch")
            }
            SignatureError::TimestampSkew { skew_ms } => ApiError::new(
                ErrorCode::TimestampSkew,
                "timestamp outside tolerance",
            )
            .with_details(serde_json::json!({ "skewMs": skew_ms })),
            SignatureError::NonceReplay => {
                ApiError::new(ErrorCode::NonceReplay, "nonce already used")
            }
            SignatureError::InvalidKey => internal_error("signature verifier misconfigured"),
            SignatureError::Store(e) => e.into(),
        }
    }
}

impl From<PayloadError> for ApiError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::InvalidJson(msg) => ApiError::new(
                ErrorCode::InvalidRequestBody,
                format!("request body is not valid JSON: {}", msg),
            ),
            PayloadError::UnsupportedVersion(v) => ApiError::new(
                ErrorCode::UnsupportedPayloadVersion,
                format!("unsupported payload version: {}", v),
            ),
            PayloadError::Validation(errors) => {
                ApiError::new(ErrorCode::ValidationFailed, "payload failed validation")
                    .with_details(serde_json::json!({ "errors": errors }))
            }
            PayloadError::Decode(msg) => ApiError::new(ErrorCode::InvalidRequestBody, msg),
            PayloadError::Schema(msg) => internal_error(format!("invalid payload schema: {}", msg)),
        }
    }
}

impl From<AcceptError> for ApiError {
    fn from(err: AcceptError) -> Self {
        match err {
            AcceptError::Payload(e) => e.into(),
            AcceptError::Ingest(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let code = match rejection {
            JsonRejection::JsonDataError(_) => ErrorCode::ValidationFailed,
            _ => ErrorCode::InvalidRequestBody,
        };
        ApiError::new(code, rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(ErrorCode::ValidationFailed, rejection.body_text())
            .with_details(serde_json::json!({ "field": "query" }))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        match rejection {
            PathRejection::MissingPathParams(e) => internal_error(e.body_text()),
            other => ApiError::new(ErrorCode::ValidationFailed, other.body_text())
                .with_details(serde_json::json!({ "field": "path" })),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::ValidationFailed, message.into())
        .with_details(serde_json::json!({ "field": field }))
}

pub fn rate_limited(retry_after_seconds: u64) -> ApiError {
    ApiError::new(ErrorCode::RateLimitExceeded, "rate limit exceeded")
        .with_retry_after(retry_after_seconds)
}

pub fn forbidden(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InsufficientPermissions, message.into())
}

pub fn internal_error(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InternalError, message.into())
}

// ============================================================================
// Tests
// ============================================================================
