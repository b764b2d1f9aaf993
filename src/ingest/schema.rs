//! Payload validation for the ingest endpoint
//!
//! The request body is checked against the built-in v1 JSON Schema before it
//! is deserialized, so field-level problems come back as a list rather than
//! the first serde error.

use std::fmt;

use jsonschema::Validator;
use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::{BookingEventPayload, PAYLOAD_VERSION_V1};

/// How strictly the v1 schema is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaValidationMode {
    /// Only deserialization errors reject a payload
    Disabled,
    /// Validate and log violations, but accept the payload if it deserializes
    WarnOnly,
    /// Reject payloads that violate the schema
    #[default]
    Enforce,
}

impl SchemaValidationMode {
    /// Parse from environment variable value
    pub fn from_env_value(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "disabled" | "off" | "none" | "false" | "0" => Ok(Self::Disabled),
            "warn" | "warnonly" | "warn_only" | "warning" => Ok(Self::WarnOnly),
            "enforce" | "on" | "true" | "1" | "" => Ok(Self::Enforce),
            other => Err(format!(
                "Invalid schema validation mode: '{}'. Expected: disabled, warn, or enforce",
                other
            )),
        }
    }

    pub fn should_validate(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn should_reject_on_failure(&self) -> bool {
        matches!(self, Self::Enforce)
    }
}

impl fmt::Display for SchemaValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::WarnOnly => write!(f, "warn_only"),
            Self::Enforce => write!(f, "enforce"),
        }
    }
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(String),

    #[error("payload failed validation ({} errors)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("payload could not be decoded: {0}")]
    Decode(String),

    #[error("invalid payload schema: {0}")]
    Schema(String),
}

/// JSON Schema for `payloadVersion = "v1"` bodies
pub fn booking_event_schema_v1() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": [
            "payloadVersion", "eventType", "eventTime", "source",
            "externalBookingRef", "customer", "booking"
        ],
        "properties": {
            "payloadVersion": { "const": PAYLOAD_VERSION_V1 },
            "eventType": { "enum": ["CREATED", "UPDATED", "CANCELLED"] },
            "eventTime": { "type": "string", "minLength": 1 },
            "source": { "type": "string", "minLength": 1, "maxLength": 64 },
            "externalBookingRef": { "type": "string", "minLength": 1, "maxLength": 128 },
            "customer": {
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": { "type": "string", "minLength": 1 },
                    "email": { "type": ["string", "null"] },
                    "phone": { "type": ["string", "null"] }
                }
            },
            "booking": {
                "type": "object",
                "required": ["tourDate", "adult", "currency", "totalPrice"],
                "properties": {
                    "tourDate": { "type": "string", "pattern": "^\\d{4}-\\d{2}-\\d{2}$" },
                    "tourTime": { "type": ["string", "null"] },
                    "adult": { "type": "integer", "minimum": 0 },
                    "child": { "type": "integer", "minimum": 0 },
                    "currency": { "type": "string", "pattern": "^[A-Z]{3}$" },
                    "totalPrice": { "type": "number", "minimum": 0 },
                    "pickupLocation": { "type": ["string", "null"] },
                    "meetingPoint": { "type": ["string", "null"] },
                    "note": { "type": ["string", "null"] }
                }
            },
            "raw": {
                "type": "object",
                "properties": {
                    "providerPayload": {}
                }
            }
        }
    })
}

/// Validates and decodes ingest request bodies
pub struct PayloadValidator {
    validator: Validator,
    mode: SchemaValidationMode,
}

impl PayloadValidator {
    pub fn new(mode: SchemaValidationMode) -> Result<Self, PayloadError> {
        let validator = Validator::new(&booking_event_schema_v1())
            .map_err(|e| PayloadError::Schema(format!("Failed to compile schema: {}", e)))?;
        Ok(Self { validator, mode })
    }

    pub fn mode(&self) -> SchemaValidationMode {
        self.mode
    }

    /// Decode a raw body into a v1 payload
    pub fn parse(&self, body: &[u8]) -> Result<BookingEventPayload, PayloadError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        self.parse_value(value)
    }

    pub fn parse_value(&self, value: Value) -> Result<BookingEventPayload, PayloadError> {
        if !value.is_object() {
            return Err(PayloadError::InvalidJson("expected a JSON object".to_string()));
        }

        match value.get("payloadVersion") {
            Some(Value::String(v)) if v == PAYLOAD_VERSION_V1 => {}
            Some(Value::String(v)) => return Err(PayloadError::UnsupportedVersion(v.clone())),
            Some(other) => return Err(PayloadError::UnsupportedVersion(other.to_string())),
            None => {
                return Err(PayloadError::Validation(vec![FieldError {
                    path: "/payloadVersion".to_string(),
                    message: "payloadVersion is required".to_string(),
                }]))
            }
        }

        if self.mode.should_validate() {
            let errors: Vec<FieldError> = self
                .validator
                .iter_errors(&value)
                .map(|e| FieldError {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect();

            if !errors.is_empty() {
                if self.mode.should_reject_on_failure() {
                    return Err(PayloadError::Validation(errors));
                }
                tracing::warn!(
                    errors = errors.len(),
                    first = %errors[0].message,
                    "Payload failed schema validation (warn-only)"
                );
            }
        }

        serde_json::from_value(value).map_err(|e| PayloadError::Decode(e.to_string()))
    }
}
