//! HMAC request signatures
//!
//! Producers sign
//!
//! ```text
//! METHOD\nPATH\nTIMESTAMP\nNONCE\nIDEMPOTENCY_KEY\nhex(SHA256(BODY))
//! ```
//!
//! with HMAC-SHA256 under the shared service secret. Verification checks the
//! signature, then the timestamp skew, then records the nonce. A nonce is
//! remembered for twice the skew tolerance so any request that could still
//! pass the skew check cannot be replayed.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::infra::{IngestError, NonceStore};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";

pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_SIGNATURE_ALGORITHM: &str = "x-signature-algorithm";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_IDEMPOTENCY_KEY: &str = "x-idempotency-key";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("signature mismatch")]
    SignatureInvalid,

    #[error("timestamp outside tolerance ({skew_ms}ms skew)")]
    TimestampSkew { skew_ms: i64 },

    #[error("nonce already used")]
    NonceReplay,

    #[error("invalid signing key")]
    InvalidKey,

    #[error("nonce store error: {0}")]
    Store(#[from] IngestError),
}

#[derive(Clone)]
pub struct SignatureConfig {
    pub secret: Vec<u8>,
    pub skew_tolerance: Duration,
}

impl std::fmt::Debug for SignatureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureConfig")
            .field("secret", &"<redacted>")
            .field("skew_tolerance", &self.skew_tolerance)
            .finish()
    }
}

/// Largest accepted skew tolerance
pub const MAX_SKEW_TOLERANCE: Duration = Duration::from_secs(24 * 60 * 60);

impl SignatureConfig {
    pub fn new(secret: impl Into<Vec<u8>>, skew_tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            skew_tolerance,
        }
    }

    /// How long an accepted nonce is remembered
    pub fn nonce_ttl(&self) -> Duration {
        self.skew_tolerance
            .checked_mul(2)
            .unwrap_or(MAX_SKEW_TOLERANCE * 2)
    }

    fn skew_tolerance_ms(&self) -> i64 {
        i64::try_from(self.skew_tolerance.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Signed request fields as they arrived on the wire
#[derive(Debug, Clone)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub timestamp: &'a str,
    pub nonce: &'a str,
    pub idempotency_key: &'a str,
    pub body: &'a [u8],
    pub signature: &'a str,
    pub algorithm: &'a str,
}

impl<'a> SignedRequest<'a> {
    /// Pull the signature headers out of a request
    pub fn from_headers(
        method: &'a str,
        path: &'a str,
        headers: &'a HeaderMap,
        body: &'a [u8],
    ) -> Result<Self, SignatureError> {
        Ok(Self {
            method,
            path,
            timestamp: header(headers, HEADER_TIMESTAMP)?,
            nonce: header(headers, HEADER_NONCE)?,
            idempotency_key: header(headers, HEADER_IDEMPOTENCY_KEY)?,
            body,
            signature: header(headers, HEADER_SIGNATURE)?,
            algorithm: header(headers, HEADER_SIGNATURE_ALGORITHM)?,
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::MissingHeader(name))
}

/// Canonical string covered by the signature
pub fn canonical_string(
    method: &str,
    path: &str,
    timestamp: &str,
    nonce: &str,
    idempotency_key: &str,
    body: &[u8],
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        timestamp,
        nonce,
        idempotency_key,
        hex::encode(Sha256::digest(body))
    )
}

/// Hex-encoded HMAC-SHA256 of the canonical string
pub fn sign(
    secret: &[u8],
    method: &str,
    path: &str,
    timestamp: &str,
    nonce: &str,
    idempotency_key: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    let mac = mac_bytes(
        secret,
        &canonical_string(method, path, timestamp, nonce, idempotency_key, body),
    )?;
    Ok(hex::encode(mac))
}

fn mac_bytes(secret: &[u8], message: &str) -> Result<Vec<u8>, SignatureError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Decode a hex or base64 signature
fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    if signature.len() == 64 && signature.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(signature).ok();
    }
    base64::engine::general_purpose::STANDARD
        .decode(signature)
        .ok()
        .or_else(|| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(signature).ok())
}

pub struct SignatureVerifier {
    config: SignatureConfig,
    nonces: Arc<dyn NonceStore>,
}

impl SignatureVerifier {
    pub fn new(config: SignatureConfig, nonces: Arc<dyn NonceStore>) -> Self {
        Self { config, nonces }
    }

    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    pub async fn verify(&self, request: &SignedRequest<'_>) -> Result<(), SignatureError> {
        self.verify_at(request, Utc::now()).await
    }

    /// Verify against an explicit clock
    pub async fn verify_at(
        &self,
        request: &SignedRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        if !request.algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
            return Err(SignatureError::UnsupportedAlgorithm(
                request.algorithm.to_string(),
            ));
        }

        let timestamp = DateTime::parse_from_rfc3339(request.timestamp)
            .map_err(|e| SignatureError::InvalidTimestamp(e.to_string()))?
            .with_timezone(&Utc);

        let expected = mac_bytes(
            &self.config.secret,
            &canonical_string(
                request.method,
                request.path,
                request.timestamp,
                request.nonce,
                request.idempotency_key,
                request.body,
            ),
        )?;
        let provided = decode_signature(request.signature).ok_or(SignatureError::SignatureInvalid)?;
        if !constant_time_eq::constant_time_eq(&expected, &provided) {
            return Err(SignatureError::SignatureInvalid);
        }

        let skew_ms = (now - timestamp).num_milliseconds().saturating_abs();
        if skew_ms > self.config.skew_tolerance_ms() {
            return Err(SignatureError::TimestampSkew { skew_ms });
        }

        let ttl = chrono::Duration::from_std(self.config.nonce_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        if !self.nonces.check_and_record(request.nonce, now + ttl).await? {
            return Err(SignatureError::NonceReplay);
        }

        Ok(())
    }
}
