//! Authentication and authorization for the ingestion API
//!
//! Callers authenticate with a bearer credential and, on the ingest route,
//! additionally sign the request body.
//!
//! # Authentication Methods
//!
//! - **API Keys**: `bk_`-prefixed keys, SHA-256 hashed at rest
//! - **JWT Tokens**: HS256 tokens whose `sub` claim names the actor
//! - **Request signatures**: HMAC-SHA256 over the canonical request, with
//!   timestamp skew and nonce replay checks (see [`signature`])
//!
//! # Authorization Model
//!
//! - `ingest`: submit booking events
//! - `read`: query events, dead letters, metrics, reconciliation and audit
//! - `operate`: force-fail, replay and dead-letter transitions
//!
//! # Configuration
//!
//! - `AUTH_MODE`: `required` (default) or `disabled` for development
//! - `BOOTSTRAP_API_KEY`: initial operator key
//! - `JWT_SECRET`: HMAC secret for JWT validation

mod api_key;
mod jwt;
mod middleware;
pub mod signature;

pub use api_key::*;
pub use jwt::*;
pub use middleware::*;
pub use signature::{SignatureConfig, SignatureError, SignatureVerifier, SIGNATURE_ALGORITHM};

use serde::Serialize;

/// Actor used when authentication is disabled
pub const LOCAL_OPERATOR_ACTOR: &str = "local:operator";

/// How the caller authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Disabled,
}

/// Authentication context extracted from request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Actor every audit event for this request is attributed to
    pub actor: String,

    /// Allowed operations
    pub permissions: Permissions,

    pub method: AuthMethod,
}

/// Permission flags for operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Can submit events
    pub ingest: bool,

    /// Can read events, dead letters and reports
    pub read: bool,

    /// Can force-fail, replay and move dead letters
    pub operate: bool,
}

impl Permissions {
    pub fn producer() -> Self {
        Self {
            ingest: true,
            read: false,
            operate: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            ingest: false,
            read: true,
            operate: false,
        }
    }

    pub fn operator() -> Self {
        Self {
            ingest: true,
            read: true,
            operate: true,
        }
    }

    /// Parse a comma-separated list such as `ingest,read`
    pub fn parse_list(list: &str) -> Self {
        let mut perms = Self::default();
        for item in list.split(',').map(str::trim) {
            match item {
                "ingest" => perms.ingest = true,
                "read" => perms.read = true,
                "operate" => perms.operate = true,
                _ => {}
            }
        }
        perms
    }

    pub fn to_list(&self) -> String {
        let mut perms = Vec::new();
        if self.ingest {
            perms.push("ingest");
        }
        if self.read {
            perms.push("read");
        }
        if self.operate {
            perms.push("operate");
        }
        perms.join(",")
    }
}

impl AuthContext {
    /// Context used for every request when `AUTH_MODE=disabled`
    pub fn local_operator() -> Self {
        Self {
            actor: LOCAL_OPERATOR_ACTOR.to_string(),
            permissions: Permissions::operator(),
            method: AuthMethod::Disabled,
        }
    }

    pub fn can_ingest(&self) -> bool {
        self.permissions.ingest
    }

    pub fn can_read(&self) -> bool {
        self.permissions.read
    }

    pub fn can_operate(&self) -> bool {
        self.permissions.operate
    }
}

/// Authentication error
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication")]
    MissingAuth,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("invalid JWT: {0}")]
    InvalidJwt(String),

    #[error("token expired")]
    TokenExpired,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("rate limit exceeded")]
    RateLimited,
}
