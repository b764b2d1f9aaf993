//! Authentication middleware for Axum
//!
//! Resolves the bearer credential into an [`AuthContext`], applies the
//! per-actor rate limit and stores the context in request extensions.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use super::{ApiKeyValidator, AuthContext, AuthError, JwtValidator, API_KEY_PREFIX};
use crate::api::ApiError;

/// Combined authenticator supporting both API keys and JWT
pub struct Authenticator {
    api_key_validator: Arc<ApiKeyValidator>,
    jwt_validator: Option<Arc<JwtValidator>>,
}

impl Authenticator {
    pub fn new(api_key_validator: Arc<ApiKeyValidator>) -> Self {
        Self {
            api_key_validator,
            jwt_validator: None,
        }
    }

    pub fn with_jwt(mut self, jwt_validator: Arc<JwtValidator>) -> Self {
        self.jwt_validator = Some(jwt_validator);
        self
    }

    /// Authenticate a request from its `authorization` header
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<AuthContext, AuthError> {
        let header = auth_header.ok_or(AuthError::MissingAuth)?;

        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            // API keys may also be sent as bearer tokens
            if token.starts_with(API_KEY_PREFIX) {
                return self.api_key_validator.validate(token);
            }
            if let Some(jwt) = &self.jwt_validator {
                return jwt.validate(token);
            }
            return Err(AuthError::InvalidJwt("JWT not configured".to_string()));
        }

        if let Some(key) = header.strip_prefix("ApiKey ") {
            return self.api_key_validator.validate(key.trim());
        }

        if header.starts_with(API_KEY_PREFIX) {
            return self.api_key_validator.validate(header);
        }

        Err(AuthError::MissingAuth)
    }
}

/// Auth context extension for request
#[derive(Clone)]
pub struct AuthContextExt(pub AuthContext);

/// Authentication middleware configuration/state.
#[derive(Clone)]
pub struct AuthMiddlewareState {
    pub authenticator: Arc<Authenticator>,
    /// If false, every request runs as the local operator (dev mode).
    pub require_auth: bool,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

pub async fn auth_middleware(
    State(state): State<AuthMiddlewareState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let context = if state.require_auth {
        let auth_header = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match state.authenticator.authenticate(auth_header) {
            Ok(context) => context,
            Err(e) => {
                tracing::debug!(error = %e, "Authentication failed");
                return ApiError::from(e).into_response();
            }
        }
    } else {
        AuthContext::local_operator()
    };

    if let Some(ref limiter) = state.rate_limiter {
        if let Err(e) = limiter.check(&format!("actor:{}", context.actor)) {
            tracing::warn!(actor = %context.actor, "Rate limit exceeded");
            return ApiError::from(e).into_response();
        }
    }

    request.extensions_mut().insert(AuthContextExt(context));
    next.run(request).await
}

/// Fixed-window rate limiter keyed by actor
pub struct RateLimiter {
    requests_per_minute: u32,
    counts: RwLock<HashMap<String, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Check if request is allowed
    pub fn check(&self, key: &str) -> Result<(), AuthError> {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let entry = counts.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(entry.1).as_secs() >= 60 {
            *entry = (0, now);
        }

        if entry.0 >= self.requests_per_minute {
            return Err(AuthError::RateLimited);
        }

        entry.0 += 1;
        Ok(())
    }

    /// Get remaining requests for a key
    pub fn remaining(&self, key: &str) -> u32 {
        let counts = self.counts.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        match counts.get(key) {
            Some((count, started)) => {
                if now.duration_since(*started).as_secs() >= 60 {
                    self.requests_per_minute
                } else {
                    self.requests_per_minute.saturating_sub(*count)
                }
            }
            None => self.requests_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyRecord, AuthMethod, Permissions};
    use chrono::Duration;

    fn authenticator() -> (Authenticator, String, String) {
        let keys = Arc::new(ApiKeyValidator::new());
        let (key, _) = ApiKeyValidator::generate_key();
        keys.register_key(ApiKeyRecord::new(&key, "storefront", Permissions::producer()));

        let jwt = Arc::new(JwtValidator::new(b"secret", "booking-ingest", "booking-ingest-api"));
        let token = jwt
            .issue("ops", &Permissions::operator(), Duration::hours(1))
            .unwrap();

        (Authenticator::new(keys).with_jwt(jwt), key, token)
    }

    #[test]
    fn test_authenticate_credential_forms() {
        let (auth, key, token) = authenticator();

        let ctx = auth.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(ctx.actor, "ops");
        assert_eq!(ctx.method, AuthMethod::Jwt);

        let ctx = auth.authenticate(Some(&format!("Bearer {key}"))).unwrap();
        assert_eq!(ctx.actor, "storefront");

        let ctx = auth.authenticate(Some(&format!("ApiKey {key}"))).unwrap();
        assert_eq!(ctx.method, AuthMethod::ApiKey);

        assert!(auth.authenticate(Some(&key)).is_ok());
        assert!(matches!(auth.authenticate(None), Err(AuthError::MissingAuth)));
        assert!(matches!(
            auth.authenticate(Some("Basic abc")),
            Err(AuthError::MissingAuth)
        ));
        assert!(matches!(
            auth.authenticate(Some("Bearer not-a-jwt")),
            Err(AuthError::InvalidJwt(_))
        ));
    }

    #[test]
    fn test_rate_limiter() {
        let limiter = RateLimiter::new(5);
        let key = "actor:storefront";

        for _ in 0..5 {
            assert!(limiter.check(key).is_ok());
        }

        assert!(matches!(limiter.check(key), Err(AuthError::RateLimited)));
        assert!(limiter.check("actor:other").is_ok());
    }

    #[test]
    fn test_remaining_requests() {
        let limiter = RateLimiter::new(10);
        let key = "actor:ops";

        assert_eq!(limiter.remaining(key), 10);
        limiter.check(key).unwrap();
        assert_eq!(limiter.remaining(key), 9);
    }
}
