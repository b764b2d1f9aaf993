//! JWT authentication
//!
//! HS256 tokens whose `sub` claim is the actor and whose `perms` claim lists
//! the granted permissions.

use super::{AuthContext, AuthError, AuthMethod, Permissions};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (actor)
    pub sub: String,

    pub iss: String,

    pub aud: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Not before (Unix timestamp)
    pub nbf: i64,

    pub jti: String,

    /// Permissions (comma-separated: ingest,read,operate)
    #[serde(default)]
    pub perms: String,
}

/// JWT validator and issuer
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
}

impl JwtValidator {
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        }
    }

    /// Issue a new JWT token
    pub fn issue(
        &self,
        actor: &str,
        permissions: &Permissions,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now + ttl;

        let claims = Claims {
            sub: actor.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            perms: permissions.to_list(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::InvalidJwt(e.to_string()))
    }

    /// Validate a JWT token and return auth context
    pub fn validate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidJwt(e.to_string()),
            }
        })?;

        let claims = token_data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidJwt("empty subject".to_string()));
        }

        Ok(AuthContext {
            actor: claims.sub,
            permissions: Permissions::parse_list(&claims.perms),
            method: AuthMethod::Jwt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_validator() -> JwtValidator {
        JwtValidator::new(
            b"test-secret-key-for-testing-only",
            "booking-ingest",
            "booking-ingest-api",
        )
    }

    #[test]
    fn test_issue_and_validate() {
        let validator = create_validator();
        let token = validator
            .issue("storefront", &Permissions::producer(), Duration::hours(1))
            .unwrap();

        let context = validator.validate(&token).unwrap();
        assert_eq!(context.actor, "storefront");
        assert_eq!(context.method, AuthMethod::Jwt);
        assert!(context.can_ingest());
        assert!(!context.can_read());
        assert!(!context.can_operate());
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let issuer = create_validator();
        let other = JwtValidator::new(
            b"test-secret-key-for-testing-only",
            "booking-ingest",
            "someone-else",
        );
        let token = issuer
            .issue("ops", &Permissions::operator(), Duration::hours(1))
            .unwrap();

        assert!(matches!(other.validate(&token), Err(AuthError::InvalidJwt(_))));
    }

    #[test]
    fn test_expired_token() {
        let validator = create_validator();

        // Use -120 seconds to exceed the default 60-second leeway in jsonwebtoken
        let token = validator
            .issue("ops", &Permissions::read_only(), Duration::seconds(-120))
            .unwrap();

        let result = validator.validate(&token);
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }
}
