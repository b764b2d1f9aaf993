//! Authorization helper functions for REST API handlers.

use crate::api::error::{forbidden, ApiError};
use crate::auth::AuthContext;

/// Ensure the caller may submit booking events.
pub fn ensure_ingest(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.can_ingest() {
        return Err(forbidden("ingest permission required"));
    }
    Ok(())
}

/// Ensure the caller may read events, dead letters, metrics and audit.
pub fn ensure_read(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.can_read() {
        return Err(forbidden("read permission required"));
    }
    Ok(())
}

/// Ensure the caller may fail, replay or transition.
pub fn ensure_operate(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.can_operate() {
        return Err(forbidden("operate permission required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::auth::Permissions;

    fn context(permissions: Permissions) -> AuthContext {
        AuthContext {
            actor: "partner-a".to_string(),
            permissions,
            method: crate::auth::AuthMethod::ApiKey,
        }
    }

    #[test]
    fn test_producer_cannot_operate() {
        let auth = context(Permissions::producer());
        assert!(ensure_ingest(&auth).is_ok());
        let err = ensure_operate(&auth).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientPermissions);
    }

    #[test]
    fn test_local_operator_can_do_everything() {
        let auth = AuthContext::local_operator();
        assert!(ensure_ingest(&auth).is_ok());
        assert!(ensure_read(&auth).is_ok());
        assert!(ensure_operate(&auth).is_ok());
    }
}
