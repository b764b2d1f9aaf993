//! API key authentication
//!
//! Keys are formatted as `bk_<random>` and only their SHA-256 hash is kept.

use super::{AuthContext, AuthError, AuthMethod, Permissions};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// API key prefix
pub const API_KEY_PREFIX: &str = "bk_";

/// Registered API key
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    /// Hash of the API key (never store plaintext)
    pub key_hash: String,

    /// Actor requests with this key are attributed to
    pub actor: String,

    pub permissions: Permissions,

    pub active: bool,
}

impl ApiKeyRecord {
    pub fn new(plaintext_key: &str, actor: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            key_hash: ApiKeyValidator::hash_key(plaintext_key),
            actor: actor.into(),
            permissions,
            active: true,
        }
    }
}

/// In-process API key registry
pub struct ApiKeyValidator {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyValidator {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a new API key
    ///
    /// Returns (plaintext_key, key_hash)
    pub fn generate_key() -> (String, String) {
        use rand::Rng;
        let random_bytes: [u8; 24] = rand::thread_rng().gen();
        let random_part = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        );

        let plaintext_key = format!("{}{}", API_KEY_PREFIX, random_part);
        let key_hash = Self::hash_key(&plaintext_key);
        (plaintext_key, key_hash)
    }

    /// Hash an API key for storage
    pub fn hash_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn register_key(&self, record: ApiKeyRecord) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(record.key_hash.clone(), record);
    }

    /// Validate an API key and return auth context
    pub fn validate(&self, key: &str) -> Result<AuthContext, AuthError> {
        if !key.starts_with(API_KEY_PREFIX) {
            return Err(AuthError::InvalidApiKey);
        }

        let key_hash = Self::hash_key(key);
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let record = keys.get(&key_hash).ok_or(AuthError::InvalidApiKey)?;

        if !record.active {
            return Err(AuthError::InvalidApiKey);
        }

        Ok(AuthContext {
            actor: record.actor.clone(),
            permissions: record.permissions.clone(),
            method: AuthMethod::ApiKey,
        })
    }

    pub fn revoke(&self, key_hash: &str) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = keys.get_mut(key_hash) {
            record.active = false;
        }
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ApiKeyValidator {
    fn default() -> Self {
        Self::new()
    }
}
