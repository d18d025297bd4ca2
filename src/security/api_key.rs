//! Bearer API keys for the external service API.
//!
//! Keys are `dbackup_` followed by 60 hex characters. Only a SHA-256 hash
//! and a non-secret display prefix are stored; the raw value exists once,
//! at generation time. Tokens without the prefix are rejected before any
//! storage lookup. Disabled and expired keys raise distinct error kinds
//! from "not found".

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Prefix every key starts with
pub const KEY_PREFIX: &str = "dbackup_";

/// Random hex characters after the prefix
const SECRET_HEX_LEN: usize = 60;

/// Length of the stored display prefix (prefix + 8 hex chars)
const DISPLAY_PREFIX_LEN: usize = KEY_PREFIX.len() + 8;

/// Stored API key metadata. The raw key value is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    /// Record id
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// SHA-256 hash of the full token
    pub key_hash: String,
    /// Non-secret prefix shown in listings ("dbackup_1a2b3c4d")
    pub display_prefix: String,
    /// User the key acts as
    pub user_id: String,
    /// Disabled keys fail validation without being deleted
    pub enabled: bool,
    /// Optional expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// When the key was created
    pub created_at: DateTime<Utc>,
    /// Last successful validation (updated fire-and-forget)
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Identity decoded from a valid key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyIdentity {
    /// Key record id
    pub key_id: Uuid,
    /// Key display name
    pub name: String,
    /// User the key acts as
    pub user_id: String,
}

/// Validation failures for keys that do exist
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApiKeyError {
    /// The key exists but was disabled
    #[error("API key is disabled")]
    Disabled,
    /// The key exists but its expiry has passed
    #[error("API key is expired")]
    Expired,
}

/// A freshly generated key. `token` is shown to the caller exactly once.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// Stored metadata
    pub record: ApiKeyRecord,
    /// The raw token; never persisted
    pub token: String,
}

/// API key issuance and validation
#[derive(Clone, Default)]
pub struct ApiKeyService {
    keys: Arc<DashMap<String, ApiKeyRecord>>,
}

impl ApiKeyService {
    /// Create an empty key service
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new key for `user_id`
    pub fn generate(
        &self,
        name: impl Into<String>,
        user_id: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> GeneratedKey {
        let mut secret = [0u8; SECRET_HEX_LEN / 2];
        rand::thread_rng().fill_bytes(&mut secret);
        let mut token = String::with_capacity(KEY_PREFIX.len() + SECRET_HEX_LEN);
        token.push_str(KEY_PREFIX);
        for byte in secret {
            let _ = write!(token, "{:02x}", byte);
        }

        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            key_hash: hash_token(&token),
            display_prefix: token[..DISPLAY_PREFIX_LEN].to_string(),
            user_id: user_id.into(),
            enabled: true,
            expires_at,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.keys.insert(record.key_hash.clone(), record.clone());
        debug!(key = %record.display_prefix, "API key generated");

        GeneratedKey { record, token }
    }

    /// Validate a bearer token.
    ///
    /// - wrong prefix or unknown key: `Ok(None)`, and the wrong-prefix
    ///   case short-circuits before any storage lookup
    /// - disabled / expired: the matching [`ApiKeyError`]
    /// - valid: the decoded identity; the last-used timestamp updates as
    ///   a detached task the caller never waits on
    pub async fn validate(
        &self,
        token: &str,
    ) -> std::result::Result<Option<ApiKeyIdentity>, ApiKeyError> {
        if !token.starts_with(KEY_PREFIX) {
            return Ok(None);
        }
        let hash = hash_token(token);
        let record = match self.keys.get(&hash) {
            Some(record) => record.clone(),
            None => return Ok(None),
        };

        if !record.enabled {
            return Err(ApiKeyError::Disabled);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= Utc::now() {
                return Err(ApiKeyError::Expired);
            }
        }

        let keys = Arc::clone(&self.keys);
        tokio::spawn(async move {
            if let Some(mut record) = keys.get_mut(&hash) {
                record.last_used_at = Some(Utc::now());
            }
        });

        Ok(Some(ApiKeyIdentity {
            key_id: record.id,
            name: record.name,
            user_id: record.user_id,
        }))
    }

    /// Enable or disable a key
    pub fn set_enabled(&self, key_id: Uuid, enabled: bool) -> bool {
        for mut record in self.keys.iter_mut() {
            if record.id == key_id {
                record.enabled = enabled;
                return true;
            }
        }
        false
    }

    /// Remove a key outright
    pub fn revoke(&self, key_id: Uuid) -> bool {
        let hash = self
            .keys
            .iter()
            .find(|r| r.id == key_id)
            .map(|r| r.key_hash.clone());
        match hash {
            Some(hash) => self.keys.remove(&hash).is_some(),
            None => false,
        }
    }

    /// All key records, newest first
    pub fn list(&self) -> Vec<ApiKeyRecord> {
        let mut all: Vec<ApiKeyRecord> = self.keys.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_generated_token_shape() {
        let service = ApiKeyService::new();
        let generated = service.generate("ci", "user-1", None);

        assert!(generated.token.starts_with(KEY_PREFIX));
        assert_eq!(generated.token.len(), KEY_PREFIX.len() + SECRET_HEX_LEN);
        assert!(generated.record.display_prefix.starts_with(KEY_PREFIX));
        // the stored record never contains the raw token
        assert_ne!(generated.record.key_hash, generated.token);
        assert!(!generated.token.contains(&generated.record.key_hash));
    }

    #[tokio::test]
    async fn test_wrong_prefix_returns_none_without_lookup() {
        let service = ApiKeyService::new();
        service.generate("ci", "user-1", None);

        assert_eq!(service.validate("Bearer something").await, Ok(None));
        assert_eq!(service.validate("dbackupX_0000").await, Ok(None));
    }

    #[tokio::test]
    async fn test_valid_token_decodes_identity() {
        let service = ApiKeyService::new();
        let generated = service.generate("ci", "user-1", None);

        let identity = service.validate(&generated.token).await.unwrap().unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.key_id, generated.record.id);
    }

    #[tokio::test]
    async fn test_disabled_and_expired_are_distinct_errors() {
        let service = ApiKeyService::new();
        let disabled = service.generate("a", "user-1", None);
        service.set_enabled(disabled.record.id, false);
        assert_eq!(
            service.validate(&disabled.token).await,
            Err(ApiKeyError::Disabled)
        );

        let expired = service.generate("b", "user-1", Some(Utc::now() - Duration::minutes(1)));
        assert_eq!(
            service.validate(&expired.token).await,
            Err(ApiKeyError::Expired)
        );

        // unknown-but-well-formed is Ok(None), not an error
        let revoked = service.generate("c", "user-1", None);
        assert!(service.revoke(revoked.record.id));
        assert_eq!(service.validate(&revoked.token).await, Ok(None));
    }
}
