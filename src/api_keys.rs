//! Inbound API keys: issue, store as salted hashes, verify in constant
//! time. Keys look like `btr-<32 base62 chars>`; only the salted hash and
//! the trailing 8 characters ever touch the database.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::constants::{API_KEY_PREFIX, API_KEY_RANDOM_LEN};
use crate::db;
use crate::error::ProxyError;
use crate::store::now_millis;

/// Iterated-SHA-256 rounds for key derivation. Issued keys carry ~190 bits
/// of entropy, so the round count guards against bulk hashing of leaked
/// rows rather than dictionary attacks; it also runs on every request.
const HASH_ITERATIONS: u32 = 10_000;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum KeyRole {
    Admin,
    ApiOnly,
}

impl KeyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyRole::Admin => "admin",
            KeyRole::ApiOnly => "api-only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(KeyRole::Admin),
            "api-only" => Some(KeyRole::ApiOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub hashed_key: String,
    pub prefix_last_8: String,
    pub role: KeyRole,
    pub is_active: bool,
    pub usage_count: i64,
    pub last_used: Option<u64>,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

fn derive(salt: &[u8], key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(key.as_bytes());
    let mut digest: [u8; 32] = hasher.finalize().into();
    for _ in 1..HASH_ITERATIONS {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        digest = hasher.finalize().into();
    }
    digest
}

/// `salt:hash`, both base64url without padding.
pub fn hash_key(key: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill(&mut salt);
    let digest = derive(&salt, key);
    format!(
        "{}:{}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(digest)
    )
}

/// Constant-time verification. A malformed or length-mismatched stored hash
/// still burns the full derivation before returning false.
pub fn verify_key(stored: &str, presented: &str) -> bool {
    let (salt_part, hash_part) = stored.split_once(':').unwrap_or(("", ""));
    let salt = URL_SAFE_NO_PAD.decode(salt_part).unwrap_or_default();
    let expected = URL_SAFE_NO_PAD.decode(hash_part).unwrap_or_default();

    let computed = derive(&salt, presented);
    if expected.len() != computed.len() {
        // Keep timing independent of the stored value's shape
        let _ = computed.ct_eq(&computed);
        return false;
    }
    computed.ct_eq(&expected).into()
}

fn generate_plaintext_key() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(API_KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{API_KEY_PREFIX}{suffix}")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct ApiKeyStore;

impl ApiKeyStore {
    pub fn new() -> Self {
        Self
    }

    /// Issue a new key. The plaintext is returned exactly once.
    pub async fn create(&self, name: &str, role: KeyRole) -> Result<(ApiKey, String), ProxyError> {
        let plaintext = generate_plaintext_key();
        let hashed = hash_key(&plaintext);
        let prefix_last_8: String = plaintext
            .chars()
            .rev()
            .take(8)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            hashed_key: hashed,
            prefix_last_8,
            role,
            is_active: true,
            usage_count: 0,
            last_used: None,
            created_at: now_millis(),
        };

        let conn = db::get_conn().await?;
        conn.execute(
            r#"INSERT INTO api_keys (id, name, hashed_key, prefix_last_8, role, is_active, usage_count, created_at)
               VALUES (?, ?, ?, ?, ?, 1, 0, ?)"#,
            (
                key.id.as_str(),
                key.name.as_str(),
                key.hashed_key.as_str(),
                key.prefix_last_8.as_str(),
                key.role.as_str(),
                key.created_at as i64,
            ),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create api key: {e}")))?;

        Ok((key, plaintext))
    }

    pub async fn list(&self) -> Result<Vec<ApiKey>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, hashed_key, prefix_last_8, role, is_active, usage_count, last_used, created_at FROM api_keys ORDER BY created_at",
                (),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to list api keys: {e}")))?;

        let mut keys = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let Ok(id) = row.get::<String>(0) else {
                continue;
            };
            let role = row
                .get::<String>(4)
                .ok()
                .and_then(|r| KeyRole::parse(&r))
                .unwrap_or(KeyRole::ApiOnly);
            keys.push(ApiKey {
                id,
                name: row.get(1).unwrap_or_default(),
                hashed_key: row.get(2).unwrap_or_default(),
                prefix_last_8: row.get(3).unwrap_or_default(),
                role,
                is_active: row.get::<i64>(5).unwrap_or(0) != 0,
                usage_count: row.get::<i64>(6).unwrap_or(0),
                last_used: row.get::<Option<i64>>(7).ok().flatten().map(|v| v as u64),
                created_at: row.get::<i64>(8).unwrap_or(0) as u64,
            });
        }
        Ok(keys)
    }

    pub async fn active_keys(&self) -> Result<Vec<ApiKey>, ProxyError> {
        Ok(self.list().await?.into_iter().filter(|k| k.is_active).collect())
    }

    /// Verify a presented key against every active key's salted hash.
    /// First match wins.
    pub async fn validate(&self, presented: &str) -> Result<Option<ApiKey>, ProxyError> {
        let keys = self.active_keys().await?;
        Ok(keys
            .into_iter()
            .find(|k| verify_key(&k.hashed_key, presented)))
    }

    /// Refuses to remove the last active admin key while non-admin keys
    /// exist, which would lock the dashboard out.
    pub async fn delete(&self, name: &str) -> Result<bool, ProxyError> {
        self.guard_last_admin(name).await?;
        let conn = db::get_conn().await?;
        let affected = conn
            .execute("DELETE FROM api_keys WHERE name = ?", [name])
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to delete api key: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, ProxyError> {
        if !enabled {
            self.guard_last_admin(name).await?;
        }
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE api_keys SET is_active = ? WHERE name = ?",
                (enabled as i64, name),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to toggle api key: {e}")))?;
        Ok(affected > 0)
    }

    async fn guard_last_admin(&self, name: &str) -> Result<(), ProxyError> {
        let keys = self.active_keys().await?;
        let target_is_admin = keys
            .iter()
            .any(|k| k.name == name && k.role == KeyRole::Admin);
        if !target_is_admin {
            return Ok(());
        }
        let admin_count = keys.iter().filter(|k| k.role == KeyRole::Admin).count();
        let has_non_admin = keys.iter().any(|k| k.role != KeyRole::Admin);
        if admin_count == 1 && has_non_admin {
            return Err(ProxyError::Validation(
                "cannot remove the last active admin key while other keys exist".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_key_format() {
        let key = generate_plaintext_key();
        assert!(key.starts_with("btr-"));
        assert_eq!(key.len(), 4 + 32);
        assert!(key[4..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_hash_verify_round_trip() {
        let key = generate_plaintext_key();
        let stored = hash_key(&key);
        assert!(stored.contains(':'));
        assert!(verify_key(&stored, &key));
        assert!(!verify_key(&stored, "btr-wrong"));
    }

    #[test]
    fn test_per_key_salt_differs() {
        let stored_a = hash_key("btr-same");
        let stored_b = hash_key("btr-same");
        assert_ne!(stored_a, stored_b);
        assert!(verify_key(&stored_a, "btr-same"));
        assert!(verify_key(&stored_b, "btr-same"));
    }

    #[test]
    fn test_verify_tolerates_malformed_stored_hash() {
        assert!(!verify_key("", "btr-anything"));
        assert!(!verify_key("no-colon-here", "btr-anything"));
        assert!(!verify_key("salt:short", "btr-anything"));
    }
}
