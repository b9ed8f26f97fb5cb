//! Token manager
//!
//! Opaque bearer tokens issued at registration: a random nonce plus an
//! HMAC-SHA-256 signature over agent id, nonce, and expiry, keyed by a
//! process-scoped secret. Tokens are validated (never consumed) per
//! request; revocation is immediate and global.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// One issued token.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token: String,
    pub agent_id: Uuid,
    /// Capability ids granted at issue time.
    pub permissions: HashSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl TokenRecord {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Why validation refused a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Unknown,
    BadSignature,
    Expired,
    Revoked,
    AgentMismatch,
}

/// Concurrent token store with HMAC-signed token material.
#[derive(Clone)]
pub struct TokenManager {
    secret: Arc<[u8; 32]>,
    tokens: Arc<RwLock<HashMap<String, TokenRecord>>>,
    expiry: ChronoDuration,
}

impl TokenManager {
    /// Create with a fresh process-scoped secret.
    pub fn new(expiry_minutes: u64) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            secret: Arc::new(secret),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            expiry: ChronoDuration::minutes(expiry_minutes as i64),
        }
    }

    /// Issue a token bound to an agent with a granted permission set.
    pub async fn issue(&self, agent_id: Uuid, permissions: HashSet<String>) -> TokenRecord {
        let issued_at = Utc::now();
        let expires_at = issued_at + self.expiry;
        let nonce = Uuid::new_v4().simple().to_string();
        let signature = self.sign(&agent_id, &nonce, expires_at.timestamp());
        let token = format!("{}.{}", nonce, signature);

        let record = TokenRecord {
            token: token.clone(),
            agent_id,
            permissions,
            issued_at,
            expires_at,
            revoked: false,
        };
        self.tokens.write().await.insert(token, record.clone());
        debug!(agent = %agent_id, expires = %expires_at, "token issued");
        record
    }

    /// Validate a presented token against the claimed agent id.
    ///
    /// The lookup is a constant-time hash-map probe; the signature check is
    /// the HMAC crate's constant-time verification, so forged and revoked
    /// tokens take the same path and time. The digest itself runs on the
    /// blocking pool to keep crypto off the I/O runtime.
    pub async fn validate(&self, token: &str, agent_id: &Uuid) -> Result<TokenRecord, TokenError> {
        let record = {
            let tokens = self.tokens.read().await;
            tokens.get(token).cloned().ok_or(TokenError::Unknown)?
        };
        let (nonce, signature) = token.split_once('.').ok_or(TokenError::BadSignature)?;
        let presented = hex_decode(signature).ok_or(TokenError::BadSignature)?;

        let secret = Arc::clone(&self.secret);
        let input = signing_input(&record.agent_id, nonce, record.expires_at.timestamp());
        let verified = tokio::task::spawn_blocking(move || {
            let mut mac = HmacSha256::new_from_slice(secret.as_ref()).expect("hmac key");
            mac.update(input.as_bytes());
            mac.verify_slice(&presented).is_ok()
        })
        .await
        .unwrap_or(false);
        if !verified {
            return Err(TokenError::BadSignature);
        }

        if record.revoked {
            return Err(TokenError::Revoked);
        }
        if Utc::now() >= record.expires_at {
            return Err(TokenError::Expired);
        }
        if record.agent_id != *agent_id {
            return Err(TokenError::AgentMismatch);
        }
        Ok(record)
    }

    /// Revoke one token. Immediate and global.
    pub async fn revoke(&self, token: &str) -> bool {
        match self.tokens.write().await.get_mut(token) {
            Some(record) => {
                record.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Revoke every token held by an agent.
    pub async fn revoke_agent(&self, agent_id: &Uuid) -> usize {
        let mut tokens = self.tokens.write().await;
        let mut revoked = 0;
        for record in tokens.values_mut() {
            if record.agent_id == *agent_id && !record.revoked {
                record.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }

    /// Drop expired and revoked records.
    pub async fn purge(&self) {
        let now = Utc::now();
        self.tokens
            .write()
            .await
            .retain(|_, record| record.is_valid_at(now));
    }

    fn sign(&self, agent_id: &Uuid, nonce: &str, expires_ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_ref()).expect("hmac key");
        mac.update(signing_input(agent_id, nonce, expires_ts).as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }
}

fn signing_input(agent_id: &Uuid, nonce: &str, expires_ts: i64) -> String {
    format!("{}:{}:{}", agent_id, nonce, expires_ts)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_issue_validate_round_trip() {
        let manager = TokenManager::new(60);
        let agent = Uuid::new_v4();
        let record = manager.issue(agent, perms(&["port.list"])).await;

        assert!(!record.token.is_empty());
        let minutes = (record.expires_at - record.issued_at).num_minutes();
        assert!((59..=61).contains(&minutes));

        let validated = manager.validate(&record.token, &agent).await.unwrap();
        assert_eq!(validated.agent_id, agent);
        assert!(validated.permissions.contains("port.list"));

        // Validation does not consume: a second check still passes.
        assert!(manager.validate(&record.token, &agent).await.is_ok());
    }

    #[tokio::test]
    async fn test_agent_mismatch() {
        let manager = TokenManager::new(60);
        let record = manager.issue(Uuid::new_v4(), perms(&[])).await;
        let other = Uuid::new_v4();
        assert_eq!(
            manager.validate(&record.token, &other).await.unwrap_err(),
            TokenError::AgentMismatch
        );
    }

    #[tokio::test]
    async fn test_revocation_immediate() {
        let manager = TokenManager::new(60);
        let agent = Uuid::new_v4();
        let record = manager.issue(agent, perms(&[])).await;

        assert!(manager.revoke(&record.token).await);
        assert_eq!(
            manager.validate(&record.token, &agent).await.unwrap_err(),
            TokenError::Revoked
        );
    }

    #[tokio::test]
    async fn test_revoke_agent_sweeps_all() {
        let manager = TokenManager::new(60);
        let agent = Uuid::new_v4();
        let t1 = manager.issue(agent, perms(&[])).await;
        let t2 = manager.issue(agent, perms(&[])).await;
        let bystander = manager.issue(Uuid::new_v4(), perms(&[])).await;

        assert_eq!(manager.revoke_agent(&agent).await, 2);
        assert!(manager.validate(&t1.token, &agent).await.is_err());
        assert!(manager.validate(&t2.token, &agent).await.is_err());
        assert!(manager
            .validate(&bystander.token, &bystander.agent_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_refused() {
        let manager = TokenManager::new(0);
        let agent = Uuid::new_v4();
        let record = manager.issue(agent, perms(&[])).await;
        assert_eq!(
            manager.validate(&record.token, &agent).await.unwrap_err(),
            TokenError::Expired
        );
    }

    #[tokio::test]
    async fn test_tampered_token_refused() {
        let manager = TokenManager::new(60);
        let agent = Uuid::new_v4();
        let record = manager.issue(agent, perms(&[])).await;

        // Unknown token string entirely.
        assert_eq!(
            manager.validate("deadbeef.cafe", &agent).await.unwrap_err(),
            TokenError::Unknown
        );

        // Same nonce, forged signature, smuggled into the store path by
        // tampering after the dot.
        let (nonce, _) = record.token.split_once('.').unwrap();
        let forged = format!("{}.{}", nonce, "ab".repeat(32));
        assert!(manager.validate(&forged, &agent).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_drops_dead_tokens() {
        let manager = TokenManager::new(60);
        let agent = Uuid::new_v4();
        let keep = manager.issue(agent, perms(&[])).await;
        let dead = manager.issue(agent, perms(&[])).await;
        manager.revoke(&dead.token).await;

        manager.purge().await;
        assert!(manager.validate(&keep.token, &agent).await.is_ok());
        assert_eq!(
            manager.validate(&dead.token, &agent).await.unwrap_err(),
            TokenError::Unknown
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = [0u8, 1, 127, 255];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes.to_vec());
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
