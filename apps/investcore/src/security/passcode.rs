use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone)]
struct PasscodeRecord {
    salt: [u8; 16],
    hash: String,
    failed_attempts: u32,
    locked_until: Option<DateTime<Utc>>,
    session_token: Option<String>,
    session_expires_at: Option<DateTime<Utc>>,
}

/// Short-lived capability token proving a fresh passcode verify (§9 "fresh
/// passcode session as explicit capability"). Privileged operations (wallet
/// creation) depend on this type rather than on reading the PIN.
#[derive(Debug, Clone)]
pub struct PasscodeSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

fn hash_pin(pin: &str, salt: &[u8; 16]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait PasscodeStore: Send + Sync {
    async fn set(&self, user_id: Uuid, pin: &str) -> Result<(), CoreError>;

    /// On success, issues a `PasscodeSession` valid for 10 minutes. After 5
    /// consecutive bad attempts, fails with `Locked` for 15 minutes
    /// regardless of correctness of the next attempt.
    async fn verify(&self, user_id: Uuid, pin: &str) -> Result<PasscodeSession, CoreError>;

    /// Fresh iff a session exists and has not expired.
    async fn has_fresh_session(&self, user_id: Uuid) -> Result<bool, CoreError>;
}

pub struct MemoryPasscodeStore {
    records: Mutex<HashMap<Uuid, PasscodeRecord>>,
    lockout_threshold: u32,
    lockout_seconds: i64,
    session_ttl_seconds: i64,
}

impl MemoryPasscodeStore {
    pub fn new(lockout_threshold: u32, lockout_seconds: i64, session_ttl_seconds: i64) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            lockout_threshold,
            lockout_seconds,
            session_ttl_seconds,
        }
    }
}

impl Default for MemoryPasscodeStore {
    fn default() -> Self {
        Self::new(5, 15 * 60, 10 * 60)
    }
}

#[async_trait]
impl PasscodeStore for MemoryPasscodeStore {
    async fn set(&self, user_id: Uuid, pin: &str) -> Result<(), CoreError> {
        if pin.len() != 4 || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(CoreError::Validation("passcode must be a 4-digit PIN".to_string()));
        }
        let salt: [u8; 16] = rand::random();
        let hash = hash_pin(pin, &salt);
        self.records.lock().await.insert(
            user_id,
            PasscodeRecord {
                salt,
                hash,
                failed_attempts: 0,
                locked_until: None,
                session_token: None,
                session_expires_at: None,
            },
        );
        Ok(())
    }

    async fn verify(&self, user_id: Uuid, pin: &str) -> Result<PasscodeSession, CoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&user_id)
            .ok_or_else(|| CoreError::NotFound("passcode not set".to_string()))?;

        let now = Utc::now();
        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(CoreError::Locked("too many passcode attempts".to_string()));
            }
            record.locked_until = None;
            record.failed_attempts = 0;
        }

        if hash_pin(pin, &record.salt) != record.hash {
            record.failed_attempts += 1;
            if record.failed_attempts >= self.lockout_threshold {
                record.locked_until = Some(now + Duration::seconds(self.lockout_seconds));
            }
            return Err(CoreError::Validation("incorrect passcode".to_string()));
        }

        record.failed_attempts = 0;
        let token = Uuid::new_v4().to_string();
        let expires_at = now + Duration::seconds(self.session_ttl_seconds);
        record.session_token = Some(token.clone());
        record.session_expires_at = Some(expires_at);
        Ok(PasscodeSession { token, expires_at })
    }

    async fn has_fresh_session(&self, user_id: Uuid) -> Result<bool, CoreError> {
        let records = self.records.lock().await;
        Ok(records
            .get(&user_id)
            .and_then(|r| r.session_expires_at)
            .is_some_and(|expiry| expiry > Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lockout_after_five_bad_attempts_ignores_correct_pin() {
        let store = MemoryPasscodeStore::new(5, 15 * 60, 10 * 60);
        let user_id = Uuid::new_v4();
        store.set(user_id, "1234").await.unwrap();

        for _ in 0..5 {
            let _ = store.verify(user_id, "0000").await;
        }
        let result = store.verify(user_id, "1234").await;
        assert!(matches!(result, Err(CoreError::Locked(_))));
    }

    #[tokio::test]
    async fn successful_verify_grants_fresh_session() {
        let store = MemoryPasscodeStore::new(5, 15 * 60, 10 * 60);
        let user_id = Uuid::new_v4();
        store.set(user_id, "1234").await.unwrap();
        store.verify(user_id, "1234").await.unwrap();
        assert!(store.has_fresh_session(user_id).await.unwrap());
    }

    #[tokio::test]
    async fn no_session_without_a_verify() {
        let store = MemoryPasscodeStore::new(5, 15 * 60, 10 * 60);
        let user_id = Uuid::new_v4();
        store.set(user_id, "1234").await.unwrap();
        assert!(!store.has_fresh_session(user_id).await.unwrap());
    }
}
