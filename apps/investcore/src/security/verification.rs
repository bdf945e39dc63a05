use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::users::canonicalize_email;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationChannel {
    Email,
    Sms,
}

#[derive(Debug, Clone)]
pub struct VerificationCode {
    pub channel: VerificationChannel,
    pub identifier: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub resend_count: u32,
    pub last_sent_at: DateTime<Utc>,
    pub consumed: bool,
}

fn canonical_key(channel: VerificationChannel, identifier: &str) -> (VerificationChannel, String) {
    let canonical = match channel {
        VerificationChannel::Email => canonicalize_email(identifier),
        VerificationChannel::Sms => identifier.to_string(),
    };
    (channel, canonical)
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Generates and stores a fresh code, enforcing the 60s minimum resend
    /// gap. `code_override` lets tests (and the onboarding vignette) inject
    /// a deterministic code instead of a random one.
    async fn issue(
        &self,
        channel: VerificationChannel,
        identifier: &str,
        code_override: Option<&str>,
    ) -> Result<String, CoreError>;

    /// Valid only if `attempt_count < 5` and `now <= expires_at`. A
    /// successful verify invalidates all earlier codes for
    /// `(channel, identifier)`.
    async fn verify(
        &self,
        channel: VerificationChannel,
        identifier: &str,
        code: &str,
    ) -> Result<(), CoreError>;
}

pub struct MemoryVerificationStore {
    codes: Mutex<HashMap<(VerificationChannel, String), VerificationCode>>,
    ttl_seconds: i64,
    max_attempts: u32,
    min_resend_seconds: i64,
}

impl MemoryVerificationStore {
    pub fn new(ttl_seconds: i64, max_attempts: u32, min_resend_seconds: i64) -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            ttl_seconds,
            max_attempts,
            min_resend_seconds,
        }
    }
}

impl Default for MemoryVerificationStore {
    fn default() -> Self {
        Self::new(15 * 60, 5, 60)
    }
}

#[async_trait]
impl VerificationStore for MemoryVerificationStore {
    async fn issue(
        &self,
        channel: VerificationChannel,
        identifier: &str,
        code_override: Option<&str>,
    ) -> Result<String, CoreError> {
        let key = canonical_key(channel, identifier);
        let now = Utc::now();
        let mut codes = self.codes.lock().await;

        let resend_count = if let Some(existing) = codes.get(&key) {
            if now.signed_duration_since(existing.last_sent_at) < Duration::seconds(self.min_resend_seconds) {
                return Err(CoreError::RateLimited);
            }
            existing.resend_count + 1
        } else {
            0
        };

        let code = code_override
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:06}", rand::rng().random_range(0..1_000_000)));

        codes.insert(
            key.clone(),
            VerificationCode {
                channel,
                identifier: key.1,
                code: code.clone(),
                created_at: now,
                expires_at: now + Duration::seconds(self.ttl_seconds),
                attempt_count: 0,
                resend_count,
                last_sent_at: now,
                consumed: false,
            },
        );
        Ok(code)
    }

    async fn verify(
        &self,
        channel: VerificationChannel,
        identifier: &str,
        code: &str,
    ) -> Result<(), CoreError> {
        let key = canonical_key(channel, identifier);
        let mut codes = self.codes.lock().await;
        let entry = codes
            .get_mut(&key)
            .ok_or_else(|| CoreError::NotFound("no verification code issued".to_string()))?;

        if entry.consumed {
            return Err(CoreError::AlreadyProcessed);
        }
        if entry.attempt_count >= self.max_attempts {
            return Err(CoreError::Locked("too many verification attempts".to_string()));
        }
        if Utc::now() > entry.expires_at {
            return Err(CoreError::Validation("verification code expired".to_string()));
        }

        entry.attempt_count += 1;
        if entry.code != code {
            return Err(CoreError::Validation("incorrect verification code".to_string()));
        }

        entry.consumed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn max_five_attempts_then_locked() {
        let store = MemoryVerificationStore::new(15 * 60, 5, 60);
        store
            .issue(VerificationChannel::Email, "a@x.com", Some("123456"))
            .await
            .unwrap();

        for _ in 0..5 {
            let _ = store.verify(VerificationChannel::Email, "a@x.com", "000000").await;
        }
        let result = store.verify(VerificationChannel::Email, "a@x.com", "123456").await;
        assert!(matches!(result, Err(CoreError::Locked(_))));
    }

    #[tokio::test]
    async fn resend_before_min_interval_is_rate_limited() {
        let store = MemoryVerificationStore::new(15 * 60, 5, 60);
        store
            .issue(VerificationChannel::Email, "a@x.com", Some("123456"))
            .await
            .unwrap();
        let result = store
            .issue(VerificationChannel::Email, "a@x.com", Some("654321"))
            .await;
        assert!(matches!(result, Err(CoreError::RateLimited)));
    }

    #[tokio::test]
    async fn successful_verify_invalidates_the_code() {
        let store = MemoryVerificationStore::new(15 * 60, 5, 60);
        store
            .issue(VerificationChannel::Email, "a@x.com", Some("123456"))
            .await
            .unwrap();
        store
            .verify(VerificationChannel::Email, "a@x.com", "123456")
            .await
            .unwrap();
        let replay = store.verify(VerificationChannel::Email, "a@x.com", "123456").await;
        assert!(matches!(replay, Err(CoreError::AlreadyProcessed)));
    }
}
