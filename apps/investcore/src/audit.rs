use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

/// Append-only, signed record of every state-changing action (§3, §4.J).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ua: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub hmac_signature: String,
}

pub struct AuditEntryDraft {
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub status: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub ip: Option<String>,
    pub ua: Option<String>,
    pub error: Option<String>,
}

/// Canonical form signed: `actor|action|resource_type|resource_id|amount|unix_ts`.
fn canonical_form(
    actor: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    amount: Option<Decimal>,
    unix_ts: i64,
) -> String {
    let amount_str = amount.map(|d| d.to_string()).unwrap_or_default();
    format!("{actor}|{action}|{resource_type}|{resource_id}|{amount_str}|{unix_ts}")
}

fn sign(secret: &str, canonical: &str) -> Result<String, CoreError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|error| CoreError::Internal(format!("failed to init audit hmac: {error}")))?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recomputes the signature over `entry`'s canonical form and compares in
/// constant time via `Mac::verify_slice`.
pub fn verify(secret: &str, entry: &AuditEntry) -> Result<bool, CoreError> {
    let canonical = canonical_form(
        &entry.actor,
        &entry.action,
        &entry.resource_type,
        &entry.resource_id,
        entry.amount,
        entry.timestamp.timestamp(),
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|error| CoreError::Internal(format!("failed to init audit hmac: {error}")))?;
    mac.update(canonical.as_bytes());
    let expected = hex::decode(&entry.hmac_signature)
        .map_err(|error| CoreError::Internal(format!("malformed hmac signature: {error}")))?;
    Ok(mac.verify_slice(&expected).is_ok())
}

pub fn build_entry(secret: &str, draft: AuditEntryDraft, now: DateTime<Utc>) -> Result<AuditEntry, CoreError> {
    let canonical = canonical_form(
        &draft.actor,
        &draft.action,
        &draft.resource_type,
        &draft.resource_id,
        draft.amount,
        now.timestamp(),
    );
    let hmac_signature = sign(secret, &canonical)?;
    Ok(AuditEntry {
        id: Uuid::new_v4(),
        actor: draft.actor,
        action: draft.action,
        resource_type: draft.resource_type,
        resource_id: draft.resource_id,
        before: draft.before,
        after: draft.after,
        status: draft.status,
        amount: draft.amount,
        currency: draft.currency,
        ip: draft.ip,
        ua: draft.ua,
        error: draft.error,
        timestamp: now,
        hmac_signature,
    })
}

#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    /// Inserted inside the caller's transaction: a mutation and its audit
    /// write either both succeed or both fail.
    async fn record(&self, draft: AuditEntryDraft) -> Result<AuditEntry, CoreError>;

    async fn list_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, CoreError>;
}

pub struct MemoryAuditLog {
    secret: String,
    entries: tokio::sync::Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            entries: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, draft: AuditEntryDraft) -> Result<AuditEntry, CoreError> {
        let entry = build_entry(&self.secret, draft, Utc::now())?;
        self.entries.lock().await.push(entry.clone());
        Ok(entry)
    }

    async fn list_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.resource_type == resource_type && e.resource_id == resource_id)
            .cloned()
            .collect())
    }
}

pub struct PostgresAuditLog {
    secret: String,
    db: std::sync::Arc<crate::db::InvestDb>,
}

impl PostgresAuditLog {
    pub fn new(secret: impl Into<String>, db: std::sync::Arc<crate::db::InvestDb>) -> Self {
        Self {
            secret: secret.into(),
            db,
        }
    }
}

#[async_trait::async_trait]
impl AuditLog for PostgresAuditLog {
    async fn record(&self, draft: AuditEntryDraft) -> Result<AuditEntry, CoreError> {
        let entry = build_entry(&self.secret, draft, Utc::now())?;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO audit_entries (
                    id, actor, action, resource_type, resource_id, before, after,
                    status, amount, currency, ip, ua, error, timestamp, hmac_signature
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
                "#,
                &[
                    &entry.id,
                    &entry.actor,
                    &entry.action,
                    &entry.resource_type,
                    &entry.resource_id,
                    &entry.before,
                    &entry.after,
                    &entry.status,
                    &entry.amount.map(|d| d.to_string()),
                    &entry.currency,
                    &entry.ip,
                    &entry.ua,
                    &entry.error,
                    &entry.timestamp,
                    &entry.hmac_signature,
                ],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("audit insert failed: {error}")))?;
        Ok(entry)
    }

    async fn list_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT id, actor, action, resource_type, resource_id, before, after,
                       status, amount, currency, ip, ua, error, timestamp, hmac_signature
                  FROM audit_entries
                 WHERE resource_type = $1 AND resource_id = $2
                 ORDER BY timestamp ASC
                "#,
                &[&resource_type, &resource_id],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("audit query failed: {error}")))?;

        rows.iter()
            .map(|row| {
                let amount: Option<String> = row.get("amount");
                Ok(AuditEntry {
                    id: row.get("id"),
                    actor: row.get("actor"),
                    action: row.get("action"),
                    resource_type: row.get("resource_type"),
                    resource_id: row.get("resource_id"),
                    before: row.get("before"),
                    after: row.get("after"),
                    status: row.get("status"),
                    amount: amount
                        .map(|s| s.parse())
                        .transpose()
                        .map_err(|error| CoreError::Internal(format!("bad decimal: {error}")))?,
                    currency: row.get("currency"),
                    ip: row.get("ip"),
                    ua: row.get("ua"),
                    error: row.get("error"),
                    timestamp: row.get("timestamp"),
                    hmac_signature: row.get("hmac_signature"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_entry_verifies() {
        let log = MemoryAuditLog::new("test-secret");
        let entry = log
            .record(AuditEntryDraft {
                actor: "user:abc".into(),
                action: "onboarding.transition".into(),
                resource_type: "user".into(),
                resource_id: "abc".into(),
                before: None,
                after: None,
                status: "ok".into(),
                amount: None,
                currency: None,
                ip: None,
                ua: None,
                error: None,
            })
            .await
            .unwrap();
        assert!(verify("test-secret", &entry).unwrap());
        assert!(!verify("wrong-secret", &entry).unwrap());
    }

    #[tokio::test]
    async fn tampered_entry_fails_verification() {
        let log = MemoryAuditLog::new("test-secret");
        let mut entry = log
            .record(AuditEntryDraft {
                actor: "user:abc".into(),
                action: "order.create".into(),
                resource_type: "order".into(),
                resource_id: "order-1".into(),
                before: None,
                after: None,
                status: "ok".into(),
                amount: Some(Decimal::new(5000, 2)),
                currency: Some("USD".into()),
                ip: None,
                ua: None,
                error: None,
            })
            .await
            .unwrap();
        entry.amount = Some(Decimal::new(500000, 2));
        assert!(!verify("test-secret", &entry).unwrap());
    }
}
