use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::CoreError;

/// A row proving a given `(source, event_id)` has already been processed
/// (§3 EventReceipt, §4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReceipt {
    pub source: String,
    pub event_id: String,
    pub received_at: DateTime<Utc>,
    pub outcome: Value,
}

/// Object-safe half of the ledger contract. `record_or_replay` itself can't
/// live here — a generic closure parameter isn't object-safe — so it's an
/// inherent method on each backend, unified by `IdempotencyBackend` below.
#[async_trait::async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn get(&self, source: &str, event_id: &str) -> Result<Option<EventReceipt>, CoreError>;
}

pub struct MemoryIdempotencyLedger {
    receipts: Mutex<HashMap<(String, String), EventReceipt>>,
}

impl MemoryIdempotencyLedger {
    pub fn new() -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIdempotencyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdempotencyLedger {
    /// Inserts `(source, event_id)` inside the same transaction that applies
    /// the effect of `f`. On a pre-existing row the stored outcome is
    /// replayed and `f` is never invoked.
    pub async fn record_or_replay<F, Fut>(&self, source: &str, event_id: &str, f: F) -> Result<Value, CoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, CoreError>> + Send,
    {
        let key = (source.to_string(), event_id.to_string());
        {
            let receipts = self.receipts.lock().await;
            if let Some(existing) = receipts.get(&key) {
                return Ok(existing.outcome.clone());
            }
        }

        // The effect runs outside the lock: callers take their own row lock
        // (e.g. on Balances) for the part that actually needs serialization.
        let outcome = f().await?;

        let mut receipts = self.receipts.lock().await;
        let receipt = receipts.entry(key).or_insert_with(|| EventReceipt {
            source: source.to_string(),
            event_id: event_id.to_string(),
            received_at: Utc::now(),
            outcome: outcome.clone(),
        });
        Ok(receipt.outcome.clone())
    }

    async fn get(&self, source: &str, event_id: &str) -> Result<Option<EventReceipt>, CoreError> {
        Ok(self
            .receipts
            .lock()
            .await
            .get(&(source.to_string(), event_id.to_string()))
            .cloned())
    }
}

pub struct PostgresIdempotencyLedger {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresIdempotencyLedger {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

impl PostgresIdempotencyLedger {
    /// Mirrors `MemoryIdempotencyLedger::record_or_replay`; the insert races
    /// on `(source, event_id)` and the loser replays the winner's outcome.
    pub async fn record_or_replay<F, Fut>(
        &self,
        source: &str,
        event_id: &str,
        f: F,
    ) -> Result<Value, CoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, CoreError>> + Send,
    {
        let client = self.db.client();
        {
            let client = client.lock().await;
            let existing = client
                .query_opt(
                    "SELECT outcome FROM event_receipts WHERE source = $1 AND event_id = $2",
                    &[&source, &event_id],
                )
                .await
                .map_err(|error| CoreError::Internal(format!("ledger lookup failed: {error}")))?;
            if let Some(row) = existing {
                let outcome: Value = row.get("outcome");
                return Ok(outcome);
            }
        }

        let outcome = f().await?;

        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO event_receipts (source, event_id, received_at, outcome)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (source, event_id) DO NOTHING
                "#,
                &[&source, &event_id, &Utc::now(), &outcome],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("ledger insert failed: {error}")))?;
        if inserted == 0 {
            // Lost the race to a concurrent delivery; replay its outcome.
            let row = client
                .query_one(
                    "SELECT outcome FROM event_receipts WHERE source = $1 AND event_id = $2",
                    &[&source, &event_id],
                )
                .await
                .map_err(|error| CoreError::Internal(format!("ledger replay failed: {error}")))?;
            let replayed: Value = row.get("outcome");
            return Ok(replayed);
        }
        Ok(outcome)
    }
}

#[async_trait::async_trait]
impl IdempotencyLedger for PostgresIdempotencyLedger {
    async fn get(&self, source: &str, event_id: &str) -> Result<Option<EventReceipt>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT source, event_id, received_at, outcome FROM event_receipts WHERE source = $1 AND event_id = $2",
                &[&source, &event_id],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("ledger lookup failed: {error}")))?;
        Ok(row.map(|row| EventReceipt {
            source: row.get("source"),
            event_id: row.get("event_id"),
            received_at: row.get("received_at"),
            outcome: row.get("outcome"),
        }))
    }
}

/// Unifies the two backends behind one concrete type so call sites that need
/// dynamic dispatch (`Arc<IdempotencyBackend>`) can still reach the generic
/// `record_or_replay` that `IdempotencyLedger` can't carry as a trait method.
pub enum IdempotencyBackend {
    Memory(MemoryIdempotencyLedger),
    Postgres(PostgresIdempotencyLedger),
}

impl IdempotencyBackend {
    pub async fn record_or_replay<F, Fut>(&self, source: &str, event_id: &str, f: F) -> Result<Value, CoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, CoreError>> + Send,
    {
        match self {
            Self::Memory(ledger) => ledger.record_or_replay(source, event_id, f).await,
            Self::Postgres(ledger) => ledger.record_or_replay(source, event_id, f).await,
        }
    }

    pub async fn get(&self, source: &str, event_id: &str) -> Result<Option<EventReceipt>, CoreError> {
        match self {
            Self::Memory(ledger) => ledger.get(source, event_id).await,
            Self::Postgres(ledger) => IdempotencyLedger::get(ledger, source, event_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn replays_duplicate_events_exactly_once() {
        let ledger = MemoryIdempotencyLedger::new();
        let calls = AtomicU32::new(0);

        let first = ledger
            .record_or_replay("chain", "0xT1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"credited": "100.00"}))
            })
            .await
            .unwrap();

        let second = ledger
            .record_or_replay("chain", "0xT1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"credited": "999.99"}))
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
