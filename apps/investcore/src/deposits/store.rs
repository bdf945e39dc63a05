use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Observed,
    Confirmed,
    Credited,
    Rejected,
}

/// (chain, tx_hash) unique (§3 Deposit). `user_id` is `None` until the
/// destination address resolves to a `ManagedWallet`; an unresolved deposit
/// is recorded as orphaned rather than dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub chain: String,
    pub tx_hash: String,
    pub user_id: Option<Uuid>,
    pub destination_address: String,
    pub token: String,
    pub amount: Decimal,
    pub confirmations: u32,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Upserts the `(chain, tx_hash)` row, bumping `confirmations` and
    /// promoting `observed -> confirmed` once the per-chain threshold is
    /// met. Never regresses a `credited`/`rejected` row.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_observed(
        &self,
        chain: &str,
        tx_hash: &str,
        user_id: Option<Uuid>,
        destination_address: &str,
        token: &str,
        amount: Decimal,
        confirmations: u32,
        confirmation_threshold: u32,
    ) -> Result<Deposit, CoreError>;

    async fn get(&self, chain: &str, tx_hash: &str) -> Result<Option<Deposit>, CoreError>;

    /// Marks the row `credited`; only legal from `confirmed` (§4.G step 3).
    async fn mark_credited(&self, chain: &str, tx_hash: &str) -> Result<Deposit, CoreError>;

    async fn mark_rejected(&self, chain: &str, tx_hash: &str, reason: &str) -> Result<Deposit, CoreError>;
}

pub struct MemoryDepositStore {
    deposits: Mutex<HashMap<(String, String), Deposit>>,
}

impl MemoryDepositStore {
    pub fn new() -> Self {
        Self {
            deposits: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryDepositStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepositStore for MemoryDepositStore {
    async fn upsert_observed(
        &self,
        chain: &str,
        tx_hash: &str,
        user_id: Option<Uuid>,
        destination_address: &str,
        token: &str,
        amount: Decimal,
        confirmations: u32,
        confirmation_threshold: u32,
    ) -> Result<Deposit, CoreError> {
        let key = (chain.to_string(), tx_hash.to_string());
        let mut deposits = self.deposits.lock().await;
        let now = Utc::now();

        if let Some(existing) = deposits.get(&key) {
            if matches!(existing.status, DepositStatus::Credited | DepositStatus::Rejected) {
                return Ok(existing.clone());
            }
        }

        let status = if confirmations >= confirmation_threshold {
            DepositStatus::Confirmed
        } else {
            DepositStatus::Observed
        };

        let deposit = deposits
            .entry(key)
            .and_modify(|d| {
                d.confirmations = confirmations.max(d.confirmations);
                d.user_id = d.user_id.or(user_id);
                if !matches!(d.status, DepositStatus::Credited | DepositStatus::Rejected) {
                    d.status = status;
                }
                d.updated_at = now;
            })
            .or_insert_with(|| Deposit {
                chain: chain.to_string(),
                tx_hash: tx_hash.to_string(),
                user_id,
                destination_address: destination_address.to_string(),
                token: token.to_string(),
                amount,
                confirmations,
                status,
                created_at: now,
                updated_at: now,
            });
        Ok(deposit.clone())
    }

    async fn get(&self, chain: &str, tx_hash: &str) -> Result<Option<Deposit>, CoreError> {
        Ok(self
            .deposits
            .lock()
            .await
            .get(&(chain.to_string(), tx_hash.to_string()))
            .cloned())
    }

    async fn mark_credited(&self, chain: &str, tx_hash: &str) -> Result<Deposit, CoreError> {
        let mut deposits = self.deposits.lock().await;
        let deposit = deposits
            .get_mut(&(chain.to_string(), tx_hash.to_string()))
            .ok_or_else(|| CoreError::NotFound(format!("deposit {chain}/{tx_hash}")))?;
        deposit.status = DepositStatus::Credited;
        deposit.updated_at = Utc::now();
        Ok(deposit.clone())
    }

    async fn mark_rejected(&self, chain: &str, tx_hash: &str, _reason: &str) -> Result<Deposit, CoreError> {
        let mut deposits = self.deposits.lock().await;
        let deposit = deposits
            .get_mut(&(chain.to_string(), tx_hash.to_string()))
            .ok_or_else(|| CoreError::NotFound(format!("deposit {chain}/{tx_hash}")))?;
        deposit.status = DepositStatus::Rejected;
        deposit.updated_at = Utc::now();
        Ok(deposit.clone())
    }
}

pub struct PostgresDepositStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresDepositStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DepositStore for PostgresDepositStore {
    async fn upsert_observed(
        &self,
        chain: &str,
        tx_hash: &str,
        user_id: Option<Uuid>,
        destination_address: &str,
        token: &str,
        amount: Decimal,
        confirmations: u32,
        confirmation_threshold: u32,
    ) -> Result<Deposit, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let status = if confirmations >= confirmation_threshold {
            "confirmed"
        } else {
            "observed"
        };
        let now = Utc::now();
        let row = client
            .query_one(
                r#"
                INSERT INTO deposits (
                    chain, tx_hash, user_id, destination_address, token, amount,
                    confirmations, status, created_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$9)
                ON CONFLICT (chain, tx_hash) DO UPDATE SET
                    confirmations = GREATEST(deposits.confirmations, EXCLUDED.confirmations),
                    user_id = COALESCE(deposits.user_id, EXCLUDED.user_id),
                    status = CASE WHEN deposits.status IN ('credited', 'rejected')
                                  THEN deposits.status ELSE EXCLUDED.status END,
                    updated_at = EXCLUDED.updated_at
                RETURNING *
                "#,
                &[
                    &chain,
                    &tx_hash,
                    &user_id,
                    &destination_address,
                    &token,
                    &amount,
                    &(confirmations as i32),
                    &status,
                    &now,
                ],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("deposit upsert failed: {error}")))?;
        Ok(map_deposit_row(&row))
    }

    async fn get(&self, chain: &str, tx_hash: &str) -> Result<Option<Deposit>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM deposits WHERE chain = $1 AND tx_hash = $2",
                &[&chain, &tx_hash],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("deposit lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_deposit_row))
    }

    async fn mark_credited(&self, chain: &str, tx_hash: &str) -> Result<Deposit, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                "UPDATE deposits SET status = 'credited', updated_at = now() WHERE chain = $1 AND tx_hash = $2 RETURNING *",
                &[&chain, &tx_hash],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("deposit credit failed: {error}")))?;
        Ok(map_deposit_row(&row))
    }

    async fn mark_rejected(&self, chain: &str, tx_hash: &str, _reason: &str) -> Result<Deposit, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                "UPDATE deposits SET status = 'rejected', updated_at = now() WHERE chain = $1 AND tx_hash = $2 RETURNING *",
                &[&chain, &tx_hash],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("deposit reject failed: {error}")))?;
        Ok(map_deposit_row(&row))
    }
}

fn map_deposit_row(row: &tokio_postgres::Row) -> Deposit {
    let status: String = row.get("status");
    Deposit {
        chain: row.get("chain"),
        tx_hash: row.get("tx_hash"),
        user_id: row.get("user_id"),
        destination_address: row.get("destination_address"),
        token: row.get("token"),
        amount: row.get("amount"),
        confirmations: row.get::<_, i32>("confirmations") as u32,
        status: match status.as_str() {
            "confirmed" => DepositStatus::Confirmed,
            "credited" => DepositStatus::Credited,
            "rejected" => DepositStatus::Rejected,
            _ => DepositStatus::Observed,
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redelivery_below_threshold_stays_observed() {
        let store = MemoryDepositStore::new();
        let user_id = Uuid::new_v4();
        store
            .upsert_observed("SOL-DEVNET", "0xT1", Some(user_id), "addr-1", "USDC", Decimal::new(10000, 2), 0, 1)
            .await
            .unwrap();
        let after = store
            .upsert_observed("SOL-DEVNET", "0xT1", Some(user_id), "addr-1", "USDC", Decimal::new(10000, 2), 1, 1)
            .await
            .unwrap();
        assert_eq!(after.status, DepositStatus::Confirmed);
    }

    #[tokio::test]
    async fn credited_rows_never_regress() {
        let store = MemoryDepositStore::new();
        store
            .upsert_observed("SOL-DEVNET", "0xT1", None, "addr-1", "USDC", Decimal::new(10000, 2), 1, 1)
            .await
            .unwrap();
        store.mark_credited("SOL-DEVNET", "0xT1").await.unwrap();
        let after = store
            .upsert_observed("SOL-DEVNET", "0xT1", None, "addr-1", "USDC", Decimal::new(10000, 2), 1, 1)
            .await
            .unwrap();
        assert_eq!(after.status, DepositStatus::Credited);
    }
}
