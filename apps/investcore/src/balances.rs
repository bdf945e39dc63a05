use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balances {
    pub user_id: Uuid,
    pub buying_power: Decimal,
    pub pending_deposits: Decimal,
    pub reserved: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait BalancesStore: Send + Sync {
    async fn get_or_create(&self, user_id: Uuid) -> Result<Balances, CoreError>;

    /// `buying_power += amount`. Used by the deposit/off-ramp credit path.
    async fn credit(&self, user_id: Uuid, amount: Decimal) -> Result<Balances, CoreError>;

    /// `buying_power -= notional; reserved += notional` after checking
    /// `buying_power >= notional` (§4.H buy-side reservation). Fails with
    /// `Conflict` if insufficient.
    async fn reserve(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError>;

    /// Reservation is released back into spendable buying power (order
    /// rejected/cancelled before the brokerage spent the funds).
    async fn release_reservation(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError>;

    /// Reservation is consumed without returning funds to buying_power (the
    /// brokerage already spent them on a filled order).
    async fn consume_reservation(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError>;
}

pub struct MemoryBalancesStore {
    balances: Mutex<HashMap<Uuid, Balances>>,
}

impl MemoryBalancesStore {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBalancesStore {
    fn default() -> Self {
        Self::new()
    }
}

fn default_row(user_id: Uuid) -> Balances {
    Balances {
        user_id,
        buying_power: Decimal::ZERO,
        pending_deposits: Decimal::ZERO,
        reserved: Decimal::ZERO,
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl BalancesStore for MemoryBalancesStore {
    async fn get_or_create(&self, user_id: Uuid) -> Result<Balances, CoreError> {
        let mut balances = self.balances.lock().await;
        Ok(balances.entry(user_id).or_insert_with(|| default_row(user_id)).clone())
    }

    async fn credit(&self, user_id: Uuid, amount: Decimal) -> Result<Balances, CoreError> {
        let mut balances = self.balances.lock().await;
        let row = balances.entry(user_id).or_insert_with(|| default_row(user_id));
        row.buying_power += amount;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn reserve(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError> {
        let mut balances = self.balances.lock().await;
        let row = balances.entry(user_id).or_insert_with(|| default_row(user_id));
        if row.buying_power < notional {
            return Err(CoreError::Conflict("insufficient buying power".to_string()));
        }
        row.buying_power -= notional;
        row.reserved += notional;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn release_reservation(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError> {
        let mut balances = self.balances.lock().await;
        let row = balances.entry(user_id).or_insert_with(|| default_row(user_id));
        row.reserved -= notional;
        row.buying_power += notional;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn consume_reservation(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError> {
        let mut balances = self.balances.lock().await;
        let row = balances.entry(user_id).or_insert_with(|| default_row(user_id));
        row.reserved -= notional;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

pub struct PostgresBalancesStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresBalancesStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }

    async fn locked_row(&self, tx: &tokio_postgres::Transaction<'_>, user_id: Uuid) -> Result<Balances, CoreError> {
        tx.execute(
            r#"
            INSERT INTO balances (user_id, buying_power, pending_deposits, reserved, updated_at)
            VALUES ($1, 0, 0, 0, now())
            ON CONFLICT (user_id) DO NOTHING
            "#,
            &[&user_id],
        )
        .await
        .map_err(|error| CoreError::Internal(format!("balances seed failed: {error}")))?;
        let row = tx
            .query_one("SELECT * FROM balances WHERE user_id = $1 FOR UPDATE", &[&user_id])
            .await
            .map_err(|error| CoreError::Internal(format!("balances lock failed: {error}")))?;
        Ok(map_balances_row(&row))
    }
}

#[async_trait]
impl BalancesStore for PostgresBalancesStore {
    async fn get_or_create(&self, user_id: Uuid) -> Result<Balances, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("balances tx failed: {error}")))?;
        let row = self.locked_row(&tx, user_id).await?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("balances commit failed: {error}")))?;
        Ok(row)
    }

    async fn credit(&self, user_id: Uuid, amount: Decimal) -> Result<Balances, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("balances tx failed: {error}")))?;
        self.locked_row(&tx, user_id).await?;
        let row = tx
            .query_one(
                "UPDATE balances SET buying_power = buying_power + $2, updated_at = now() WHERE user_id = $1 RETURNING *",
                &[&user_id, &amount],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("balances credit failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("balances commit failed: {error}")))?;
        Ok(map_balances_row(&row))
    }

    async fn reserve(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("balances tx failed: {error}")))?;
        let current = self.locked_row(&tx, user_id).await?;
        if current.buying_power < notional {
            return Err(CoreError::Conflict("insufficient buying power".to_string()));
        }
        let row = tx
            .query_one(
                r#"
                UPDATE balances
                   SET buying_power = buying_power - $2, reserved = reserved + $2, updated_at = now()
                 WHERE user_id = $1
                RETURNING *
                "#,
                &[&user_id, &notional],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("balances reserve failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("balances commit failed: {error}")))?;
        Ok(map_balances_row(&row))
    }

    async fn release_reservation(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("balances tx failed: {error}")))?;
        self.locked_row(&tx, user_id).await?;
        let row = tx
            .query_one(
                r#"
                UPDATE balances
                   SET reserved = reserved - $2, buying_power = buying_power + $2, updated_at = now()
                 WHERE user_id = $1
                RETURNING *
                "#,
                &[&user_id, &notional],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("balances release failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("balances commit failed: {error}")))?;
        Ok(map_balances_row(&row))
    }

    async fn consume_reservation(&self, user_id: Uuid, notional: Decimal) -> Result<Balances, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("balances tx failed: {error}")))?;
        self.locked_row(&tx, user_id).await?;
        let row = tx
            .query_one(
                "UPDATE balances SET reserved = reserved - $2, updated_at = now() WHERE user_id = $1 RETURNING *",
                &[&user_id, &notional],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("balances consume failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("balances commit failed: {error}")))?;
        Ok(map_balances_row(&row))
    }
}

fn map_balances_row(row: &tokio_postgres::Row) -> Balances {
    Balances {
        user_id: row.get("user_id"),
        buying_power: row.get("buying_power"),
        pending_deposits: row.get("pending_deposits"),
        reserved: row.get("reserved"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_then_release_returns_to_the_starting_balance() {
        let store = MemoryBalancesStore::new();
        let user_id = Uuid::new_v4();
        store.credit(user_id, Decimal::new(10000, 2)).await.unwrap();
        store.reserve(user_id, Decimal::new(4000, 2)).await.unwrap();
        let after_reserve = store.get_or_create(user_id).await.unwrap();
        assert_eq!(after_reserve.buying_power, Decimal::new(6000, 2));
        assert_eq!(after_reserve.reserved, Decimal::new(4000, 2));

        let after_release = store.release_reservation(user_id, Decimal::new(4000, 2)).await.unwrap();
        assert_eq!(after_release.buying_power, Decimal::new(10000, 2));
        assert_eq!(after_release.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reserve_over_buying_power_is_a_conflict() {
        let store = MemoryBalancesStore::new();
        let user_id = Uuid::new_v4();
        let result = store.reserve(user_id, Decimal::new(100, 2)).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }
}
