use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::adapters::brokerage::OrderSide;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Cancelled)
    }
}

/// (§3 Order). `filled_quantity` accumulates across fill events keyed by
/// (brokerage_ref, fill_id) at the reconciliation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub basket_id: Uuid,
    pub side: OrderSide,
    pub notional_amount: Decimal,
    pub status: OrderStatus,
    pub brokerage_ref: Option<String>,
    pub filled_quantity: Decimal,
    /// For a buy: the slice of `notional_amount` still held in
    /// `Balances.reserved`. For a sell: the share quantity still held in
    /// `Position.reserved`. Either way, not yet consumed or released.
    pub reserved_remaining: Decimal,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        user_id: Uuid,
        basket_id: Uuid,
        side: OrderSide,
        notional_amount: Decimal,
    ) -> Result<Order, CoreError>;

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, CoreError>;

    async fn get_by_brokerage_ref(&self, brokerage_ref: &str) -> Result<Option<Order>, CoreError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, CoreError>;

    /// Object-safe mutator, mirroring `UserStore::update` (§4.H reconciliation).
    async fn update(
        &self,
        order_id: Uuid,
        mutator: Box<dyn FnOnce(&mut Order) -> Result<(), CoreError> + Send>,
    ) -> Result<Order, CoreError>;
}

pub struct MemoryOrderStore {
    orders: Mutex<HashMap<Uuid, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(
        &self,
        user_id: Uuid,
        basket_id: Uuid,
        side: OrderSide,
        notional_amount: Decimal,
    ) -> Result<Order, CoreError> {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            user_id,
            basket_id,
            side,
            notional_amount,
            status: OrderStatus::Pending,
            brokerage_ref: None,
            filled_quantity: Decimal::ZERO,
            reserved_remaining: if side == OrderSide::Buy { notional_amount } else { Decimal::ZERO },
            reject_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.orders.lock().await.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, CoreError> {
        Ok(self.orders.lock().await.get(&order_id).cloned())
    }

    async fn get_by_brokerage_ref(&self, brokerage_ref: &str) -> Result<Option<Order>, CoreError> {
        Ok(self
            .orders
            .lock()
            .await
            .values()
            .find(|o| o.brokerage_ref.as_deref() == Some(brokerage_ref))
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, CoreError> {
        Ok(self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        order_id: Uuid,
        mutator: Box<dyn FnOnce(&mut Order) -> Result<(), CoreError> + Send>,
    ) -> Result<Order, CoreError> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))?;
        mutator(order)?;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}

pub struct PostgresOrderStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresOrderStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create(
        &self,
        user_id: Uuid,
        basket_id: Uuid,
        side: OrderSide,
        notional_amount: Decimal,
    ) -> Result<Order, CoreError> {
        let side_str = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let now = Utc::now();
        let reserved_remaining = if side == OrderSide::Buy { notional_amount } else { Decimal::ZERO };
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO orders (
                    id, user_id, basket_id, side, notional_amount, status,
                    brokerage_ref, filled_quantity, reserved_remaining, reject_reason, created_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,'pending',NULL,0,$6,NULL,$7,$7)
                RETURNING *
                "#,
                &[&Uuid::new_v4(), &user_id, &basket_id, &side_str, &notional_amount, &reserved_remaining, &now],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("order insert failed: {error}")))?;
        Ok(map_order_row(&row))
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM orders WHERE id = $1", &[&order_id])
            .await
            .map_err(|error| CoreError::Internal(format!("order lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_order_row))
    }

    async fn get_by_brokerage_ref(&self, brokerage_ref: &str) -> Result<Option<Order>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM orders WHERE brokerage_ref = $1", &[&brokerage_ref])
            .await
            .map_err(|error| CoreError::Internal(format!("order lookup by ref failed: {error}")))?;
        Ok(row.as_ref().map(map_order_row))
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query("SELECT * FROM orders WHERE user_id = $1 ORDER BY created_at DESC", &[&user_id])
            .await
            .map_err(|error| CoreError::Internal(format!("order list failed: {error}")))?;
        Ok(rows.iter().map(map_order_row).collect())
    }

    async fn update(
        &self,
        order_id: Uuid,
        mutator: Box<dyn FnOnce(&mut Order) -> Result<(), CoreError> + Send>,
    ) -> Result<Order, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("order update tx failed: {error}")))?;
        let row = tx
            .query_one("SELECT * FROM orders WHERE id = $1 FOR UPDATE", &[&order_id])
            .await
            .map_err(|_| CoreError::NotFound(format!("order {order_id}")))?;
        let mut order = map_order_row(&row);
        mutator(&mut order)?;
        order.updated_at = Utc::now();
        let status_str = match order.status {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        };
        tx.execute(
            r#"
            UPDATE orders SET status = $2, brokerage_ref = $3, filled_quantity = $4,
                               reserved_remaining = $5, reject_reason = $6, updated_at = $7
             WHERE id = $1
            "#,
            &[
                &order_id,
                &status_str,
                &order.brokerage_ref,
                &order.filled_quantity,
                &order.reserved_remaining,
                &order.reject_reason,
                &order.updated_at,
            ],
        )
        .await
        .map_err(|error| CoreError::Internal(format!("order update failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("order update commit failed: {error}")))?;
        Ok(order)
    }
}

fn map_order_row(row: &tokio_postgres::Row) -> Order {
    let side_str: String = row.get("side");
    let status_str: String = row.get("status");
    Order {
        id: row.get("id"),
        user_id: row.get("user_id"),
        basket_id: row.get("basket_id"),
        side: if side_str == "sell" { OrderSide::Sell } else { OrderSide::Buy },
        notional_amount: row.get("notional_amount"),
        status: match status_str.as_str() {
            "accepted" => OrderStatus::Accepted,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "rejected" => OrderStatus::Rejected,
            "cancelled" => OrderStatus::Cancelled,
            _ => OrderStatus::Pending,
        },
        brokerage_ref: row.get("brokerage_ref"),
        filled_quantity: row.get("filled_quantity"),
        reserved_remaining: row.get("reserved_remaining"),
        reject_reason: row.get("reject_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// (user_id, symbol) -> accumulated position (§3 Position), a derived view
/// maintained as fills reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: Uuid,
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    /// Share quantity held for pending sell orders; `quantity - reserved`
    /// is what a new sell may still draw against (§4.H sell-side reservation).
    pub reserved: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, user_id: Uuid, symbol: &str) -> Result<Option<Position>, CoreError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, CoreError>;

    /// Weighted-average-cost accumulation on a buy fill; `quantity_delta`
    /// negative for sell fills (never below zero, §4.H sell-side check).
    async fn apply_fill(
        &self,
        user_id: Uuid,
        symbol: &str,
        quantity_delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Position, CoreError>;

    /// `reserved += quantity` after checking `quantity - reserved >= quantity`
    /// (§4.H sell-side reservation). Fails with `Conflict` if insufficient or
    /// if no position exists in `symbol`. Mirrors `Balances::reserve`.
    async fn reserve(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError>;

    /// Reservation is released (order rejected/cancelled before the
    /// brokerage sold the shares).
    async fn release_reservation(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError>;

    /// Reservation is consumed as the brokerage fills the sell.
    async fn consume_reservation(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError>;
}

pub struct MemoryPositionStore {
    positions: Mutex<HashMap<(Uuid, String), Position>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn get(&self, user_id: Uuid, symbol: &str) -> Result<Option<Position>, CoreError> {
        Ok(self
            .positions
            .lock()
            .await
            .get(&(user_id, symbol.to_string()))
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, CoreError> {
        Ok(self
            .positions
            .lock()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn apply_fill(
        &self,
        user_id: Uuid,
        symbol: &str,
        quantity_delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Position, CoreError> {
        let mut positions = self.positions.lock().await;
        let key = (user_id, symbol.to_string());
        let now = Utc::now();
        let existing = positions.get(&key).cloned();
        let reserved = existing.as_ref().map(|p| p.reserved).unwrap_or(Decimal::ZERO);
        let (new_quantity, new_avg_cost) = match existing {
            Some(p) if quantity_delta > Decimal::ZERO => {
                let total_cost = p.avg_cost * p.quantity + fill_price * quantity_delta;
                let new_quantity = p.quantity + quantity_delta;
                let new_avg_cost = if new_quantity.is_zero() { Decimal::ZERO } else { total_cost / new_quantity };
                (new_quantity, new_avg_cost)
            }
            Some(p) => {
                let new_quantity = (p.quantity + quantity_delta).max(Decimal::ZERO);
                (new_quantity, p.avg_cost)
            }
            None if quantity_delta > Decimal::ZERO => (quantity_delta, fill_price),
            None => (Decimal::ZERO, Decimal::ZERO),
        };
        let position = Position {
            user_id,
            symbol: symbol.to_string(),
            quantity: new_quantity,
            avg_cost: new_avg_cost,
            reserved,
            updated_at: now,
        };
        positions.insert(key, position.clone());
        Ok(position)
    }

    async fn reserve(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError> {
        let mut positions = self.positions.lock().await;
        let key = (user_id, symbol.to_string());
        let position = positions
            .get_mut(&key)
            .ok_or_else(|| CoreError::Conflict(format!("no position in {symbol}")))?;
        if position.quantity - position.reserved < quantity {
            return Err(CoreError::Conflict(format!("position {symbol} has insufficient unreserved quantity")));
        }
        position.reserved += quantity;
        position.updated_at = Utc::now();
        Ok(position.clone())
    }

    async fn release_reservation(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError> {
        let mut positions = self.positions.lock().await;
        let key = (user_id, symbol.to_string());
        let position = positions
            .get_mut(&key)
            .ok_or_else(|| CoreError::NotFound(format!("position {symbol}")))?;
        position.reserved = (position.reserved - quantity).max(Decimal::ZERO);
        position.updated_at = Utc::now();
        Ok(position.clone())
    }

    async fn consume_reservation(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError> {
        let mut positions = self.positions.lock().await;
        let key = (user_id, symbol.to_string());
        let position = positions
            .get_mut(&key)
            .ok_or_else(|| CoreError::NotFound(format!("position {symbol}")))?;
        position.reserved = (position.reserved - quantity).max(Decimal::ZERO);
        position.updated_at = Utc::now();
        Ok(position.clone())
    }
}

pub struct PostgresPositionStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresPositionStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }

    async fn locked_row(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Position>, CoreError> {
        let row = tx
            .query_opt(
                "SELECT * FROM positions WHERE user_id = $1 AND symbol = $2 FOR UPDATE",
                &[&user_id, &symbol],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("position lock failed: {error}")))?;
        Ok(row.as_ref().map(map_position_row))
    }
}

#[async_trait]
impl PositionStore for PostgresPositionStore {
    async fn get(&self, user_id: Uuid, symbol: &str) -> Result<Option<Position>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM positions WHERE user_id = $1 AND symbol = $2",
                &[&user_id, &symbol],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("position lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_position_row))
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query("SELECT * FROM positions WHERE user_id = $1", &[&user_id])
            .await
            .map_err(|error| CoreError::Internal(format!("position list failed: {error}")))?;
        Ok(rows.iter().map(map_position_row).collect())
    }

    async fn apply_fill(
        &self,
        user_id: Uuid,
        symbol: &str,
        quantity_delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Position, CoreError> {
        let mut client = self.db.client().lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("position tx failed: {error}")))?;
        let existing = self.locked_row(&tx, user_id, symbol).await?;
        let now = Utc::now();
        let reserved = existing.as_ref().map(|p| p.reserved).unwrap_or(Decimal::ZERO);
        let (quantity, avg_cost): (Decimal, Decimal) = match existing {
            Some(p) if quantity_delta > Decimal::ZERO => {
                let total_cost = p.avg_cost * p.quantity + fill_price * quantity_delta;
                let new_quantity = p.quantity + quantity_delta;
                let new_avg_cost = if new_quantity.is_zero() { Decimal::ZERO } else { total_cost / new_quantity };
                (new_quantity, new_avg_cost)
            }
            Some(p) => ((p.quantity + quantity_delta).max(Decimal::ZERO), p.avg_cost),
            None if quantity_delta > Decimal::ZERO => (quantity_delta, fill_price),
            None => (Decimal::ZERO, Decimal::ZERO),
        };
        tx.execute(
            r#"
            INSERT INTO positions (user_id, symbol, quantity, avg_cost, reserved, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, symbol) DO UPDATE SET
                quantity = EXCLUDED.quantity, avg_cost = EXCLUDED.avg_cost, updated_at = EXCLUDED.updated_at
            "#,
            &[&user_id, &symbol, &quantity, &avg_cost, &reserved, &now],
        )
        .await
        .map_err(|error| CoreError::Internal(format!("position upsert failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("position commit failed: {error}")))?;
        Ok(Position {
            user_id,
            symbol: symbol.to_string(),
            quantity,
            avg_cost,
            reserved,
            updated_at: now,
        })
    }

    async fn reserve(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError> {
        let mut client = self.db.client().lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("position tx failed: {error}")))?;
        let current = self
            .locked_row(&tx, user_id, symbol)
            .await?
            .ok_or_else(|| CoreError::Conflict(format!("no position in {symbol}")))?;
        if current.quantity - current.reserved < quantity {
            return Err(CoreError::Conflict(format!("position {symbol} has insufficient unreserved quantity")));
        }
        let row = tx
            .query_one(
                "UPDATE positions SET reserved = reserved + $3, updated_at = now() WHERE user_id = $1 AND symbol = $2 RETURNING *",
                &[&user_id, &symbol, &quantity],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("position reserve failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("position commit failed: {error}")))?;
        Ok(map_position_row(&row))
    }

    async fn release_reservation(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError> {
        let mut client = self.db.client().lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("position tx failed: {error}")))?;
        self.locked_row(&tx, user_id, symbol)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("position {symbol}")))?;
        let row = tx
            .query_one(
                "UPDATE positions SET reserved = GREATEST(reserved - $3, 0), updated_at = now() WHERE user_id = $1 AND symbol = $2 RETURNING *",
                &[&user_id, &symbol, &quantity],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("position release failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("position commit failed: {error}")))?;
        Ok(map_position_row(&row))
    }

    async fn consume_reservation(&self, user_id: Uuid, symbol: &str, quantity: Decimal) -> Result<Position, CoreError> {
        let mut client = self.db.client().lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("position tx failed: {error}")))?;
        self.locked_row(&tx, user_id, symbol)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("position {symbol}")))?;
        let row = tx
            .query_one(
                "UPDATE positions SET reserved = GREATEST(reserved - $3, 0), updated_at = now() WHERE user_id = $1 AND symbol = $2 RETURNING *",
                &[&user_id, &symbol, &quantity],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("position consume failed: {error}")))?;
        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("position commit failed: {error}")))?;
        Ok(map_position_row(&row))
    }
}

fn map_position_row(row: &tokio_postgres::Row) -> Position {
    Position {
        user_id: row.get("user_id"),
        symbol: row.get("symbol"),
        quantity: row.get("quantity"),
        avg_cost: row.get("avg_cost"),
        reserved: row.get("reserved"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn position_accumulates_weighted_average_cost() {
        let store = MemoryPositionStore::new();
        let user_id = Uuid::new_v4();
        store.apply_fill(user_id, "VOO", Decimal::new(10, 0), Decimal::new(40000, 2)).await.unwrap();
        let position = store
            .apply_fill(user_id, "VOO", Decimal::new(10, 0), Decimal::new(42000, 2))
            .await
            .unwrap();
        assert_eq!(position.quantity, Decimal::new(20, 0));
        assert_eq!(position.avg_cost, Decimal::new(41000, 2));
    }

    #[tokio::test]
    async fn sell_fill_never_drives_quantity_negative() {
        let store = MemoryPositionStore::new();
        let user_id = Uuid::new_v4();
        store.apply_fill(user_id, "VOO", Decimal::new(5, 0), Decimal::new(40000, 2)).await.unwrap();
        let position = store
            .apply_fill(user_id, "VOO", Decimal::new(-10, 0), Decimal::new(40000, 2))
            .await
            .unwrap();
        assert_eq!(position.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reserve_then_release_returns_quantity_to_unreserved() {
        let store = MemoryPositionStore::new();
        let user_id = Uuid::new_v4();
        store.apply_fill(user_id, "VOO", Decimal::new(10, 0), Decimal::new(40000, 2)).await.unwrap();

        let reserved = store.reserve(user_id, "VOO", Decimal::new(6, 0)).await.unwrap();
        assert_eq!(reserved.reserved, Decimal::new(6, 0));

        let result = store.reserve(user_id, "VOO", Decimal::new(5, 0)).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));

        let released = store.release_reservation(user_id, "VOO", Decimal::new(6, 0)).await.unwrap();
        assert_eq!(released.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reserve_against_unknown_position_is_a_conflict() {
        let store = MemoryPositionStore::new();
        let result = store.reserve(Uuid::new_v4(), "VOO", Decimal::new(1, 0)).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }
}
