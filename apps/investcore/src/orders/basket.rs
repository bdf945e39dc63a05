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
pub enum RiskLevel {
    Conservative,
    Balanced,
    Growth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketConstituent {
    pub symbol: String,
    pub weight: Decimal,
}

/// Admin-curated allocation (§3 Basket). `constituents` weights must be
/// positive and sum to 1.0 within `WEIGHT_TOLERANCE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Basket {
    pub id: Uuid,
    pub name: String,
    pub risk_level: RiskLevel,
    pub constituents: Vec<BasketConstituent>,
    pub created_at: DateTime<Utc>,
}

fn weight_tolerance() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn validate_constituents(constituents: &[BasketConstituent]) -> Result<(), CoreError> {
    if constituents.is_empty() {
        return Err(CoreError::Validation("basket must have at least one constituent".to_string()));
    }
    let tolerance = weight_tolerance();
    let mut sum = Decimal::ZERO;
    for c in constituents {
        if c.weight <= Decimal::ZERO {
            return Err(CoreError::Validation(format!("weight for {} must be positive", c.symbol)));
        }
        sum += c.weight;
    }
    if (sum - Decimal::ONE).abs() > tolerance {
        return Err(CoreError::Validation(format!(
            "basket weights sum to {sum}, expected 1.0 within {tolerance}"
        )));
    }
    Ok(())
}

#[async_trait]
pub trait BasketStore: Send + Sync {
    async fn create(
        &self,
        name: &str,
        risk_level: RiskLevel,
        constituents: Vec<BasketConstituent>,
    ) -> Result<Basket, CoreError>;

    async fn get(&self, basket_id: Uuid) -> Result<Option<Basket>, CoreError>;

    async fn list(&self) -> Result<Vec<Basket>, CoreError>;
}

pub struct MemoryBasketStore {
    baskets: Mutex<HashMap<Uuid, Basket>>,
}

impl MemoryBasketStore {
    pub fn new() -> Self {
        Self {
            baskets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBasketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BasketStore for MemoryBasketStore {
    async fn create(
        &self,
        name: &str,
        risk_level: RiskLevel,
        constituents: Vec<BasketConstituent>,
    ) -> Result<Basket, CoreError> {
        validate_constituents(&constituents)?;
        let basket = Basket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            risk_level,
            constituents,
            created_at: Utc::now(),
        };
        self.baskets.lock().await.insert(basket.id, basket.clone());
        Ok(basket)
    }

    async fn get(&self, basket_id: Uuid) -> Result<Option<Basket>, CoreError> {
        Ok(self.baskets.lock().await.get(&basket_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Basket>, CoreError> {
        Ok(self.baskets.lock().await.values().cloned().collect())
    }
}

pub struct PostgresBasketStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresBasketStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BasketStore for PostgresBasketStore {
    async fn create(
        &self,
        name: &str,
        risk_level: RiskLevel,
        constituents: Vec<BasketConstituent>,
    ) -> Result<Basket, CoreError> {
        validate_constituents(&constituents)?;
        let risk_level_str = match risk_level {
            RiskLevel::Conservative => "conservative",
            RiskLevel::Balanced => "balanced",
            RiskLevel::Growth => "growth",
        };
        let constituents_json = serde_json::to_value(&constituents)
            .map_err(|error| CoreError::Internal(format!("failed to encode constituents: {error}")))?;
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO baskets (id, name, risk_level, constituents, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, name, risk_level, constituents, created_at
                "#,
                &[&Uuid::new_v4(), &name, &risk_level_str, &constituents_json, &Utc::now()],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("basket insert failed: {error}")))?;
        map_basket_row(&row)
    }

    async fn get(&self, basket_id: Uuid) -> Result<Option<Basket>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM baskets WHERE id = $1", &[&basket_id])
            .await
            .map_err(|error| CoreError::Internal(format!("basket lookup failed: {error}")))?;
        row.as_ref().map(map_basket_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Basket>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query("SELECT * FROM baskets ORDER BY created_at ASC", &[])
            .await
            .map_err(|error| CoreError::Internal(format!("basket list failed: {error}")))?;
        rows.iter().map(map_basket_row).collect()
    }
}

fn map_basket_row(row: &tokio_postgres::Row) -> Result<Basket, CoreError> {
    let risk_level_str: String = row.get("risk_level");
    let constituents_json: serde_json::Value = row.get("constituents");
    let constituents: Vec<BasketConstituent> = serde_json::from_value(constituents_json)
        .map_err(|error| CoreError::Internal(format!("malformed basket constituents: {error}")))?;
    Ok(Basket {
        id: row.get("id"),
        name: row.get("name"),
        risk_level: match risk_level_str.as_str() {
            "conservative" => RiskLevel::Conservative,
            "growth" => RiskLevel::Growth,
            _ => RiskLevel::Balanced,
        },
        constituents,
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voo_spy() -> Vec<BasketConstituent> {
        vec![
            BasketConstituent { symbol: "VOO".to_string(), weight: Decimal::new(6, 1) },
            BasketConstituent { symbol: "SPY".to_string(), weight: Decimal::new(4, 1) },
        ]
    }

    #[tokio::test]
    async fn rejects_weights_that_do_not_sum_to_one() {
        let store = MemoryBasketStore::new();
        let bad = vec![BasketConstituent { symbol: "VOO".to_string(), weight: Decimal::new(5, 1) }];
        let result = store.create("half-fund", RiskLevel::Balanced, bad).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn accepts_weights_within_tolerance() {
        let store = MemoryBasketStore::new();
        let basket = store.create("index-mix", RiskLevel::Growth, voo_spy()).await.unwrap();
        assert_eq!(basket.constituents.len(), 2);
    }
}
