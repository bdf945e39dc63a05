use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{with_timeout, AdapterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerageOrderStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokeragePlacement {
    pub brokerage_ref: String,
    pub status: BrokerageOrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub tradable: bool,
    pub fractionable: bool,
}

#[async_trait]
pub trait BrokerageAdapter: Send + Sync {
    async fn place_order(
        &self,
        basket_id: &str,
        side: OrderSide,
        notional: Decimal,
    ) -> Result<BrokeragePlacement, AdapterError>;

    async fn get_order_status(&self, brokerage_ref: &str) -> Result<BrokerageOrderStatus, AdapterError>;

    async fn list_assets(&self) -> Result<Vec<Asset>, AdapterError>;

    async fn get_asset(&self, symbol: &str) -> Result<Asset, AdapterError>;
}

pub struct HttpBrokerageAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBrokerageAdapter {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl BrokerageAdapter for HttpBrokerageAdapter {
    async fn place_order(
        &self,
        basket_id: &str,
        side: OrderSide,
        notional: Decimal,
    ) -> Result<BrokeragePlacement, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}/v2/orders", self.base_url))
                .json(&serde_json::json!({
                    "basket_id": basket_id,
                    "side": side,
                    "notional": notional,
                }))
                .send()
                .await
                .map_err(classify)?;
            parse(response).await
        })
        .await
    }

    async fn get_order_status(&self, brokerage_ref: &str) -> Result<BrokerageOrderStatus, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .get(format!("{}/v2/orders/{brokerage_ref}", self.base_url))
                .send()
                .await
                .map_err(classify)?;
            parse(response).await
        })
        .await
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .get(format!("{}/v2/assets", self.base_url))
                .send()
                .await
                .map_err(classify)?;
            parse(response).await
        })
        .await
    }

    async fn get_asset(&self, symbol: &str) -> Result<Asset, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .get(format!("{}/v2/assets/{symbol}", self.base_url))
                .send()
                .await
                .map_err(classify)?;
            parse(response).await
        })
        .await
    }
}

async fn parse<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, AdapterError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(AdapterError::Transient(format!("brokerage {status}")));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AdapterError::Auth("brokerage unauthorized".into()));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::RateLimited("brokerage rate limited".into()));
    }
    if status.is_client_error() {
        return Err(AdapterError::Permanent(format!("brokerage {status}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|error| AdapterError::Permanent(format!("bad brokerage response body: {error}")))
}

fn classify(error: reqwest::Error) -> AdapterError {
    if error.is_timeout() || error.is_connect() {
        AdapterError::Transient(error.to_string())
    } else {
        AdapterError::Permanent(error.to_string())
    }
}

pub struct MockBrokerageAdapter;

#[async_trait]
impl BrokerageAdapter for MockBrokerageAdapter {
    async fn place_order(
        &self,
        basket_id: &str,
        _side: OrderSide,
        _notional: Decimal,
    ) -> Result<BrokeragePlacement, AdapterError> {
        Ok(BrokeragePlacement {
            brokerage_ref: format!("brokerage-{basket_id}-{}", uuid::Uuid::new_v4()),
            status: BrokerageOrderStatus::Accepted,
            reject_reason: None,
        })
    }

    async fn get_order_status(&self, _brokerage_ref: &str) -> Result<BrokerageOrderStatus, AdapterError> {
        Ok(BrokerageOrderStatus::Accepted)
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, AdapterError> {
        Ok(vec![Asset {
            symbol: "VOO".to_string(),
            tradable: true,
            fractionable: true,
        }])
    }

    async fn get_asset(&self, symbol: &str) -> Result<Asset, AdapterError> {
        Ok(Asset {
            symbol: symbol.to_string(),
            tradable: true,
            fractionable: true,
        })
    }
}
