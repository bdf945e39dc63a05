use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{with_timeout, AdapterError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub account_id: String,
    pub routing_number: String,
    pub account_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account_id: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait OffRampAdapter: Send + Sync {
    async fn create_account(&self, user_id: &str) -> Result<String, AdapterError>;
    async fn get_kyc_link(&self, account_id: &str) -> Result<String, AdapterError>;
    async fn link_wallet(&self, account_id: &str, address: &str) -> Result<(), AdapterError>;
    async fn create_virtual_account(&self, account_id: &str) -> Result<VirtualAccount, AdapterError>;
    async fn create_transfer(&self, request: TransferRequest) -> Result<Transfer, AdapterError>;
    async fn get_transfer(&self, transfer_id: &str) -> Result<Transfer, AdapterError>;
}

pub struct HttpOffRampAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpOffRampAdapter {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}{path}", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(classify)?;
            parse(response).await
        })
        .await
    }
}

#[async_trait]
impl OffRampAdapter for HttpOffRampAdapter {
    async fn create_account(&self, user_id: &str) -> Result<String, AdapterError> {
        let body: serde_json::Value = self
            .post("/v1/accounts", serde_json::json!({ "external_id": user_id }))
            .await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Permanent("missing account id".to_string()))
    }

    async fn get_kyc_link(&self, account_id: &str) -> Result<String, AdapterError> {
        let body: serde_json::Value = self
            .post(&format!("/v1/accounts/{account_id}/kyc_link"), serde_json::json!({}))
            .await?;
        body.get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Permanent("missing kyc link url".to_string()))
    }

    async fn link_wallet(&self, account_id: &str, address: &str) -> Result<(), AdapterError> {
        let _: serde_json::Value = self
            .post(
                &format!("/v1/accounts/{account_id}/wallets"),
                serde_json::json!({ "address": address }),
            )
            .await?;
        Ok(())
    }

    async fn create_virtual_account(&self, account_id: &str) -> Result<VirtualAccount, AdapterError> {
        self.post(&format!("/v1/accounts/{account_id}/virtual_accounts"), serde_json::json!({}))
            .await
    }

    async fn create_transfer(&self, request: TransferRequest) -> Result<Transfer, AdapterError> {
        let body = serde_json::to_value(&request)
            .map_err(|error| AdapterError::Permanent(format!("bad transfer request: {error}")))?;
        self.post("/v1/transfers", body).await
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<Transfer, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .get(format!("{}/v1/transfers/{transfer_id}", self.base_url))
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
        return Err(AdapterError::Transient(format!("off-ramp provider {status}")));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AdapterError::Auth("off-ramp provider unauthorized".into()));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::RateLimited("off-ramp provider rate limited".into()));
    }
    if status.is_client_error() {
        return Err(AdapterError::Permanent(format!("off-ramp provider {status}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|error| AdapterError::Permanent(format!("bad off-ramp response body: {error}")))
}

fn classify(error: reqwest::Error) -> AdapterError {
    if error.is_timeout() || error.is_connect() {
        AdapterError::Transient(error.to_string())
    } else {
        AdapterError::Permanent(error.to_string())
    }
}

pub struct MockOffRampAdapter;

#[async_trait]
impl OffRampAdapter for MockOffRampAdapter {
    async fn create_account(&self, user_id: &str) -> Result<String, AdapterError> {
        Ok(format!("offramp-acct-{user_id}"))
    }

    async fn get_kyc_link(&self, account_id: &str) -> Result<String, AdapterError> {
        Ok(format!("https://offramp.example/kyc/{account_id}"))
    }

    async fn link_wallet(&self, _account_id: &str, _address: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn create_virtual_account(&self, account_id: &str) -> Result<VirtualAccount, AdapterError> {
        Ok(VirtualAccount {
            account_id: account_id.to_string(),
            routing_number: "021000021".to_string(),
            account_number: format!("va-{account_id}"),
        })
    }

    async fn create_transfer(&self, request: TransferRequest) -> Result<Transfer, AdapterError> {
        Ok(Transfer {
            transfer_id: format!("transfer-{}", uuid::Uuid::new_v4()),
            status: TransferStatus::Pending,
            amount: request.amount,
            failure_reason: None,
        })
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<Transfer, AdapterError> {
        Ok(Transfer {
            transfer_id: transfer_id.to_string(),
            status: TransferStatus::Completed,
            amount: Decimal::ZERO,
            failure_reason: None,
        })
    }
}
