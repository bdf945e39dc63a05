use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{with_timeout, AdapterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WalletAccountType {
    Eoa,
    Sca,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderWallet {
    pub provider_id: String,
    pub address: String,
    pub status: String,
}

#[async_trait]
pub trait WalletProviderAdapter: Send + Sync {
    async fn create_wallet_set(&self, user_id: &str) -> Result<String, AdapterError>;

    async fn create_wallet(
        &self,
        wallet_set: &str,
        chain: &str,
        account_type: WalletAccountType,
    ) -> Result<ProviderWallet, AdapterError>;

    async fn get_wallet(&self, provider_id: &str) -> Result<ProviderWallet, AdapterError>;

    async fn health_check(&self) -> Result<(), AdapterError>;
}

pub struct HttpWalletProviderAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    supported_chains: Vec<String>,
}

impl HttpWalletProviderAdapter {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64, supported_chains: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
            supported_chains,
        }
    }
}

#[async_trait]
impl WalletProviderAdapter for HttpWalletProviderAdapter {
    async fn create_wallet_set(&self, user_id: &str) -> Result<String, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}/v1/w3s/developer/walletSets", self.base_url))
                .json(&serde_json::json!({ "name": format!("user-{user_id}") }))
                .send()
                .await
                .map_err(|error| classify(&error))?;
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|error| AdapterError::Permanent(error.to_string()))?;
            body.get("walletSetId")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| AdapterError::Permanent("missing walletSetId".to_string()))
        })
        .await
    }

    async fn create_wallet(
        &self,
        wallet_set: &str,
        chain: &str,
        account_type: WalletAccountType,
    ) -> Result<ProviderWallet, AdapterError> {
        if !self.supported_chains.iter().any(|c| c == chain) {
            return Err(AdapterError::Permanent(format!("unsupported chain: {chain}")));
        }
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}/v1/w3s/developer/wallets", self.base_url))
                .json(&serde_json::json!({
                    "walletSetId": wallet_set,
                    "blockchain": chain,
                    "accountType": account_type,
                }))
                .send()
                .await
                .map_err(|error| classify(&error))?;
            parse_wallet_response(response).await
        })
        .await
    }

    async fn get_wallet(&self, provider_id: &str) -> Result<ProviderWallet, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .get(format!("{}/v1/w3s/wallets/{provider_id}", self.base_url))
                .send()
                .await
                .map_err(|error| classify(&error))?;
            parse_wallet_response(response).await
        })
        .await
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        with_timeout(self.timeout, async {
            self.client
                .get(format!("{}/v1/ping", self.base_url))
                .send()
                .await
                .map_err(|error| classify(&error))?;
            Ok(())
        })
        .await
    }
}

async fn parse_wallet_response(response: reqwest::Response) -> Result<ProviderWallet, AdapterError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(AdapterError::Transient(format!("wallet provider {status}")));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AdapterError::Auth("wallet provider unauthorized".into()));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::RateLimited("wallet provider rate limited".into()));
    }
    if status.is_client_error() {
        return Err(AdapterError::Permanent(format!("wallet provider {status}")));
    }
    response
        .json()
        .await
        .map_err(|error| AdapterError::Permanent(format!("bad wallet response body: {error}")))
}

fn classify(error: &reqwest::Error) -> AdapterError {
    if error.is_timeout() || error.is_connect() {
        AdapterError::Transient(error.to_string())
    } else {
        AdapterError::Permanent(error.to_string())
    }
}

/// In-memory provider used by tests and by the vignette binary. Chains not
/// in `supported_chains` fail permanently; chains in `flaky_once` fail
/// transiently on the first call and succeed after, to exercise the
/// Wallet Provisioning Worker's retry path deterministically.
pub struct MockWalletProviderAdapter {
    supported_chains: Vec<String>,
    flaky_once: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl MockWalletProviderAdapter {
    pub fn new(supported_chains: Vec<String>, flaky_once: Vec<String>) -> Self {
        Self {
            supported_chains,
            flaky_once: std::sync::Mutex::new(flaky_once.into_iter().collect()),
        }
    }
}

#[async_trait]
impl WalletProviderAdapter for MockWalletProviderAdapter {
    async fn create_wallet_set(&self, user_id: &str) -> Result<String, AdapterError> {
        Ok(format!("walletset-{user_id}"))
    }

    async fn create_wallet(
        &self,
        wallet_set: &str,
        chain: &str,
        _account_type: WalletAccountType,
    ) -> Result<ProviderWallet, AdapterError> {
        if !self.supported_chains.iter().any(|c| c == chain) {
            return Err(AdapterError::Permanent(format!("unsupported chain: {chain}")));
        }
        {
            let mut flaky = self.flaky_once.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if flaky.remove(chain) {
                return Err(AdapterError::Transient(format!("{chain} momentarily unavailable")));
            }
        }
        Ok(ProviderWallet {
            provider_id: format!("{wallet_set}-{chain}"),
            address: format!("addr-{chain}-{wallet_set}"),
            status: "live".to_string(),
        })
    }

    async fn get_wallet(&self, provider_id: &str) -> Result<ProviderWallet, AdapterError> {
        Ok(ProviderWallet {
            provider_id: provider_id.to_string(),
            address: format!("addr-{provider_id}"),
            status: "live".to_string(),
        })
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
