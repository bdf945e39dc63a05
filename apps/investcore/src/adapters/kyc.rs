use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{with_timeout, AdapterError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycDocs {
    pub document_type: String,
    pub document_front_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_back_url: Option<String>,
    pub selfie_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycInitiation {
    pub provider_ref: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatusReport {
    Pending,
    Processing,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycCallback {
    pub provider_ref: String,
    pub status: KycStatusReport,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[async_trait]
pub trait KycAdapter: Send + Sync {
    async fn initiate(
        &self,
        user_id: &str,
        docs: &KycDocs,
    ) -> Result<KycInitiation, AdapterError>;

    async fn get_status(&self, provider_ref: &str) -> Result<KycStatusReport, AdapterError>;

    async fn accept_callback(
        &self,
        payload: &serde_json::Value,
    ) -> Result<KycCallback, AdapterError>;
}

pub struct HttpKycAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpKycAdapter {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl KycAdapter for HttpKycAdapter {
    async fn initiate(
        &self,
        user_id: &str,
        docs: &KycDocs,
    ) -> Result<KycInitiation, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}/v1/applicants", self.base_url))
                .json(&serde_json::json!({ "external_user_id": user_id, "docs": docs }))
                .send()
                .await
                .map_err(|error| classify_reqwest_error(&error))?;
            parse_json::<KycInitiation>(response).await
        })
        .await
    }

    async fn get_status(&self, provider_ref: &str) -> Result<KycStatusReport, AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .get(format!("{}/v1/applicants/{provider_ref}", self.base_url))
                .send()
                .await
                .map_err(|error| classify_reqwest_error(&error))?;
            parse_json::<KycStatusReport>(response).await
        })
        .await
    }

    async fn accept_callback(
        &self,
        payload: &serde_json::Value,
    ) -> Result<KycCallback, AdapterError> {
        serde_json::from_value(payload.clone())
            .map_err(|error| AdapterError::Permanent(format!("malformed kyc callback: {error}")))
    }
}

/// Deterministic adapter used in tests and local dev: approves any applicant
/// whose docs carry `document_type == "passport"`.
pub struct MockKycAdapter;

#[async_trait]
impl KycAdapter for MockKycAdapter {
    async fn initiate(
        &self,
        user_id: &str,
        _docs: &KycDocs,
    ) -> Result<KycInitiation, AdapterError> {
        Ok(KycInitiation {
            provider_ref: format!("kyc-{user_id}"),
            redirect_url: format!("https://kyc.example/redirect/{user_id}"),
        })
    }

    async fn get_status(&self, _provider_ref: &str) -> Result<KycStatusReport, AdapterError> {
        Ok(KycStatusReport::Processing)
    }

    async fn accept_callback(
        &self,
        payload: &serde_json::Value,
    ) -> Result<KycCallback, AdapterError> {
        let review_answer = payload
            .get("reviewAnswer")
            .and_then(|v| v.as_str())
            .unwrap_or("RED");
        let provider_ref = payload
            .get("provider_ref")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Permanent("missing provider_ref".to_string()))?
            .to_string();
        let status = match review_answer {
            "GREEN" => KycStatusReport::Approved,
            "RED" => KycStatusReport::Rejected,
            _ => KycStatusReport::Processing,
        };
        Ok(KycCallback {
            provider_ref,
            status,
            reasons: vec![],
        })
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, AdapterError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(AdapterError::Transient(format!("kyc provider {status}")));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AdapterError::Auth(format!("kyc provider {status}")));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::RateLimited("kyc provider rate limited".into()));
    }
    if status.is_client_error() {
        return Err(AdapterError::Permanent(format!("kyc provider {status}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|error| AdapterError::Permanent(format!("bad kyc response body: {error}")))
}

fn classify_reqwest_error(error: &reqwest::Error) -> AdapterError {
    if error.is_timeout() || error.is_connect() {
        AdapterError::Transient(error.to_string())
    } else {
        AdapterError::Permanent(error.to_string())
    }
}
