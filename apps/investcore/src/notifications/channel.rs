use std::time::Duration;

use async_trait::async_trait;

use crate::adapters::{with_timeout, AdapterError};

/// One rendered, channel-agnostic notification. Template rendering is out
/// of scope (§1 Non-goals); the fanout only picks a channel and hands it a
/// plain subject/body pair.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Delivery side of a notification channel, analogous to the outbound
/// adapter traits in `adapters::brokerage`/`adapters::offramp`.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), AdapterError>;
}

pub struct HttpEmailChannel {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEmailChannel {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Channel for HttpEmailChannel {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}/v1/send", self.base_url))
                .json(&serde_json::json!({
                    "to": payload.recipient,
                    "subject": payload.subject,
                    "body": payload.body,
                }))
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            classify_status(response.status())
        })
        .await
    }
}

pub struct HttpSmsChannel {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSmsChannel {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Channel for HttpSmsChannel {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), AdapterError> {
        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .json(&serde_json::json!({
                    "to": payload.recipient,
                    "body": payload.body,
                }))
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            classify_status(response.status())
        })
        .await
    }
}

/// Records sends in memory instead of calling out; used in tests and local
/// dev the same way `MockBrokerageAdapter`/`MockOffRampAdapter` stand in
/// for their HTTP counterparts.
pub struct MockChannel {
    pub sent: tokio::sync::Mutex<Vec<NotificationPayload>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), AdapterError> {
        self.sent.lock().await.push(payload.clone());
        Ok(())
    }
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), AdapterError> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() {
        return Err(AdapterError::Transient(format!("notification provider {status}")));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AdapterError::Auth(format!("notification provider {status}")));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::RateLimited("notification provider rate limited".into()));
    }
    Err(AdapterError::Permanent(format!("notification provider {status}")))
}

fn classify_reqwest_error(error: reqwest::Error) -> AdapterError {
    if error.is_timeout() || error.is_connect() {
        AdapterError::Transient(error.to_string())
    } else {
        AdapterError::Permanent(error.to_string())
    }
}
