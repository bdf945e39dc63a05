pub mod brokerage;
pub mod kyc;
pub mod offramp;
pub mod wallet;

use std::time::Duration;

/// Closed error-kind set every outbound adapter returns. Retry decisions
/// dispatch on the variant, never on message text (§9 Design Notes).
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_) | Self::Timeout(_))
    }
}

impl From<AdapterError> for crate::error::CoreError {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Transient(msg) | AdapterError::Timeout(_) | AdapterError::RateLimited(msg) => {
                crate::error::CoreError::UpstreamTransient(msg_or(&error, msg))
            }
            AdapterError::Permanent(msg) => crate::error::CoreError::UpstreamPermanent(msg),
            AdapterError::Auth(msg) => crate::error::CoreError::UpstreamPermanent(msg),
        }
    }
}

fn msg_or(error: &AdapterError, fallback: String) -> String {
    if fallback.is_empty() {
        error.to_string()
    } else {
        fallback
    }
}

/// Wraps a future with the adapter's per-call timeout; a miss is classified
/// as a transient, retryable `AdapterError::Timeout` (§5 Timeouts).
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T, AdapterError>
where
    F: std::future::Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(duration)),
    }
}
