use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// The single closed error enum threaded through every subsystem. Every
/// business-level failure in the crate is mapped into one of these variants
/// before it crosses a service boundary; nothing downstream dispatches on
/// message text.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already processed")]
    AlreadyProcessed,
    #[error("locked: {0}")]
    Locked(String),
    #[error("rate limited")]
    RateLimited,
    #[error("upstream transient: {0}")]
    UpstreamTransient(String),
    #[error("upstream permanent: {0}")]
    UpstreamPermanent(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::AlreadyProcessed => "already_processed",
            Self::Locked(_) => "locked",
            Self::RateLimited => "rate_limited",
            Self::UpstreamTransient(_) => "upstream_transient",
            Self::UpstreamPermanent(_) => "upstream_permanent",
            Self::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AlreadyProcessed => StatusCode::OK,
            Self::Locked(_) => StatusCode::LOCKED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamPermanent(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Adapter errors and job-retry decisions dispatch on this, never on
    /// `.to_string()` content.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient(_))
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// `{ code, message, details? }` per the external error envelope.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&CoreError> for ApiErrorBody {
    fn from(error: &CoreError) -> Self {
        Self {
            code: error.code(),
            message: sanitized_message(error),
            details: None,
        }
    }
}

/// Adapter errors are never surfaced verbatim; everything internal gets a
/// stable, non-leaky message.
fn sanitized_message(error: &CoreError) -> String {
    match error {
        CoreError::Internal(_) | CoreError::UpstreamTransient(_) => {
            "an internal error occurred, please retry".to_string()
        }
        // upstream_permanent carries a per-chain/per-order failure reason that
        // §7 requires surfacing to the caller, not a raw adapter message.
        other => other.message(),
    }
}

/// Every route handler returns `Result<_, CoreError>`; this is the single
/// place a `CoreError` becomes an HTTP response.
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = ApiErrorBody::from(&self);
        (status, Json(body)).into_response()
    }
}
