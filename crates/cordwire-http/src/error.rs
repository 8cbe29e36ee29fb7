use cordwire_util::ValidationError;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Non-success response decoded from Discord's JSON error body.
#[derive(Debug, Clone, Error)]
#[error("HTTP {status}: {message} (code {code})")]
pub struct HttpStatusError {
    pub status: StatusCode,
    /// Discord's JSON error code; 0 when the body carried none.
    pub code: u64,
    pub message: String,
    /// Free-form per-field errors, when present.
    pub errors: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Option<Value>,
}

impl HttpStatusError {
    pub fn from_body(status: StatusCode, body: &[u8]) -> Self {
        let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
        let message = if parsed.message.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        } else {
            parsed.message
        };
        Self {
            status,
            code: parsed.code,
            message,
            errors: parsed.errors,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Status(#[from] HttpStatusError),
    #[error("failed to decode response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cancelled while waiting for rate limit")]
    RateLimitCancelled,
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("multipart body: {0}")]
    Multipart(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("query encoding: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

impl HttpError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(err) => Some(err.status),
            _ => None,
        }
    }

    /// True for errors caused by the caller cancelling, as opposed to failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::RateLimitCancelled | Self::Cancelled)
    }
}
