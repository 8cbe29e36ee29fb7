use std::time::Duration;

use bytes::Bytes;
use cordwire_models::message::SendFile;
use cordwire_util::validation::validate_audit_log_reason;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::HttpError;

pub const AUDIT_LOG_REASON_HEADER: &str = "x-audit-log-reason";

#[derive(Debug, Clone, Default)]
pub(crate) enum RequestBody {
    #[default]
    Empty,
    Json(Bytes),
    Multipart {
        payload_json: Bytes,
        files: Vec<SendFile>,
    },
}

/// Per-request options. Everything is kept in a form that can be replayed,
/// since a retried request is rebuilt from scratch.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub(crate) body: RequestBody,
    pub(crate) query: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, HttpError> {
        self.body = RequestBody::Json(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// Multipart body: `payload` becomes the `payload_json` part, followed by
    /// one `file{i}` part per file. Without files this is a plain JSON body.
    pub fn multipart<T: Serialize + ?Sized>(
        mut self,
        payload: &T,
        files: Vec<SendFile>,
    ) -> Result<Self, HttpError> {
        let payload_json = Bytes::from(serde_json::to_vec(payload)?);
        self.body = if files.is_empty() {
            RequestBody::Json(payload_json)
        } else {
            RequestBody::Multipart {
                payload_json,
                files,
            }
        };
        Ok(self)
    }

    /// URL query from a serializable record. Fields skipped by
    /// `skip_serializing_if` are omitted.
    pub fn query<Q: Serialize + ?Sized>(mut self, query: &Q) -> Result<Self, HttpError> {
        let encoded = serde_urlencoded::to_string(query)?;
        self.query = (!encoded.is_empty()).then_some(encoded);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self, HttpError> {
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(self)
    }

    /// `X-Audit-Log-Reason`, percent-encoded so non-ASCII survives.
    pub fn reason(mut self, reason: &str) -> Result<Self, HttpError> {
        validate_audit_log_reason(reason)?;
        let encoded = urlencoding::encode(reason);
        self.headers.insert(
            HeaderName::from_static(AUDIT_LOG_REASON_HEADER),
            HeaderValue::from_str(&encoded)?,
        );
        Ok(self)
    }

    pub fn maybe_reason(self, reason: Option<&str>) -> Result<Self, HttpError> {
        match reason {
            Some(reason) => self.reason(reason),
            None => Ok(self),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancel only this request; the client's own token still applies.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
