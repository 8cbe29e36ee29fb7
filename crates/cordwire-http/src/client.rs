use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::error::{HttpError, HttpStatusError};
use crate::multipart;
use crate::path::PathKey;
use crate::request::{RequestBody, RequestOptions};
use crate::transport::{RateLimitedTransport, Transport};

/// Delay before retrying a 5xx or transport failure; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// REST request engine: authorization, rate limiting and retries.
///
/// Cheap to clone; clones share the transport and rate-limit state.
#[derive(Debug)]
pub struct Client<T = Transport> {
    transport: Arc<T>,
    config: Arc<HttpConfig>,
    authorization: Option<HeaderValue>,
    base_url: Url,
    cancel: CancellationToken,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            authorization: self.authorization.clone(),
            base_url: self.base_url.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl Client<Transport> {
    pub fn new(token: &str, config: HttpConfig) -> Result<Self, HttpError> {
        let transport = Transport::new(&config)?;
        Self::with_transport(token, config, transport)
    }
}

impl<T: RateLimitedTransport> Client<T> {
    pub fn with_transport(token: &str, config: HttpConfig, transport: T) -> Result<Self, HttpError> {
        Self::from_shared(token, config, Arc::new(transport))
    }

    pub fn from_shared(token: &str, config: HttpConfig, transport: Arc<T>) -> Result<Self, HttpError> {
        let authorization = if token.trim().is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(&config.authorization(token))?;
            value.set_sensitive(true);
            Some(value)
        };
        // A trailing slash makes `Url::join` append instead of replace.
        let base_url = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))?;
        Ok(Self {
            transport,
            config: Arc::new(config),
            authorization,
            base_url,
            cancel: CancellationToken::new(),
        })
    }

    /// Tie every request of this client to `cancel`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Send a request, retrying 429, 5xx and transport failures up to
    /// `max_retries` times. Non-2xx responses become [`HttpError::Status`].
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response, HttpError> {
        let key = PathKey::new(path);
        let url = self.url(path, options.query.as_deref())?;
        let cancel = match &options.cancel {
            Some(token) => combine(&self.cancel, token),
            None => self.cancel.child_token(),
        };
        // Ends the watcher spawned by `combine` once this call returns.
        let _done = cancel.clone().drop_guard();

        let attempts = self.config.max_retries.saturating_add(1);
        let mut last_err = HttpError::Cancelled;
        for attempt in 0..attempts {
            let ticket = self.transport.acquire(&key, &cancel).await?;
            let request = self.build(method.clone(), url.clone(), &options)?;

            tracing::trace!(%method, path = %key, attempt, "sending request");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Cancelled),
                result = self.transport.execute(request) => result,
            };

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    drop(ticket);
                    tracing::debug!(%method, path = %key, attempt, error = %err, "request failed");
                    last_err = HttpError::Request(err);
                    self.retry_delay(attempt, attempts, &cancel).await?;
                    continue;
                }
            };

            let status = response.status();
            let headers = response.headers().clone();
            self.transport.release(ticket, status, &headers);

            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Cancelled),
                body = response.bytes() => body,
            };
            let body = match body {
                Ok(body) => body,
                Err(err) => {
                    last_err = HttpError::Request(err);
                    self.retry_delay(attempt, attempts, &cancel).await?;
                    continue;
                }
            };

            if status.is_success() {
                return Ok(Response {
                    status,
                    headers,
                    body,
                });
            }

            let err = HttpStatusError::from_body(status, &body);
            if status == StatusCode::TOO_MANY_REQUESTS {
                // The limiter already knows how long to wait.
                tracing::debug!(%method, path = %key, attempt, "429, retrying");
                last_err = err.into();
                continue;
            }
            if status.is_server_error() {
                tracing::debug!(%method, path = %key, attempt, %status, "server error, retrying");
                last_err = err.into();
                self.retry_delay(attempt, attempts, &cancel).await?;
                continue;
            }
            return Err(err.into());
        }

        tracing::warn!(%method, path = %key, attempts, error = %last_err, "giving up after retries");
        Err(last_err)
    }

    /// Decode a JSON response into `out`. A 204 leaves `out` untouched.
    pub async fn request_json<R: DeserializeOwned>(
        &self,
        out: &mut R,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<(), HttpError> {
        let response = self.request(method, path, options).await?;
        if response.status != StatusCode::NO_CONTENT {
            *out = response.json()?;
        }
        Ok(())
    }

    /// Like [`Client::request_json`] but returns the decoded value.
    pub async fn json<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<R, HttpError> {
        self.request(method, path, options).await?.json()
    }

    /// Send a request and discard the body.
    pub async fn fast_request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<(), HttpError> {
        self.request(method, path, options).await.map(|_| ())
    }

    fn url(&self, path: &str, query: Option<&str>) -> Result<Url, HttpError> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if let Some(query) = query {
            url.set_query(Some(query));
        }
        Ok(url)
    }

    fn build(
        &self,
        method: Method,
        url: Url,
        options: &RequestOptions,
    ) -> Result<reqwest::Request, HttpError> {
        let mut request = reqwest::Request::new(method, url);
        let headers = request.headers_mut();
        if let Some(auth) = &self.authorization {
            headers.insert(AUTHORIZATION, auth.clone());
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }

        match &options.body {
            RequestBody::Empty => {}
            RequestBody::Json(body) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                *request.body_mut() = Some(reqwest::Body::from(body.clone()));
            }
            RequestBody::Multipart {
                payload_json,
                files,
            } => {
                let multipart = multipart::build(payload_json.clone(), files)?;
                request
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_str(&multipart.content_type)?);
                *request.body_mut() = Some(multipart.body);
            }
        }

        if let Some(timeout) = options.timeout {
            *request.timeout_mut() = Some(timeout);
        }
        Ok(request)
    }

    async fn retry_delay(
        &self,
        attempt: u32,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<(), HttpError> {
        if attempt + 1 >= attempts {
            return Ok(());
        }
        let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.min(6));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Token cancelled when either parent is.
fn combine(client: &CancellationToken, request: &CancellationToken) -> CancellationToken {
    let combined = client.child_token();
    let request = request.clone();
    let child = combined.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = request.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
    combined
}
