use std::future::Future;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::error::HttpError;
use crate::path::PathKey;
use crate::ratelimit::{RateLimiter, Release, Ticket};

/// What the request engine needs from the layer below it: rate-limit
/// bookkeeping around a raw HTTP round trip.
pub trait RateLimitedTransport: Send + Sync + 'static {
    fn acquire(
        &self,
        key: &PathKey,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Ticket, HttpError>> + Send;

    fn release(&self, ticket: Ticket, status: StatusCode, headers: &HeaderMap) -> Release;

    fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response, reqwest::Error>> + Send;
}

/// `reqwest` client paired with a (possibly shared) [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct Transport {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl Transport {
    pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
        Self::with_limiter(config, Arc::new(RateLimiter::new()))
    }

    /// Build a transport that competes for the same buckets as others
    /// holding `limiter`.
    pub fn with_limiter(config: &HttpConfig, limiter: Arc<RateLimiter>) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { http, limiter })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl RateLimitedTransport for Transport {
    async fn acquire(&self, key: &PathKey, cancel: &CancellationToken) -> Result<Ticket, HttpError> {
        self.limiter.acquire(key, cancel).await
    }

    fn release(&self, ticket: Ticket, status: StatusCode, headers: &HeaderMap) -> Release {
        self.limiter.release(ticket, status, headers)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        self.http.execute(request).await
    }
}
