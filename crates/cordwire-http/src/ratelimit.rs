use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::HttpError;
use crate::path::PathKey;

/// Local and server reset instants closer than this are treated as equal.
const RESET_SKEW: Duration = Duration::from_millis(250);

/// Wait applied when a 429 carries no usable `Retry-After`.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    User,
    Shared,
    Global,
}

/// Rate-limit related response headers, leniently parsed. Unparseable
/// values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    /// `X-RateLimit-Reset`, epoch seconds.
    pub reset: Option<f64>,
    pub bucket: Option<String>,
    pub global: bool,
    pub retry_after: Option<Duration>,
    pub scope: Option<RateLimitScope>,
    /// Server clock from the `Date` header.
    pub date: Option<DateTime<Utc>>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
        };

        Self {
            limit: text("x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: text("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_after: seconds("x-ratelimit-reset-after").map(Duration::from_secs_f64),
            reset: seconds("x-ratelimit-reset"),
            bucket: text("x-ratelimit-bucket").map(str::to_string),
            global: text("x-ratelimit-global").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            retry_after: seconds("retry-after").map(Duration::from_secs_f64),
            scope: text("x-ratelimit-scope").and_then(|v| match v {
                "user" => Some(RateLimitScope::User),
                "shared" => Some(RateLimitScope::Shared),
                "global" => Some(RateLimitScope::Global),
                _ => None,
            }),
            date: text("date")
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|d| d.with_timezone(&Utc)),
        }
    }

    /// Time until the bucket resets, preferring `Reset-After` and falling back
    /// to the absolute `Reset` measured against the server's `Date`.
    pub fn reset_in(&self) -> Option<Duration> {
        if let Some(after) = self.reset_after {
            return Some(after);
        }
        let reset = self.reset?;
        let server_now = self.date.unwrap_or_else(Utc::now);
        let now_secs = server_now.timestamp_millis() as f64 / 1000.0;
        Some(Duration::from_secs_f64((reset - now_secs).max(0.0)))
    }
}

/// Outcome of reconciling a bucket with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    InSync,
    /// The server disagreed with local state and won.
    Adjusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_at: Option<Instant>,
}

#[derive(Debug)]
struct BucketState {
    /// `None` until the first response tells us; unknown buckets never block.
    limit: Option<u32>,
    remaining: u32,
    reset_at: Option<Instant>,
}

impl BucketState {
    fn provisional() -> Self {
        Self {
            limit: None,
            remaining: 0,
            reset_at: None,
        }
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
        }
    }

    /// Fold another view of the same server bucket into this one. The later
    /// window wins; within one window the lower `remaining` wins.
    fn merge(&mut self, other: &BucketState) {
        if other.limit.is_some() {
            self.limit = other.limit;
        }
        match (self.reset_at, other.reset_at) {
            (Some(mine), Some(theirs)) if abs_diff(mine, theirs) <= RESET_SKEW => {
                self.remaining = self.remaining.min(other.remaining);
            }
            (Some(mine), Some(theirs)) if mine > theirs => {}
            (_, Some(theirs)) => {
                self.reset_at = Some(theirs);
                self.remaining = other.remaining;
            }
            (None, None) if other.limit.is_some() => self.remaining = other.remaining,
            _ => {}
        }
    }

    fn refill_if_elapsed(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset| reset <= now) {
            if let Some(limit) = self.limit {
                self.remaining = limit;
            }
            self.reset_at = None;
        }
    }
}

type SharedBucket = Arc<Mutex<BucketState>>;

/// Permission to send one request on a bucket.
///
/// The bucket stays locked until the ticket is released (or dropped), so
/// requests on one bucket run one at a time in arrival order.
#[derive(Debug)]
pub struct Ticket {
    key: PathKey,
    bucket_id: String,
    state: OwnedMutexGuard<BucketState>,
}

impl Ticket {
    pub fn key(&self) -> &PathKey {
        &self.key
    }

    pub fn bucket(&self) -> &str {
        &self.bucket_id
    }
}

/// Client-side mirror of Discord's per-route rate limits.
///
/// Routes map to a bucket id and bucket ids map to shared state. A route
/// starts on a provisional `path:<key>` bucket and is re-pointed at
/// `<hash>:<major>` once the server names its bucket.
#[derive(Debug, Default)]
pub struct RateLimiter {
    routes: DashMap<PathKey, String>,
    buckets: DashMap<String, SharedBucket>,
    global_until: std::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        key: &PathKey,
        cancel: &CancellationToken,
    ) -> Result<Ticket, HttpError> {
        let (bucket_id, bucket) = self.bucket_for(key);

        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::RateLimitCancelled),
            guard = bucket.lock_owned() => guard,
        };

        loop {
            self.wait_global(cancel).await?;

            let now = Instant::now();
            state.refill_if_elapsed(now);
            match (state.limit, state.reset_at) {
                (Some(_), Some(reset_at)) if state.remaining == 0 => {
                    tracing::debug!(
                        path = %key,
                        bucket = %bucket_id,
                        wait_ms = reset_at.saturating_duration_since(now).as_millis() as u64,
                        "bucket exhausted, waiting for reset"
                    );
                    sleep_or_cancel(reset_at, cancel).await?;
                }
                _ => break,
            }
        }

        if state.limit.is_some() {
            state.remaining = state.remaining.saturating_sub(1);
        }

        Ok(Ticket {
            key: key.clone(),
            bucket_id,
            state,
        })
    }

    /// Reconcile the ticket's bucket with a response and unlock it.
    pub fn release(&self, ticket: Ticket, status: StatusCode, headers: &HeaderMap) -> Release {
        let Ticket {
            key,
            bucket_id,
            mut state,
        } = ticket;
        let parsed = RateLimitHeaders::parse(headers);
        let now = Instant::now();
        let mut outcome = Release::InSync;

        if status == StatusCode::TOO_MANY_REQUESTS {
            // A rejected request does not count against the window.
            if let Some(limit) = state.limit {
                state.remaining = state.remaining.saturating_add(1).min(limit);
            }
        }

        if let Some(limit) = parsed.limit {
            state.limit = Some(limit);
        }

        match (parsed.reset_in(), parsed.remaining) {
            (Some(reset_in), remaining) => {
                let server_reset = now + reset_in;
                let new_window = match state.reset_at {
                    None => true,
                    Some(local) => abs_diff(local, server_reset) > RESET_SKEW,
                };
                if new_window {
                    if state.reset_at.is_some() {
                        outcome = Release::Adjusted;
                    }
                    state.reset_at = Some(server_reset);
                    if let Some(remaining) = remaining {
                        state.remaining = remaining;
                    }
                } else if let Some(remaining) = remaining.filter(|r| *r < state.remaining) {
                    state.remaining = remaining;
                    outcome = Release::Adjusted;
                }
            }
            (None, Some(remaining)) if remaining < state.remaining || state.reset_at.is_none() => {
                if remaining < state.remaining {
                    outcome = Release::Adjusted;
                }
                state.remaining = remaining;
            }
            _ => {}
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parsed
                .retry_after
                .or_else(|| parsed.reset_in())
                .unwrap_or(FALLBACK_RETRY_AFTER);
            let until = now + retry_after;
            match (parsed.global, parsed.scope) {
                (false, Some(RateLimitScope::Shared)) => {
                    state.remaining = 0;
                    state.reset_at = Some(state.reset_at.map_or(until, |r| r.max(until)));
                    tracing::warn!(path = %key, bucket = %bucket_id, retry_after_ms = retry_after.as_millis() as u64, "shared rate limit hit");
                }
                (global, scope) => {
                    self.pause_global(until);
                    tracing::warn!(
                        path = %key,
                        global,
                        scope = ?scope,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "rate limited, pausing all requests"
                    );
                }
            }
            outcome = Release::Adjusted;
        } else if parsed.global {
            if let Some(retry_after) = parsed.retry_after {
                self.pause_global(now + retry_after);
            }
        }

        if let Some(hash) = parsed.bucket.as_deref() {
            let shared_id = format!("{hash}:{}", key.major().unwrap_or("-"));
            if shared_id != bucket_id {
                let snapshot = BucketState {
                    limit: state.limit,
                    remaining: state.remaining,
                    reset_at: state.reset_at,
                };
                let existing = match self.buckets.entry(shared_id.clone()) {
                    Entry::Occupied(entry) => Some(entry.get().clone()),
                    Entry::Vacant(entry) => {
                        entry.insert(Arc::new(Mutex::new(snapshot)));
                        None
                    }
                };
                if let Some(existing) = existing {
                    match existing.try_lock() {
                        Ok(mut shared) => shared.merge(&state),
                        // The holder reconciles it with its own response.
                        Err(_) => tracing::trace!(bucket = %shared_id, "shared bucket busy, not merged"),
                    }
                }
                self.routes.insert(key.clone(), shared_id.clone());
                tracing::debug!(path = %key, bucket = %shared_id, "route mapped to server bucket");
            }
        }

        outcome
    }

    /// Current global pause deadline, if one is in effect.
    pub fn global_pause(&self) -> Option<Instant> {
        let until = *self.global_until.lock().unwrap_or_else(PoisonError::into_inner);
        until.filter(|until| *until > Instant::now())
    }

    /// Bucket id the route currently resolves to.
    pub fn bucket_id(&self, key: &PathKey) -> Option<String> {
        self.routes.get(key).map(|id| id.value().clone())
    }

    /// State of the route's bucket, or `None` if unknown or currently locked.
    pub fn snapshot(&self, key: &PathKey) -> Option<BucketSnapshot> {
        let id = self.bucket_id(key)?;
        let bucket = self.buckets.get(&id)?.value().clone();
        let state = bucket.try_lock().ok()?;
        Some(state.snapshot())
    }

    fn pause_global(&self, until: Instant) {
        let mut global = self.global_until.lock().unwrap_or_else(PoisonError::into_inner);
        *global = Some(global.map_or(until, |current| current.max(until)));
    }

    async fn wait_global(&self, cancel: &CancellationToken) -> Result<(), HttpError> {
        while let Some(until) = self.global_pause() {
            tracing::debug!(
                wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "global rate limit in effect"
            );
            sleep_or_cancel(until, cancel).await?;
        }
        Ok(())
    }

    fn bucket_for(&self, key: &PathKey) -> (String, SharedBucket) {
        if let Some(id) = self.bucket_id(key) {
            if let Some(bucket) = self.buckets.get(&id) {
                return (id, bucket.value().clone());
            }
        }
        let id = format!("path:{key}");
        let bucket = self
            .buckets
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BucketState::provisional())))
            .value()
            .clone();
        self.routes.entry(key.clone()).or_insert_with(|| id.clone());
        (id, bucket)
    }
}

async fn sleep_or_cancel(until: Instant, cancel: &CancellationToken) -> Result<(), HttpError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HttpError::RateLimitCancelled),
        _ = tokio::time::sleep_until(until) => Ok(()),
    }
}

fn abs_diff(a: Instant, b: Instant) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}
