use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing of Identify payloads within one concurrency bucket.
pub const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound command budget for one gateway connection.
pub struct CommandLimiter {
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl CommandLimiter {
    pub fn per_minute(commands: u32) -> Self {
        let commands = NonZeroU32::new(commands).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(commands)),
            clock: DefaultClock::default(),
        }
    }

    /// Take a slot now, or report how long until one frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Suspend until a slot is available, then take it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "gateway command rate limited");
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for CommandLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLimiter").finish_non_exhaustive()
    }
}

/// Process-wide Identify pacing.
///
/// Shards share `max_concurrency` buckets keyed by `shard_id %
/// max_concurrency`; each bucket admits one Identify per interval.
#[derive(Debug)]
pub struct IdentifyLimiter {
    interval: Duration,
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl Default for IdentifyLimiter {
    fn default() -> Self {
        Self::new(1, IDENTIFY_INTERVAL)
    }
}

impl IdentifyLimiter {
    pub fn new(max_concurrency: u32, interval: Duration) -> Self {
        let buckets = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { interval, buckets }
    }

    pub fn max_concurrency(&self) -> usize {
        self.buckets.len()
    }

    /// Wait for the shard's bucket to allow another Identify and claim it.
    pub async fn acquire(&self, shard_id: u32) {
        let index = shard_id as usize % self.buckets.len();
        let mut last = self.buckets[index].lock().await;
        if let Some(at) = *last {
            let ready = at + self.interval;
            if ready > Instant::now() {
                tracing::debug!(
                    shard_id,
                    bucket = index,
                    wait_ms = (ready - Instant::now()).as_millis() as u64,
                    "waiting for identify slot"
                );
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}
