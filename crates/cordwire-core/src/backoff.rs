use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff owned by a single connection.
///
/// Each delay is `min * 2^attempt`, capped at `max`, then scaled by a random
/// factor in `[1.0, 1.5)`. The attempt counter survives across reconnects and
/// only [`Backoff::reset`] returns it to zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Option<Duration>,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Option<Duration>) -> Self {
        Self {
            min,
            max,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        // 2^20 times the minimum is already days; stop growing there.
        let exp = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);

        let base = self.min.as_secs_f64() * f64::from(1u32 << exp);
        let jittered = base * rand::thread_rng().gen_range(1.0..1.5);
        let delay = Duration::from_secs_f64(jittered);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_within_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), None);
        for attempt in 0..5u32 {
            let delay = backoff.next_delay();
            let base = 100u64 << attempt;
            assert!(delay >= Duration::from_millis(base), "attempt {attempt}: {delay:?}");
            assert!(delay < Duration::from_millis(base * 3 / 2 + 1));
        }
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn respects_cap_and_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Some(Duration::from_secs(3)));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_secs(3));
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(1500));
    }
}
