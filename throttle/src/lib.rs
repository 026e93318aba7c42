//! Request rate limiting for ipfs-copy
//!
//! Every request the copy pipeline sends to the destination node (pin, block put) first takes
//! a token from a shared [`RateLimiter`]. All workers share the same bucket, so the configured
//! budget bounds the *aggregate* request rate of a run rather than the rate of any single worker.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::RateLimiter;
//!
//! # async fn example() {
//! // 10 requests per second across all workers
//! let limiter = RateLimiter::per_second(10);
//!
//! let worker_limiter = limiter.clone();
//! tokio::spawn(async move {
//!     worker_limiter.get_token().await;
//!     // issue the request here
//! });
//! # }
//! ```
//!
//! # Replenishment Strategy
//!
//! The bucket starts with a single token and is topped up by a background task. The tick is the
//! shortest whole number of milliseconds over which the budget `R` is a whole number of tokens:
//! `R / gcd(R, 1000)` tokens every `1000 / gcd(R, 1000)` ms. For `R = 10` that is one token
//! every 100ms, for `R = 600` three tokens every 5ms. The refill rate is then exactly `R`.
//!
//! When that batch would exceed 100 tokens (e.g. `R = 999` gives 999 tokens per second), the
//! tick is shortened to 100ms and `⌊R / 10⌋` tokens are added per tick instead. The refill rate
//! never exceeds `R`, and falls below it by less than 10 requests per second.
//!
//! The bucket never holds more than one replenish batch, which caps bursts to what a single
//! tick allows. The background task exits once the last [`RateLimiter`] handle is dropped.

mod semaphore;

use std::sync::Arc;
use std::time::Duration;

/// Minimum spacing between two requests for a budget of `max_reqs_per_sec`.
///
/// The result is truncated to whole milliseconds: a budget of 3 yields 333ms, not 333.33ms.
/// A budget of 0 means "unthrottled" and yields a zero interval.
///
/// ```
/// use std::time::Duration;
///
/// assert_eq!(throttle::min_request_interval(10), Duration::from_millis(100));
/// assert_eq!(throttle::min_request_interval(3), Duration::from_millis(333));
/// ```
#[must_use]
pub fn min_request_interval(max_reqs_per_sec: u32) -> Duration {
    if max_reqs_per_sec == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(1000 / u64::from(max_reqs_per_sec))
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

const MAX_EXACT_BATCH: u64 = 100;

/// Number of tokens added per replenish tick and the tick length.
///
/// Tokens per tick over the tick length never exceeds `max_reqs_per_sec`.
fn replenish_schedule(max_reqs_per_sec: u32) -> (usize, Duration) {
    let rate = u64::from(max_reqs_per_sec.max(1));
    let divisor = gcd(rate, 1000);
    let (tokens, tick_ms) = (rate / divisor, 1000 / divisor);
    if tokens <= MAX_EXACT_BATCH {
        return (tokens as usize, Duration::from_millis(tick_ms));
    }
    // rate > 100 here, so at least 10 tokens per 100ms
    ((rate / 10) as usize, Duration::from_millis(100))
}

/// Shared token bucket. Cloning is cheap and every clone draws from the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<semaphore::Semaphore>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl RateLimiter {
    /// Limiter that never blocks.
    #[must_use]
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Limiter allowing at most `max_reqs_per_sec` token grabs per second, 0 means no limit.
    ///
    /// Spawns the replenish task, so it must be called from within a tokio runtime.
    #[must_use]
    pub fn per_second(max_reqs_per_sec: u32) -> Self {
        if max_reqs_per_sec == 0 {
            return Self::unlimited();
        }
        let (tokens, interval) = replenish_schedule(max_reqs_per_sec);
        tracing::debug!(
            "rate limiter: {} req/s, {} token(s) every {:?}",
            max_reqs_per_sec,
            tokens,
            interval
        );
        let bucket = Arc::new(semaphore::Semaphore::new(1));
        tokio::spawn(run_replenish_thread(
            Arc::downgrade(&bucket),
            tokens,
            interval,
        ));
        Self {
            bucket: Some(bucket),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Waits until a request slot is granted.
    pub async fn get_token(&self) {
        if let Some(bucket) = &self.bucket {
            bucket.consume().await;
        }
    }
}

async fn run_replenish_thread(
    bucket: std::sync::Weak<semaphore::Semaphore>,
    replenish: usize,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match bucket.upgrade() {
            Some(bucket) => bucket.replenish(replenish),
            None => {
                tracing::trace!("rate limiter dropped, stopping replenish task");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn interval_examples() {
        assert_eq!(min_request_interval(10), Duration::from_millis(100));
        assert_eq!(min_request_interval(2), Duration::from_millis(500));
        assert_eq!(min_request_interval(20), Duration::from_millis(50));
        assert_eq!(min_request_interval(3), Duration::from_millis(333));
        assert_eq!(min_request_interval(0), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn interval_truncates_to_whole_millis(rate in 1u32..100_000) {
            prop_assert_eq!(
                min_request_interval(rate),
                Duration::from_millis(1000 / u64::from(rate))
            );
        }
    }

    #[test]
    fn schedule_examples() {
        assert_eq!(replenish_schedule(10), (1, Duration::from_millis(100)));
        assert_eq!(replenish_schedule(20), (1, Duration::from_millis(50)));
        assert_eq!(replenish_schedule(3), (3, Duration::from_millis(1000)));
        assert_eq!(replenish_schedule(600), (3, Duration::from_millis(5)));
        assert_eq!(replenish_schedule(999), (99, Duration::from_millis(100)));
        assert_eq!(replenish_schedule(1000), (1, Duration::from_millis(1)));
        assert_eq!(replenish_schedule(2500), (5, Duration::from_millis(2)));
    }

    proptest! {
        #[test]
        fn schedule_never_exceeds_budget(rate in 1u32..100_000) {
            let (tokens, tick) = replenish_schedule(rate);
            let tick_ms = u64::try_from(tick.as_millis()).unwrap();
            prop_assert!(tokens >= 1);
            prop_assert!(tick_ms >= 1);
            let granted = tokens as u64 * 1000;
            let budget = u64::from(rate) * tick_ms;
            prop_assert!(granted <= budget, "{tokens} per {tick_ms}ms exceeds {rate}/s");
            prop_assert!(
                granted * 10 >= budget * 9,
                "{tokens} per {tick_ms}ms too far below {rate}/s"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn budget_below_one_thousand_is_not_rounded_up() {
        let limiter = RateLimiter::per_second(600);
        let start = tokio::time::Instant::now();
        for _ in 0..601 {
            limiter.get_token().await;
        }
        // one token at start, then 600 more take a full second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_out_sequential_requests() {
        let limiter = RateLimiter::per_second(10);
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            limiter.get_token().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_aggregate_rate_across_tasks() {
        let limiter = RateLimiter::per_second(10);
        let start = tokio::time::Instant::now();
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            join_set.spawn(async move {
                limiter.get_token().await;
                limiter.get_token().await;
            });
        }
        while let Some(res) = join_set.join_next().await {
            res.unwrap();
        }
        // 20 tokens: one at start, then one every 100ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2000), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_does_not_accumulate_a_burst() {
        let limiter = RateLimiter::per_second(10);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            limiter.get_token().await;
        }
        // an accumulated burst would hand out all three at once
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::per_second(0);
        assert!(!limiter.is_enabled());
        for _ in 0..10_000 {
            limiter.get_token().await;
        }
    }
}
