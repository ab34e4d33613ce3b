//! Resilience primitives for rate-sensitive sources.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// Lowest refill rate a bucket accepts, in tokens per second.
const MIN_RATE: f64 = 0.001;

/// Slack for float drift when comparing token counts.
const EPSILON: f64 = 1e-9;

/// The refill rate, with the tokens credited up to its last change.
#[derive(Debug, Clone, Copy)]
struct Rate {
    per_sec: f64,
    since: Instant,
    credit_since: f64,
}

impl Rate {
    /// Total tokens credited since the limiter was created.
    fn credit_at(&self, now: Instant) -> f64 {
        self.credit_since + now.saturating_duration_since(self.since).as_secs_f64() * self.per_sec
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Credit already added to `tokens`.
    credit: f64,
}

impl Bucket {
    fn refill(&mut self, rate: &Rate, now: Instant, capacity: f64) {
        let credit = rate.credit_at(now);
        self.tokens = (self.tokens + (credit - self.credit).max(0.0)).min(capacity);
        self.credit = credit;
    }
}

#[derive(Debug)]
struct Shared {
    capacity: f64,
    rate: StdMutex<Rate>,
    bucket: Mutex<Bucket>,
}

/// Token-bucket rate limiter shared by every caller of one source.
///
/// Tokens refill lazily on each acquisition at `rate` per second, up to
/// `capacity`. The read-refill-debit sequence, including any wait for
/// tokens, runs under a single async lock so total throughput stays at
/// or below `rate` however many tasks call in. The lock is fair, so
/// waiters are served in arrival order.
///
/// The refill rate lives outside the lock so it can be adjusted while a
/// caller is waiting for tokens. Time before a rate change is credited at
/// the rate in force then.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// Create a limiter allowing `rate` requests per second, with a burst
    /// of `max(1, floor(2 * rate))`.
    pub fn new(rate: f64) -> Self {
        let burst = (rate * 2.0).floor().max(1.0) as u32;
        Self::with_burst(rate, burst)
    }

    /// Create a limiter with an explicit burst capacity. The bucket starts full.
    pub fn with_burst(rate: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            shared: Arc::new(Shared {
                capacity,
                rate: StdMutex::new(Rate {
                    per_sec: sanitize_rate(rate),
                    since: Instant::now(),
                    credit_since: 0.0,
                }),
                bucket: Mutex::new(Bucket {
                    tokens: capacity,
                    credit: 0.0,
                }),
            }),
        }
    }

    fn current(&self) -> Rate {
        *self.shared.rate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current refill rate, in tokens per second.
    pub fn rate(&self) -> f64 {
        self.current().per_sec
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> f64 {
        self.shared.capacity
    }

    pub(crate) fn set_rate(&self, rate: f64) {
        let mut current = self.shared.rate.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        current.credit_since = current.credit_at(now);
        current.since = now;
        current.per_sec = sanitize_rate(rate);
    }

    /// Wait for one token, then take it.
    pub async fn acquire(&self) {
        self.acquire_n(1).await;
    }

    /// Wait until `n` tokens are available, then debit them.
    ///
    /// Never fails, only delays. Requests larger than the bucket capacity
    /// are clamped to the capacity.
    pub async fn acquire_n(&self, n: u32) {
        let capacity = self.shared.capacity;
        let wanted = f64::from(n).min(capacity);
        if f64::from(n) > capacity {
            log::warn!("Requested {n} tokens from a bucket of {capacity}; clamping");
        }

        let mut bucket = self.shared.bucket.lock().await;
        loop {
            let rate = self.current();
            bucket.refill(&rate, Instant::now(), capacity);

            if bucket.tokens + EPSILON >= wanted {
                bucket.tokens = (bucket.tokens - wanted).max(0.0);
                return;
            }

            let wait = Duration::from_secs_f64((wanted - bucket.tokens) / rate.per_sec);
            log::debug!("Rate limit reached, waiting {:.2}s", wait.as_secs_f64());
            sleep(wait).await;
        }
    }

    /// Tokens that would be available right now, without debiting any.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.shared.bucket.lock().await;
        bucket.refill(&self.current(), Instant::now(), self.shared.capacity);
        bucket.tokens
    }

    /// Refill the bucket to capacity.
    pub async fn reset(&self) {
        let mut bucket = self.shared.bucket.lock().await;
        bucket.tokens = self.shared.capacity;
        bucket.credit = self.current().credit_at(Instant::now());
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.max(MIN_RATE)
    } else {
        MIN_RATE
    }
}

/// Tuning for [`AdaptiveRateLimiter`].
///
/// The thresholds and factors are heuristics; the floor and ceiling are
/// hard bounds on the refill rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    pub floor: f64,
    pub ceiling: f64,
    /// Consecutive successes before the rate is raised.
    pub success_threshold: u32,
    /// Recent failures that trigger a cut even without a rate-limit signal.
    pub failure_threshold: u32,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            floor: 0.1,
            ceiling: 10.0,
            success_threshold: 10,
            failure_threshold: 3,
            increase_factor: 1.1,
            decrease_factor: 0.5,
        }
    }
}

#[derive(Debug, Default)]
struct Feedback {
    consecutive_successes: u32,
    recent_failures: u32,
}

/// A [`RateLimiter`] whose rate follows success and failure feedback.
///
/// Sustained success raises the rate multiplicatively up to the ceiling;
/// a rate-limit rejection, or a run of failures, cuts it multiplicatively
/// down to the floor. Feedback never waits on the token bucket.
#[derive(Debug, Clone)]
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    settings: AdaptiveSettings,
    feedback: Arc<StdMutex<Feedback>>,
}

impl AdaptiveRateLimiter {
    pub fn new(initial_rate: f64, burst: Option<u32>, settings: AdaptiveSettings) -> Self {
        let rate = initial_rate.clamp(settings.floor, settings.ceiling.max(settings.floor));
        let limiter = match burst {
            Some(burst) => RateLimiter::with_burst(rate, burst),
            None => RateLimiter::new(rate),
        };
        Self {
            limiter,
            settings,
            feedback: Arc::new(StdMutex::new(Feedback::default())),
        }
    }

    /// The underlying token bucket.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    pub async fn acquire(&self) {
        self.limiter.acquire().await;
    }

    /// Record a successful upstream call.
    pub fn record_success(&self) {
        let mut feedback = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);
        feedback.consecutive_successes += 1;
        feedback.recent_failures = feedback.recent_failures.saturating_sub(1);

        if feedback.consecutive_successes >= self.settings.success_threshold {
            let current = self.limiter.rate();
            let raised = (current * self.settings.increase_factor).min(self.settings.ceiling);
            if raised > current {
                log::debug!("Increasing rate limit to {raised:.2} QPS");
                self.limiter.set_rate(raised);
            }
            feedback.consecutive_successes = 0;
        }
    }

    /// Record a failed upstream call; `is_rate_limited` marks an explicit
    /// rate-limit rejection.
    pub fn record_failure(&self, is_rate_limited: bool) {
        let mut feedback = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);
        feedback.recent_failures += 1;
        feedback.consecutive_successes = 0;

        if is_rate_limited || feedback.recent_failures >= self.settings.failure_threshold {
            let current = self.limiter.rate();
            let reduced = (current * self.settings.decrease_factor).max(self.settings.floor);
            if reduced < current {
                log::warn!("Reducing rate limit to {reduced:.2} QPS due to failures");
                self.limiter.set_rate(reduced);
            }
        }
    }
}
