//! Rate limiter
//!
//! One token bucket per outbound target key (URL host or clone URL).
//! Tokens refill continuously at the bucket's current rate, capped at the
//! burst; a set backoff-until timestamp supersedes token availability.
//! Over a sliding five-minute window the limiter adapts its rate to the
//! observed error rate and publishes every adjustment as an event. The
//! caller is responsible for honoring the returned delay before invoking
//! the downstream operation.

use crate::config::{BackoffStrategy, LimiterConfig};
use crate::error::{ErrorCode, ScanError};
use crate::events::{EngineEvent, EventBus};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sliding window for request and error logs.
const WINDOW: Duration = Duration::from_secs(300);
/// Minimum requests in the window before error-rate logic engages.
const MIN_REQUESTS_FOR_RATE: usize = 10;
/// Adaptive adjustment is evaluated at most this often per bucket.
const ADJUST_INTERVAL: Duration = Duration::from_secs(10);

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    RateLimit,
    Backoff,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::RateLimit => "rate_limit",
            LimitReason::Backoff => "backoff",
        }
    }
}

/// The limiter's answer for one request.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// How long the caller must wait before retrying when denied.
    pub delay: Duration,
    pub reason: Option<LimitReason>,
    pub tokens_remaining: f64,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
    requests: VecDeque<Instant>,
    errors: VecDeque<Instant>,
    backoff_until: Option<Instant>,
    failure_count: u32,
    last_adjustment: Instant,
}

impl Bucket {
    fn new(config: &LimiterConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_limit,
            last_refill: now,
            rate: config.requests_per_second,
            burst: config.burst_limit,
            requests: VecDeque::new(),
            errors: VecDeque::new(),
            backoff_until: None,
            failure_count: 0,
            last_adjustment: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.requests.front() {
            if now.saturating_duration_since(front) > WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&front) = self.errors.front() {
            if now.saturating_duration_since(front) > WINDOW {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.requests.is_empty() {
            0.0
        } else {
            self.errors.len() as f64 / self.requests.len() as f64
        }
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    config: LimiterConfig,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, events: EventBus) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
            events,
        }
    }

    /// Decide whether a request against `key` may proceed now.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(&self.config, now));

        bucket.refill(now);
        bucket.prune(now);
        self.maybe_adjust(key, bucket, now);

        // An active backoff supersedes token availability.
        if let Some(until) = bucket.backoff_until {
            if now < until {
                return RateLimitDecision {
                    allowed: false,
                    delay: until - now,
                    reason: Some(LimitReason::Backoff),
                    tokens_remaining: bucket.tokens,
                    reset_after: reset_after(bucket),
                };
            }
            bucket.backoff_until = None;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.requests.push_back(now);
            RateLimitDecision {
                allowed: true,
                delay: Duration::ZERO,
                reason: None,
                tokens_remaining: bucket.tokens,
                reset_after: reset_after(bucket),
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            RateLimitDecision {
                allowed: false,
                delay: Duration::from_secs_f64(deficit / bucket.rate),
                reason: Some(LimitReason::RateLimit),
                tokens_remaining: bucket.tokens,
                reset_after: reset_after(bucket),
            }
        }
    }

    /// Wait until the limiter admits a request against `key`, honoring
    /// every returned delay. Cancellation-aware.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<(), ScanError> {
        loop {
            let decision = self.check(key);
            if decision.allowed {
                return Ok(());
            }
            tracing::trace!(
                "rate limited on {} ({}), waiting {:?}",
                key,
                decision.reason.map(|r| r.as_str()).unwrap_or("unknown"),
                decision.delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::cancelled()),
                _ = tokio::time::sleep(decision.delay) => {}
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.failure_count = 0;
        }
    }

    /// Record a failed request. HTTP 429 and any 5xx set a backoff; so
    /// does a window error rate above target once enough requests exist.
    pub fn record_failure(&self, key: &str, status: Option<u16>) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(&self.config, now));

        bucket.errors.push_back(now);
        bucket.prune(now);
        bucket.failure_count += 1;

        let status_triggers = matches!(status, Some(429) | Some(500..=599));
        let rate_triggers = bucket.requests.len() >= MIN_REQUESTS_FOR_RATE
            && bucket.error_rate() > self.config.target_error_rate;

        if status_triggers || rate_triggers {
            let delay = backoff_delay(
                self.config.backoff_strategy,
                self.config.base_backoff(),
                self.config.max_backoff(),
                bucket.failure_count,
            );
            bucket.backoff_until = Some(now + delay);
            tracing::debug!("backoff applied to {} for {:?}", key, delay);
            self.events.publish(EngineEvent::BackoffApplied {
                key: key.to_string(),
                delay_ms: delay.as_millis() as u64,
            });
        }
    }

    fn maybe_adjust(&self, key: &str, bucket: &mut Bucket, now: Instant) {
        if !self.config.adaptive
            || now.saturating_duration_since(bucket.last_adjustment) < ADJUST_INTERVAL
            || bucket.requests.len() < MIN_REQUESTS_FOR_RATE
        {
            return;
        }
        bucket.last_adjustment = now;

        let error_rate = bucket.error_rate();
        let target = self.config.target_error_rate;
        let old_rate = bucket.rate;
        let new_rate = if error_rate > target {
            (bucket.rate * self.config.adaptive_adjustment_factor).max(1.0)
        } else if error_rate < target / 2.0 {
            (bucket.rate * 1.2).min(bucket.burst)
        } else {
            bucket.rate
        };

        if (new_rate - old_rate).abs() > f64::EPSILON {
            bucket.rate = new_rate;
            tracing::info!(
                "adaptive rate adjustment for {}: {:.2}/s -> {:.2}/s (error rate {:.3})",
                key,
                old_rate,
                new_rate,
                error_rate
            );
            self.events.publish(EngineEvent::RateAdjusted {
                key: key.to_string(),
                old_rate,
                new_rate,
            });
        }
    }
}

fn reset_after(bucket: &Bucket) -> Duration {
    let deficit = (bucket.burst - bucket.tokens).max(0.0);
    Duration::from_secs_f64(deficit / bucket.rate)
}

/// Backoff delay for the nth consecutive failure (1-based), capped.
pub fn backoff_delay(
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
    failures: u32,
) -> Duration {
    let failures = failures.max(1);
    let delay = match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.saturating_mul(failures),
        BackoffStrategy::Exponential => {
            base.saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(16)))
        }
    };
    delay.min(max)
}

/// HTTP statuses that warrant a retry.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 520..=524)
}

/// Connection-level errors that warrant a retry.
pub fn is_retryable_io(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::BrokenPipe
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::NotConnected
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

pub fn is_retryable_reqwest(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    error
        .status()
        .map(|status| is_retryable_status(status.as_u16()))
        .unwrap_or(false)
}

/// Run `op` with per-attempt retry for retryable errors, sleeping per the
/// configured backoff strategy between attempts. Gives up after
/// `max_retries` retries, logging the exhaustion and returning the last
/// error.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &LimiterConfig,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, ScanError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.code == ErrorCode::Cancelled => return Err(error),
            Err(error) if error.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = backoff_delay(
                    config.backoff_strategy,
                    config.base_backoff(),
                    config.max_backoff(),
                    attempt,
                );
                tracing::debug!(
                    "{label}: attempt {attempt} failed ({}), retrying in {:?}",
                    error.code,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ScanError::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                if error.is_retryable() {
                    tracing::warn!(
                        "{label}: retries exhausted after {} attempts ({})",
                        attempt + 1,
                        ErrorCode::RetryExhausted
                    );
                }
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(LimiterConfig::default(), EventBus::new())
    }

    #[test]
    fn burst_admits_then_denies_with_refill_delay() {
        let limiter = limiter();
        let now = Instant::now();

        for n in 0..10 {
            let decision = limiter.check_at("github.com", now);
            assert!(decision.allowed, "request {n} should pass within burst");
            assert_eq!(decision.delay, Duration::ZERO);
        }

        let denied = limiter.check_at("github.com", now);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitReason::RateLimit));
        // 1 token at 5/s refills in 200ms.
        let millis = denied.delay.as_millis();
        assert!((190..=210).contains(&millis), "delay was {millis}ms");
    }

    #[test]
    fn empty_bucket_earns_a_token_after_refill_interval() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at("k", now).allowed);
        }
        assert!(!limiter.check_at("k", now).allowed);
        let refilled = limiter.check_at("k", now + Duration::from_millis(200));
        assert!(refilled.allowed);
    }

    #[test]
    fn tokens_never_exceed_burst() {
        let limiter = limiter();
        let now = Instant::now();
        let first = limiter.check_at("k", now);
        assert!(first.tokens_remaining <= 10.0);
        // A long idle period must not overfill.
        let later = limiter.check_at("k", now + Duration::from_secs(3600));
        assert!(later.tokens_remaining <= 10.0);
        assert!((later.tokens_remaining - 9.0).abs() < 1e-6);
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at("a", now).allowed);
        }
        assert!(!limiter.check_at("a", now).allowed);
        assert!(limiter.check_at("b", now).allowed);
    }

    #[test]
    fn status_429_sets_backoff_that_supersedes_tokens() {
        let limiter = limiter();
        let now = Instant::now();
        assert!(limiter.check_at("k", now).allowed);
        limiter.record_failure("k", Some(429));

        let denied = limiter.check_at("k", Instant::now());
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitReason::Backoff));
        assert!(denied.delay > Duration::ZERO);
    }

    #[test]
    fn backoff_delay_strategies() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(
            backoff_delay(BackoffStrategy::Fixed, base, max, 7),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff_delay(BackoffStrategy::Linear, base, max, 3),
            Duration::from_millis(300)
        );
        assert_eq!(
            backoff_delay(BackoffStrategy::Exponential, base, max, 4),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn exponential_backoff_clamps_at_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(
            backoff_delay(BackoffStrategy::Exponential, base, max, 30),
            max
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(521));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(403));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(is_retryable_io(&reset));
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_retryable_io(&denied));
    }

    #[tokio::test]
    async fn adaptive_reduces_rate_under_errors() {
        let config = LimiterConfig {
            requests_per_second: 4.0,
            burst_limit: 100.0,
            ..Default::default()
        };
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let limiter = RateLimiter::new(config, bus);

        let start = Instant::now();
        for _ in 0..20 {
            limiter.check_at("k", start);
        }
        for _ in 0..10 {
            limiter.record_failure("k", Some(500));
        }
        // Past the adjustment interval the next check adapts the rate.
        limiter.check_at("k", start + Duration::from_secs(11));

        let mut saw_adjustment = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::RateAdjusted { old_rate, new_rate, .. } = event {
                assert!(new_rate < old_rate);
                saw_adjustment = true;
            }
        }
        assert!(saw_adjustment, "expected a rate adjustment event");
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let config = LimiterConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            max_retries: 2,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let mut attempts = 0u32;
        let result: Result<(), ScanError> =
            retry_with_backoff(&config, &cancel, "test", |_| {
                attempts += 1;
                async { Err(ScanError::new(ErrorCode::NetworkError, "boom")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable() {
        let config = LimiterConfig::default();
        let cancel = CancellationToken::new();
        let mut attempts = 0u32;
        let result: Result<(), ScanError> =
            retry_with_backoff(&config, &cancel, "test", |_| {
                attempts += 1;
                async { Err(ScanError::new(ErrorCode::RepositoryNotFound, "missing")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn acquire_waits_out_the_delay() {
        let config = LimiterConfig {
            requests_per_second: 50.0,
            burst_limit: 1.0,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, EventBus::new());
        let cancel = CancellationToken::new();
        limiter.acquire("k", &cancel).await.unwrap();
        let started = Instant::now();
        limiter.acquire("k", &cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
