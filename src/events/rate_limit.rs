//! Token-bucket rate limiting for the event bus.
//!
//! Each configured event kind owns a bucket refilled at `rate` tokens per
//! second up to `burst`. Publishing an event of a starved kind drops it and
//! increments a per-kind drop counter; once the drops since the last notice
//! exceed the backpressure threshold, the bus fires a `backpressure.activated`
//! notice and holds further notices for a cooldown window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::types::EventKind;

/// Per-kind bucket configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Sustained events per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: f64,
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Event must be dropped; drop counter already incremented.
    Dropped {
        /// Fire a backpressure notice for this kind.
        backpressure: bool,
    },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    drops: u64,
    drops_since_notice: u64,
    last_notice: Option<Instant>,
}

/// Token-bucket limiter over all configured event kinds.
#[derive(Debug)]
pub struct RateLimiter {
    configs: HashMap<EventKind, RateLimitConfig>,
    buckets: Mutex<HashMap<EventKind, Bucket>>,
    backpressure_threshold: u64,
    notice_cooldown: Duration,
}

impl RateLimiter {
    pub fn new(configs: HashMap<EventKind, RateLimitConfig>, backpressure_threshold: u64) -> Self {
        Self {
            configs,
            buckets: Mutex::new(HashMap::new()),
            backpressure_threshold,
            notice_cooldown: Duration::from_secs(5),
        }
    }

    /// Default limits: progress events are chatty, security events are not.
    pub fn default_configs() -> HashMap<EventKind, RateLimitConfig> {
        let mut configs = HashMap::new();
        configs.insert(
            EventKind::LoadingProgress,
            RateLimitConfig {
                rate: 100.0,
                burst: 200.0,
            },
        );
        configs.insert(
            EventKind::SecurityViolation,
            RateLimitConfig {
                rate: 10.0,
                burst: 20.0,
            },
        );
        configs.insert(
            EventKind::Performance,
            RateLimitConfig {
                rate: 50.0,
                burst: 100.0,
            },
        );
        configs.insert(
            EventKind::Cache,
            RateLimitConfig {
                rate: 200.0,
                burst: 400.0,
            },
        );
        configs
    }

    /// Check whether an event of `kind` may pass right now.
    pub fn check(&self, kind: EventKind) -> RateDecision {
        let Some(config) = self.configs.get(&kind).copied() else {
            return RateDecision::Allowed;
        };

        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(kind).or_insert_with(|| Bucket {
            tokens: config.burst,
            last_refill: now,
            drops: 0,
            drops_since_notice: 0,
            last_notice: None,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * config.rate).min(config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision::Allowed;
        }

        bucket.drops += 1;
        bucket.drops_since_notice += 1;

        let cooldown_over = bucket
            .last_notice
            .map(|at| now.saturating_duration_since(at) >= self.notice_cooldown)
            .unwrap_or(true);
        let backpressure = bucket.drops_since_notice > self.backpressure_threshold && cooldown_over;
        if backpressure {
            bucket.drops_since_notice = 0;
            bucket.last_notice = Some(now);
        }

        RateDecision::Dropped { backpressure }
    }

    /// Total drops per kind since startup.
    pub fn drop_counts(&self) -> HashMap<EventKind, u64> {
        self.buckets
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, bucket)| (*kind, bucket.drops))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: f64, threshold: u64) -> RateLimiter {
        let mut configs = HashMap::new();
        configs.insert(EventKind::LoadingProgress, RateLimitConfig { rate, burst });
        RateLimiter::new(configs, threshold)
    }

    #[tokio::test]
    async fn burst_is_honored_then_starves() {
        let limiter = limiter(10.0, 5.0, 100);
        for _ in 0..5 {
            assert_eq!(limiter.check(EventKind::LoadingProgress), RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.check(EventKind::LoadingProgress),
            RateDecision::Dropped { .. }
        ));
        assert_eq!(
            limiter.drop_counts().get(&EventKind::LoadingProgress),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_tokens() {
        let limiter = limiter(10.0, 2.0, 100);
        assert_eq!(limiter.check(EventKind::LoadingProgress), RateDecision::Allowed);
        assert_eq!(limiter.check(EventKind::LoadingProgress), RateDecision::Allowed);
        assert!(matches!(
            limiter.check(EventKind::LoadingProgress),
            RateDecision::Dropped { .. }
        ));

        tokio::time::advance(Duration::from_millis(200)).await;
        // 0.2s * 10/s = 2 tokens back
        assert_eq!(limiter.check(EventKind::LoadingProgress), RateDecision::Allowed);
        assert_eq!(limiter.check(EventKind::LoadingProgress), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn backpressure_fires_past_threshold() {
        let limiter = limiter(0.0001, 1.0, 3);
        assert_eq!(limiter.check(EventKind::LoadingProgress), RateDecision::Allowed);
        let mut notices = 0;
        for _ in 0..10 {
            if let RateDecision::Dropped { backpressure: true } =
                limiter.check(EventKind::LoadingProgress)
            {
                notices += 1;
            }
        }
        // one notice, then the cooldown suppresses the rest
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn unconfigured_kinds_pass() {
        let limiter = limiter(1.0, 1.0, 10);
        for _ in 0..100 {
            assert_eq!(limiter.check(EventKind::Loaded), RateDecision::Allowed);
        }
    }
}
