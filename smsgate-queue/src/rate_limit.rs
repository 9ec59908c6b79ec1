//! Per-submitter throttling with token buckets.
//!
//! Each submitter gets a bucket holding `burst_size` tokens that refills at
//! `messages_per_minute`. Every accepted submission takes one token.
//! Anonymous submissions share a single bucket.
//!
//! Buckets are driven by the injected clock rather than `Instant`, so tests
//! can cross a refill window without sleeping.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use smsgate_common::internal;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: f64,

    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Per-submitter overrides, keyed by submitter name
    #[serde(default)]
    pub submitter_limits: ahash::AHashMap<String, SubmitterRateLimit>,
}

const fn default_messages_per_minute() -> f64 {
    60.0
}

const fn default_burst_size() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: default_messages_per_minute(),
            burst_size: default_burst_size(),
            submitter_limits: ahash::AHashMap::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitterRateLimit {
    pub messages_per_minute: f64,
    pub burst_size: u32,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(messages_per_minute: f64, burst_size: u32, now: DateTime<Utc>) -> Self {
        let capacity = f64::from(burst_size);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: messages_per_minute / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        // A clock that went backwards refills nothing.
        let elapsed = (now - self.last_refill)
            .to_std()
            .map_or(0.0, |elapsed| elapsed.as_secs_f64());
        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        let seconds = (1.0 - self.tokens) / self.refill_rate;
        Err(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
    }
}

/// Token buckets for every submitter seen so far.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<parking_lot::Mutex<TokenBucket>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, submitter: &str, now: DateTime<Utc>) -> Arc<parking_lot::Mutex<TokenBucket>> {
        self.buckets
            .entry(submitter.to_string())
            .or_insert_with(|| {
                let (per_minute, burst) = self.config.submitter_limits.get(submitter).map_or(
                    (self.config.messages_per_minute, self.config.burst_size),
                    |limit| (limit.messages_per_minute, limit.burst_size),
                );
                Arc::new(parking_lot::Mutex::new(TokenBucket::new(per_minute, burst, now)))
            })
            .clone()
    }

    /// Take a token for `submitter` (`None` for anonymous submissions).
    ///
    /// # Errors
    /// Returns how long until a token is available when the bucket is empty.
    pub fn check(&self, submitter: Option<&str>, now: DateTime<Utc>) -> Result<(), Duration> {
        let submitter = submitter.unwrap_or_default();
        let bucket = self.bucket(submitter, now);
        let result = bucket.lock().try_consume(now);

        if let Err(wait) = result {
            internal!(
                level = DEBUG,
                submitter,
                wait_seconds = wait.as_secs_f64(),
                "Submission throttled"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    #[test]
    fn burst_then_throttle() {
        let limiter = RateLimiter::new(RateLimitConfig {
            messages_per_minute: 60.0,
            burst_size: 3,
            ..RateLimitConfig::default()
        });
        let now = epoch();

        for _ in 0..3 {
            assert!(limiter.check(Some("alice"), now).is_ok());
        }
        let wait = limiter.check(Some("alice"), now).expect_err("throttled");
        assert_eq!(wait, Duration::from_secs(1));

        // Other submitters are unaffected.
        assert!(limiter.check(Some("bob"), now).is_ok());

        assert!(limiter.check(Some("alice"), now + TimeDelta::seconds(1)).is_ok());
    }

    #[test]
    fn anonymous_submissions_share_a_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            ..RateLimitConfig::default()
        });
        assert!(limiter.check(None, epoch()).is_ok());
        assert!(limiter.check(None, epoch()).is_err());
    }

    #[test]
    fn overrides_apply_per_submitter() {
        let mut config = RateLimitConfig::default();
        config.submitter_limits.insert(
            "bulk".to_string(),
            SubmitterRateLimit {
                messages_per_minute: 600.0,
                burst_size: 100,
            },
        );
        let limiter = RateLimiter::new(config);

        for _ in 0..100 {
            assert!(limiter.check(Some("bulk"), epoch()).is_ok());
        }
        assert!(limiter.check(Some("bulk"), epoch()).is_err());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(60.0, 2, epoch());
        bucket.refill(epoch() + TimeDelta::hours(1));
        assert!((bucket.tokens - 2.0).abs() < f64::EPSILON);
    }
}
