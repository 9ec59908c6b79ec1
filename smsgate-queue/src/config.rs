use std::time::Duration;

use serde::Deserialize;

use crate::{
    QueueError,
    notify::{EmailConfig, WebhookConfig},
    rate_limit::RateLimitConfig,
};

/// Largest batch a single dispatch pass may fetch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Tunables for one queue cycle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Messages fetched per dispatch pass (1 to 500)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Failed attempts after which a message is failed for good
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum wait before a failed message is requeued
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,

    /// A message `Processing` for longer than this is presumed abandoned
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// Pending count above which the queue is reported as blocked
    #[serde(default = "default_queue_blocked_threshold")]
    pub queue_blocked_threshold: usize,

    #[serde(default = "default_notification_batch_size")]
    pub notification_batch_size: usize,

    /// Processed notifications older than this are purged
    #[serde(default = "default_notification_retention_days")]
    pub notification_retention_days: u32,

    /// Modem error count that raises a modem-offline notification
    #[serde(default = "default_modem_offline_threshold")]
    pub modem_offline_threshold: u64,
}

const fn default_batch_size() -> usize {
    10
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_secs() -> u64 {
    300
}

const fn default_retry_batch_size() -> usize {
    50
}

const fn default_stuck_threshold_secs() -> u64 {
    600
}

const fn default_queue_blocked_threshold() -> usize {
    100
}

const fn default_notification_batch_size() -> usize {
    20
}

const fn default_notification_retention_days() -> u32 {
    7
}

const fn default_modem_offline_threshold() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            retry_batch_size: default_retry_batch_size(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            queue_blocked_threshold: default_queue_blocked_threshold(),
            notification_batch_size: default_notification_batch_size(),
            notification_retention_days: default_notification_retention_days(),
            modem_offline_threshold: default_modem_offline_threshold(),
        }
    }
}

impl QueueConfig {
    /// # Errors
    /// Returns [`QueueError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), QueueError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(QueueError::Configuration(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.max_retries == 0 {
            return Err(QueueError::Configuration(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_batch_size == 0 || self.notification_batch_size == 0 {
            return Err(QueueError::Configuration(
                "retry_batch_size and notification_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    #[must_use]
    pub const fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    #[must_use]
    pub fn notification_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.notification_retention_days) * 24 * 60 * 60)
    }
}

/// Rules applied to new submissions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmissionConfig {
    /// Digits that replace a leading `0` in a national number.
    /// `None` rejects national numbers instead.
    #[serde(default = "default_country_code")]
    pub default_country_code: Option<String>,

    #[serde(default = "default_max_gsm_chars")]
    pub max_gsm_chars: usize,

    #[serde(default = "default_max_unicode_chars")]
    pub max_unicode_chars: usize,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an Option field")]
fn default_country_code() -> Option<String> {
    Some("33".to_string())
}

const fn default_max_gsm_chars() -> usize {
    160
}

const fn default_max_unicode_chars() -> usize {
    70
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            default_country_code: default_country_code(),
            max_gsm_chars: default_max_gsm_chars(),
            max_unicode_chars: default_max_unicode_chars(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Where notifications go besides the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub email: Option<EmailConfig>,

    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}
