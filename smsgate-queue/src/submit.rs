use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smsgate_common::{Clock, internal};
use smsgate_store::{MessageId, MessageStatus, MessageStore, NewMessage};

use crate::{
    SubmissionConfig, SubmitError,
    rate_limit::RateLimiter,
    validate::{normalize_recipient, validate_body},
};

/// A message as handed over by a submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub recipient: String,
    pub body: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submitter: Option<String>,
}

const fn default_priority() -> i32 {
    1
}

impl EnqueueRequest {
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
            priority: default_priority(),
            scheduled_at: None,
            submitter: None,
        }
    }
}

/// The only way new messages enter the queue.
#[derive(Debug, Clone)]
pub struct SubmissionService {
    messages: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    config: SubmissionConfig,
}

impl SubmissionService {
    #[must_use]
    pub fn new(
        messages: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            messages,
            clock,
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            config,
        }
    }

    /// Validate, throttle and store a new message.
    ///
    /// # Errors
    /// Returns [`SubmitError::Invalid`] for a bad recipient or body,
    /// [`SubmitError::Throttled`] when the submitter is over its rate, or
    /// [`SubmitError::Store`] if the message could not be stored.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<MessageId, SubmitError> {
        let recipient =
            normalize_recipient(&request.recipient, self.config.default_country_code.as_deref())?;
        let encoding = validate_body(&request.body, &self.config)?;

        let now = self.clock.now();
        self.limiter
            .check(request.submitter.as_deref(), now)
            .map_err(|retry_after| SubmitError::Throttled { retry_after })?;

        let message = self
            .messages
            .insert(
                NewMessage {
                    recipient,
                    body: request.body,
                    encoding,
                    priority: request.priority,
                    scheduled_at: request.scheduled_at,
                    submitter: request.submitter,
                },
                now,
            )
            .await?;

        internal!(
            level = INFO,
            id = %message.id,
            recipient = %message.recipient,
            status = %message.status,
            "Message queued"
        );
        Ok(message.id)
    }

    /// Requeue a failed message on an operator's request.
    ///
    /// The retry count is kept, so a message that exhausted its budget goes
    /// out once more and fails for good again if that attempt fails too.
    ///
    /// # Errors
    /// Returns [`SubmitError::NotRetryable`] unless the message is failed.
    pub async fn retry(&self, id: MessageId) -> Result<(), SubmitError> {
        let message = self.messages.get(id).await?;
        if !matches!(message.status, MessageStatus::Failed(_)) {
            return Err(SubmitError::NotRetryable {
                id,
                status: message.status,
            });
        }

        self.messages.reset_to_pending(id, self.clock.now()).await?;
        internal!(level = INFO, %id, "Failed message requeued by operator");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use smsgate_common::ManualClock;
    use smsgate_store::{BodyEncoding, FailureKind, MemoryStore, ModemId};

    use super::*;
    use crate::{RateLimitConfig, ValidationError};

    fn service(store: &MemoryStore, clock: &ManualClock, burst: u32) -> SubmissionService {
        SubmissionService::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            SubmissionConfig {
                rate_limit: RateLimitConfig {
                    burst_size: burst,
                    ..RateLimitConfig::default()
                },
                ..SubmissionConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn enqueue_normalizes_and_classifies() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let id = service(&store, &clock, 10)
            .enqueue(EnqueueRequest::new("06 12 34 56 78", "Réunion à 14h"))
            .await
            .expect("enqueue");

        let stored = store.get(id).await.expect("get");
        assert_eq!(stored.recipient, "+33612345678");
        assert_eq!(stored.encoding, BodyEncoding::Gsm7);
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.priority, 1);
    }

    #[tokio::test]
    async fn future_schedule_is_stored_as_scheduled() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let request = EnqueueRequest {
            scheduled_at: Some(clock.now() + TimeDelta::hours(2)),
            ..EnqueueRequest::new("+33612345678", "later")
        };

        let id = service(&store, &clock, 10)
            .enqueue(request)
            .await
            .expect("enqueue");
        assert_eq!(
            store.get(id).await.expect("get").status,
            MessageStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn invalid_submissions_are_not_stored() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let service = service(&store, &clock, 10);

        let err = service
            .enqueue(EnqueueRequest::new("12", "hello"))
            .await
            .expect_err("bad recipient");
        assert!(matches!(
            err,
            SubmitError::Invalid(ValidationError::InvalidRecipient(_))
        ));

        let err = service
            .enqueue(EnqueueRequest::new("+33612345678", ""))
            .await
            .expect_err("empty body");
        assert!(matches!(err, SubmitError::Invalid(ValidationError::EmptyBody)));

        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn submitters_are_throttled() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let service = service(&store, &clock, 2);
        let request = || EnqueueRequest {
            submitter: Some("crm".to_string()),
            ..EnqueueRequest::new("+33612345678", "hello")
        };

        service.enqueue(request()).await.expect("first");
        service.enqueue(request()).await.expect("second");
        let err = service.enqueue(request()).await.expect_err("throttled");
        assert!(matches!(err, SubmitError::Throttled { .. }));

        clock.advance(TimeDelta::seconds(1));
        service.enqueue(request()).await.expect("refilled");
        assert_eq!(store.message_count(), 3);
    }

    #[tokio::test]
    async fn only_failed_messages_can_be_retried() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let service = service(&store, &clock, 10);
        let id = service
            .enqueue(EnqueueRequest::new("+33612345678", "hello"))
            .await
            .expect("enqueue");

        assert!(matches!(
            service.retry(id).await,
            Err(SubmitError::NotRetryable { .. })
        ));

        store.claim(id, ModemId(1), clock.now()).await.expect("claim");
        store.increment_retry(id).await.expect("increment");
        MessageStore::mark_failed(&store, id, FailureKind::MaxRetries, "no carrier", clock.now())
            .await
            .expect("fail");

        service.retry(id).await.expect("retry");
        let stored = store.get(id).await.expect("get");
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.retry_count, 1);
    }
}
