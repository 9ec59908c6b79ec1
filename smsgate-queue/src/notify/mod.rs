//! Operational alerts.
//!
//! The trigger records a notification and immediately tries to push it
//! through every configured sink. Nothing here can fail a queue cycle:
//! store and sink errors are logged and the notification is left for the
//! next drain, or marked failed.

mod email;
mod sink;
mod webhook;

use std::sync::Arc;

use serde_json::json;
use smsgate_common::{Clock, internal};
use smsgate_store::{
    Message, Modem, NewNotification, Notification, NotificationId, NotificationKind,
    NotificationPriority, NotificationStore,
};

pub use email::{EmailConfig, EmailSink, SmtpSecurity};
pub use sink::{NotificationSink, RecordingSink, SinkError};
pub use webhook::{WebhookConfig, WebhookSink};

use crate::NotificationConfig;

/// What happened to one notification handed to the sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// At least one sink took it, or there is no sink to take it.
    Delivered,
    /// Every sink refused it; it is marked failed.
    Failed,
    /// The outcome could not be recorded; it stays pending.
    Unrecorded,
}

/// Counts from one [`NotificationTrigger::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct NotificationTrigger {
    store: Arc<dyn NotificationStore>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    clock: Arc<dyn Clock>,
}

impl NotificationTrigger {
    /// A trigger that only records notifications.
    #[must_use]
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            clock,
        }
    }

    /// # Errors
    /// Returns an error if a configured sink cannot be built.
    pub fn from_config(
        store: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
        config: &NotificationConfig,
    ) -> Result<Self, SinkError> {
        let mut trigger = Self::new(store, clock);
        if let Some(email) = &config.email {
            trigger = trigger.with_sink(Arc::new(EmailSink::new(email)?));
        }
        if let Some(webhook) = &config.webhook {
            trigger = trigger.with_sink(Arc::new(WebhookSink::new(webhook)?));
        }
        Ok(trigger)
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn permanent_failure(&self, message: &Message, detail: &str) -> Option<NotificationId> {
        self.raise(NewNotification {
            kind: NotificationKind::PermanentFailure,
            title: "SMS delivery failed".to_string(),
            message: format!("Could not deliver SMS to {}: {detail}", message.recipient),
            priority: NotificationPriority::High,
            data: json!({
                "sms_id": message.id.to_string(),
                "recipient": message.recipient,
                "error": detail,
                "retry_count": message.retry_count,
            }),
        })
        .await
    }

    pub async fn queue_blocked(&self, pending: usize) -> Option<NotificationId> {
        self.raise(NewNotification {
            kind: NotificationKind::QueueBlocked,
            title: "SMS queue blocked".to_string(),
            message: format!("The SMS queue holds {pending} pending messages"),
            priority: NotificationPriority::Medium,
            data: json!({ "queue_size": pending }),
        })
        .await
    }

    pub async fn modem_offline(&self, modem: &Modem) -> Option<NotificationId> {
        self.raise(NewNotification {
            kind: NotificationKind::ModemOffline,
            title: "Modem offline".to_string(),
            message: format!(
                "Modem {} ({}) is not responding",
                modem.name, modem.device_path
            ),
            priority: NotificationPriority::High,
            data: json!({
                "modem_name": modem.name,
                "device_path": modem.device_path,
                "error_count": modem.error_count,
                "last_error": modem.last_error,
            }),
        })
        .await
    }

    async fn raise(&self, notification: NewNotification) -> Option<NotificationId> {
        let kind = notification.kind;
        match self.store.create(notification, self.clock.now()).await {
            Ok(created) => {
                internal!(level = INFO, id = %created.id, %kind, "{}", created.title);
                self.deliver(&created).await;
                Some(created.id)
            }
            Err(e) => {
                internal!(level = ERROR, %kind, "Unable to record notification: {e}");
                None
            }
        }
    }

    /// Offer `notification` to every sink and record the result.
    pub async fn deliver(&self, notification: &Notification) -> Delivery {
        let mut failures = Vec::new();
        let mut accepted = self.sinks.is_empty();

        for sink in &self.sinks {
            match sink.deliver(notification).await {
                Ok(()) => accepted = true,
                Err(e) => {
                    internal!(
                        level = WARN,
                        id = %notification.id,
                        sink = sink.name(),
                        "Notification not delivered: {e}"
                    );
                    failures.push(format!("{}: {e}", sink.name()));
                }
            }
        }

        let now = self.clock.now();
        let recorded = if accepted {
            self.store.mark_processed(notification.id, now).await
        } else {
            self.store
                .mark_failed(notification.id, &failures.join("; "), now)
                .await
        };

        match recorded {
            Ok(()) if accepted => Delivery::Delivered,
            Ok(()) => Delivery::Failed,
            Err(e) => {
                internal!(
                    level = ERROR,
                    id = %notification.id,
                    "Unable to record notification delivery: {e}"
                );
                Delivery::Unrecorded
            }
        }
    }

    /// Deliver up to `limit` pending notifications, most urgent first.
    pub async fn drain(&self, limit: usize) -> DrainSummary {
        let pending = match self.store.pending(limit).await {
            Ok(pending) => pending,
            Err(e) => {
                internal!(level = ERROR, "Unable to list pending notifications: {e}");
                return DrainSummary::default();
            }
        };

        let mut summary = DrainSummary::default();
        for notification in &pending {
            match self.deliver(notification).await {
                Delivery::Delivered => summary.delivered += 1,
                Delivery::Failed => summary.failed += 1,
                Delivery::Unrecorded => {}
            }
        }
        summary
    }

    pub(crate) fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use smsgate_common::ManualClock;
    use smsgate_store::{MemoryStore, NewMessage, TestStore};

    use super::*;

    fn trigger(store: &MemoryStore) -> NotificationTrigger {
        NotificationTrigger::new(Arc::new(store.clone()), Arc::new(ManualClock::default()))
    }

    fn message() -> Message {
        Message::from_new(NewMessage::new("+33612345678", "hi", 0), Utc::now())
    }

    #[tokio::test]
    async fn without_sinks_notifications_are_processed() {
        let store = MemoryStore::new();
        let id = trigger(&store)
            .permanent_failure(&message(), "max retries")
            .await
            .expect("recorded");

        let stored = NotificationStore::get(&store, id).await.expect("get");
        assert!(stored.processed);
        assert!(!stored.failed);
        assert_eq!(stored.priority, NotificationPriority::High);
        assert_eq!(stored.data["recipient"], "+33612345678");
    }

    #[tokio::test]
    async fn one_accepting_sink_is_enough() {
        let store = MemoryStore::new();
        let recorder = RecordingSink::new();
        let trigger = trigger(&store)
            .with_sink(Arc::new(RecordingSink::failing()))
            .with_sink(Arc::new(recorder.clone()));

        let id = trigger.queue_blocked(150).await.expect("recorded");

        let stored = NotificationStore::get(&store, id).await.expect("get");
        assert!(stored.processed && !stored.failed);
        assert_eq!(recorder.received().len(), 1);
        assert_eq!(recorder.received()[0].data["queue_size"], 150);
    }

    #[tokio::test]
    async fn all_sinks_failing_marks_the_notification_failed() {
        let store = MemoryStore::new();
        let trigger = trigger(&store).with_sink(Arc::new(RecordingSink::failing()));

        let id = trigger.queue_blocked(101).await.expect("recorded");

        let stored = NotificationStore::get(&store, id).await.expect("get");
        assert!(stored.processed && stored.failed);
        assert_eq!(
            stored.error.as_deref(),
            Some("recording: recording sink refused")
        );
        assert!(store.pending(10).await.expect("pending").is_empty());
    }

    #[test]
    fn configured_sinks_are_installed() {
        let config = NotificationConfig {
            email: Some(EmailConfig {
                smtp_host: "localhost".into(),
                smtp_port: 25,
                security: SmtpSecurity::Plain,
                username: None,
                password: None,
                from: "gateway@example.com".into(),
                to: Vec::new(),
                timeout_secs: 1,
            }),
            webhook: Some(WebhookConfig {
                url: "http://127.0.0.1:9/hook".into(),
                timeout_secs: 1,
            }),
        };
        let trigger = NotificationTrigger::from_config(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
            &config,
        )
        .expect("trigger");

        let names: Vec<_> = trigger.sinks.iter().map(|sink| sink.name()).collect();
        assert_eq!(names, vec!["email", "webhook"]);
    }

    #[tokio::test]
    async fn store_outage_is_swallowed() {
        let store = TestStore::new();
        store.set_offline(true);
        let trigger = NotificationTrigger::new(Arc::new(store), Arc::new(ManualClock::default()));

        assert_eq!(trigger.queue_blocked(500).await, None);
        assert_eq!(trigger.drain(20).await, DrainSummary::default());
    }
}
