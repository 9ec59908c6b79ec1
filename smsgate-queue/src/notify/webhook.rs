use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smsgate_store::Notification;

use super::{NotificationSink, SinkError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'a str,
    message: &'a str,
    priority: &'static str,
    timestamp: String,
    data: &'a serde_json::Value,
}

impl<'a> From<&'a Notification> for Payload<'a> {
    fn from(notification: &'a Notification) -> Self {
        Self {
            kind: notification.kind.as_str(),
            title: &notification.title,
            message: &notification.message,
            priority: notification.priority.as_str(),
            timestamp: notification.created_at.to_rfc3339(),
            data: &notification.data,
        }
    }
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    /// # Errors
    /// Returns [`SinkError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &WebhookConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("smsgate-webhook")
            .build()
            .map_err(|e| SinkError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Payload::from(notification))
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use smsgate_store::{NewNotification, NotificationKind, NotificationPriority};

    use super::*;

    #[test]
    fn payload_shape() {
        let notification = Notification::from_new(
            NewNotification {
                kind: NotificationKind::PermanentFailure,
                title: "SMS delivery failed".into(),
                message: "to +33612345678".into(),
                priority: NotificationPriority::High,
                data: serde_json::json!({ "recipient": "+33612345678" }),
            },
            DateTime::<Utc>::default(),
        );

        let payload = serde_json::to_value(Payload::from(&notification)).expect("payload");
        assert_eq!(
            payload,
            serde_json::json!({
                "type": "sms_failed",
                "title": "SMS delivery failed",
                "message": "to +33612345678",
                "priority": "high",
                "timestamp": "1970-01-01T00:00:00+00:00",
                "data": { "recipient": "+33612345678" },
            })
        );
    }
}
