use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use smsgate_store::Notification;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Rejected with status {status}")]
    Rejected { status: u16 },

    #[error("{0}")]
    Other(String),
}

/// Something that forwards notifications outside the gateway.
#[async_trait]
pub trait NotificationSink: Send + Sync + Debug {
    /// Short name used in logs and failure reasons.
    fn name(&self) -> &str;

    /// # Errors
    /// Returns [`SinkError`] when the notification was not accepted.
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Keeps what it receives, optionally refusing everything.
///
/// Clones share the same inbox.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    received: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every delivery.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        if self.failing {
            return Err(SinkError::Other("recording sink refused".to_string()));
        }
        self.received.lock().push(notification.clone());
        Ok(())
    }
}
