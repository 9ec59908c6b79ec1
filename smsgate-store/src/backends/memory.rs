use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, RwLock,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smsgate_common::clock::cutoff;

use crate::{
    Result, StoreError,
    r#trait::{InboxStore, MessageStore, ModemRegistry, NotificationStore},
    types::{
        ClaimOutcome, FailureKind, Message, MessageId, MessageStatus, Modem, ModemId, NewMessage,
        NewModem, NewNotification, NewReceivedSms, Notification, NotificationId, ReceivedId,
        ReceivedSms, StatusCounts, StatusLabel,
    },
};

/// In-memory implementation of every store.
///
/// Rows live in `HashMap`s behind `RwLock`s, so every operation is atomic
/// for the row it touches. Nothing survives a restart: use it for tests,
/// dry runs and development.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub(crate) messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    pub(crate) modems: Arc<RwLock<BTreeMap<ModemId, Modem>>>,
    pub(crate) notifications: Arc<RwLock<HashMap<NotificationId, Notification>>>,
    pub(crate) inbox: Arc<RwLock<HashMap<ReceivedId, ReceivedSms>>>,
    next_modem_id: Arc<AtomicI64>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Run `f` against one message under the write lock.
    fn with_message<T>(
        &self,
        id: MessageId,
        f: impl FnOnce(&mut Message) -> Result<T>,
    ) -> Result<T> {
        let mut messages = self.messages.write()?;
        let message = messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        f(message)
    }

    fn with_modem<T>(&self, id: ModemId, f: impl FnOnce(&mut Modem) -> T) -> Result<T> {
        let mut modems = self.modems.write()?;
        let modem = modems.get_mut(&id).ok_or(StoreError::ModemNotFound(id))?;
        Ok(f(modem))
    }

    fn with_notification(
        &self,
        id: NotificationId,
        f: impl FnOnce(&mut Notification),
    ) -> Result<()> {
        let mut notifications = self.notifications.write()?;
        let notification = notifications
            .get_mut(&id)
            .ok_or(StoreError::NotificationNotFound(id))?;
        f(notification);
        Ok(())
    }
}

const fn invalid(message: &Message, to: &'static str) -> StoreError {
    StoreError::InvalidTransition {
        id: message.id,
        from: message.status,
        to,
    }
}

fn bounded(mut rows: Vec<Message>, limit: usize) -> Vec<Message> {
    rows.truncate(limit);
    rows
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: NewMessage, now: DateTime<Utc>) -> Result<Message> {
        let message = Message::from_new(message, now);
        self.messages.write()?.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Message> {
        self.messages
            .read()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::MessageNotFound(id))
    }

    async fn list(&self, status: Option<StatusLabel>, limit: usize) -> Result<Vec<Message>> {
        let mut rows: Vec<_> = self
            .messages
            .read()?
            .values()
            .filter(|m| status.is_none_or(|label| m.status.label() == label))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bounded(rows, limit))
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for message in self.messages.read()?.values() {
            counts.add(message.status, 1);
        }
        Ok(counts)
    }

    async fn fetch_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let mut rows: Vec<_> = self
            .messages
            .read()?
            .values()
            .filter(|m| m.is_ready(now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(bounded(rows, limit))
    }

    async fn claim(
        &self,
        id: MessageId,
        modem: ModemId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        self.with_message(id, |message| match message.status {
            MessageStatus::Pending | MessageStatus::Scheduled => {
                message.status = MessageStatus::Processing;
                message.processing_started_at = Some(now);
                message.assigned_modem = Some(modem);
                Ok(ClaimOutcome::Claimed)
            }
            MessageStatus::Processing if message.assigned_modem == Some(modem) => {
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            _ => Err(invalid(message, "processing")),
        })
    }

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<()> {
        self.with_message(id, |message| {
            if message.status != MessageStatus::Processing {
                return Err(invalid(message, "sent"));
            }
            message.status = MessageStatus::Sent;
            message.sent_at = Some(now);
            message.error_detail = None;
            Ok(())
        })
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_message(id, |message| {
            if message.status != MessageStatus::Processing {
                return Err(invalid(message, "failed"));
            }
            message.status = MessageStatus::Failed(kind);
            message.failed_at = Some(now);
            message.error_detail = Some(detail.to_string());
            Ok(())
        })
    }

    async fn increment_retry(&self, id: MessageId) -> Result<u32> {
        self.with_message(id, |message| {
            message.retry_count = message.retry_count.saturating_add(1);
            Ok(message.retry_count)
        })
    }

    async fn reset_to_pending(&self, id: MessageId, now: DateTime<Utc>) -> Result<()> {
        self.with_message(id, |message| match message.status {
            MessageStatus::Pending => Ok(()),
            MessageStatus::Processing | MessageStatus::Failed(_) => {
                message.status = MessageStatus::Pending;
                message.processing_started_at = None;
                message.error_detail = None;
                message.last_retry_at = Some(now);
                Ok(())
            }
            MessageStatus::Scheduled | MessageStatus::Sent => Err(invalid(message, "pending")),
        })
    }

    async fn find_stuck(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let cutoff = cutoff(now, threshold);
        let mut rows: Vec<_> = self
            .messages
            .read()?
            .values()
            .filter(|m| {
                m.status == MessageStatus::Processing
                    && m.processing_started_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.processing_started_at.cmp(&b.processing_started_at));
        Ok(rows)
    }

    async fn find_retry_eligible(
        &self,
        max_retries: u32,
        retry_delay: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let cutoff = cutoff(now, retry_delay);
        let mut rows: Vec<_> = self
            .messages
            .read()?
            .values()
            .filter(|m| {
                m.status == MessageStatus::Failed(FailureKind::RetryLater)
                    && m.retry_count < max_retries
                    && m.last_retry_at.is_none_or(|at| at < cutoff)
                    && m.failed_at.is_none_or(|at| at <= cutoff)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(bounded(rows, limit))
    }
}

#[async_trait]
impl ModemRegistry for MemoryStore {
    async fn register(&self, modem: NewModem, now: DateTime<Utc>) -> Result<Modem> {
        let id = ModemId(self.next_modem_id.fetch_add(1, Ordering::SeqCst) + 1);
        let modem = Modem {
            id,
            name: modem.name,
            device_path: modem.device_path,
            priority: modem.priority,
            is_active: modem.is_active,
            last_used_at: None,
            sent_count: 0,
            last_error: None,
            last_error_at: None,
            error_count: 0,
            created_at: now,
        };
        self.modems.write()?.insert(id, modem.clone());
        Ok(modem)
    }

    async fn get(&self, id: ModemId) -> Result<Modem> {
        self.modems
            .read()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::ModemNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Modem>> {
        Ok(self.modems.read()?.values().cloned().collect())
    }

    async fn best_available(&self) -> Result<Option<Modem>> {
        Ok(self
            .modems
            .read()?
            .values()
            .filter(|m| m.is_active)
            .min_by(|a, b| a.arbitration_cmp(b))
            .cloned())
    }

    async fn record_success(&self, id: ModemId, now: DateTime<Utc>) -> Result<()> {
        self.with_modem(id, |modem| {
            modem.sent_count += 1;
            modem.last_used_at = Some(now);
        })
    }

    async fn record_error(&self, id: ModemId, detail: &str, now: DateTime<Utc>) -> Result<Modem> {
        self.with_modem(id, |modem| {
            modem.last_error = Some(detail.to_string());
            modem.last_error_at = Some(now);
            modem.error_count += 1;
            modem.clone()
        })
    }

    async fn set_active(&self, id: ModemId, active: bool) -> Result<()> {
        self.with_modem(id, |modem| modem.is_active = active)
    }

    async fn clear_error(&self, id: ModemId) -> Result<()> {
        self.with_modem(id, |modem| {
            modem.last_error = None;
            modem.last_error_at = None;
            modem.error_count = 0;
        })
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create(
        &self,
        notification: NewNotification,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        let notification = Notification::from_new(notification, now);
        self.notifications
            .write()?
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn get(&self, id: NotificationId) -> Result<Notification> {
        self.notifications
            .read()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotificationNotFound(id))
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Notification>> {
        let mut rows: Vec<_> = self
            .notifications
            .read()?
            .values()
            .filter(|n| !n.processed)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_processed(&self, id: NotificationId, now: DateTime<Utc>) -> Result<()> {
        self.with_notification(id, |notification| {
            notification.processed = true;
            notification.processed_at = Some(now);
        })
    }

    async fn mark_failed(&self, id: NotificationId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_notification(id, |notification| {
            notification.processed = true;
            notification.failed = true;
            notification.error = Some(reason.to_string());
            notification.processed_at = Some(now);
        })
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut notifications = self.notifications.write()?;
        let before = notifications.len();
        notifications.retain(|_, n| !(n.processed && n.created_at < cutoff));
        Ok(before - notifications.len())
    }
}

#[async_trait]
impl InboxStore for MemoryStore {
    async fn record(&self, sms: NewReceivedSms, now: DateTime<Utc>) -> Result<Option<ReceivedSms>> {
        let mut inbox = self.inbox.write()?;
        if inbox.values().any(|stored| stored.duplicates(&sms)) {
            return Ok(None);
        }
        let sms = ReceivedSms::from_new(sms, now);
        inbox.insert(sms.id, sms.clone());
        Ok(Some(sms))
    }

    async fn get(&self, id: ReceivedId) -> Result<ReceivedSms> {
        self.inbox
            .read()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReceivedNotFound(id))
    }

    async fn list_received(&self, search: Option<&str>, limit: usize) -> Result<Vec<ReceivedSms>> {
        let mut rows: Vec<_> = self
            .inbox
            .read()?
            .values()
            .filter(|sms| search.is_none_or(|needle| sms.matches(needle)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn purge_received_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inbox = self.inbox.write()?;
        let before = inbox.len();
        inbox.retain(|_, sms| sms.received_at >= cutoff);
        Ok(before - inbox.len())
    }
}
