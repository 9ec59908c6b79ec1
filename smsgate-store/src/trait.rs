use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Result,
    types::{
        ClaimOutcome, FailureKind, Message, MessageId, Modem, ModemId, NewMessage, NewModem,
        NewNotification, NewReceivedSms, Notification, NotificationId, ReceivedId, ReceivedSms,
        StatusCounts, StatusLabel,
    },
};

/// Durable home of queued messages and their state machine.
///
/// Every method is atomic for the row it touches. Methods that stamp a time
/// take `now` from the caller so one cycle uses one consistent clock.
#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    /// Insert a freshly submitted message as `Pending`, or `Scheduled` when
    /// its `scheduled_at` lies in the future.
    async fn insert(&self, message: NewMessage, now: DateTime<Utc>) -> Result<Message>;

    async fn get(&self, id: MessageId) -> Result<Message>;

    /// Newest first, optionally restricted to one status.
    async fn list(&self, status: Option<StatusLabel>, limit: usize) -> Result<Vec<Message>>;

    async fn counts(&self) -> Result<StatusCounts>;

    /// Pending or due Scheduled messages, `priority desc, created_at asc`.
    async fn fetch_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Move a queued message to `Processing` on `modem`.
    ///
    /// Claiming a message that is already `Processing` on the same modem is
    /// a no-op reported as [`ClaimOutcome::AlreadyClaimed`].
    async fn claim(&self, id: MessageId, modem: ModemId, now: DateTime<Utc>)
    -> Result<ClaimOutcome>;

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(
        &self,
        id: MessageId,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Bump `retry_count` whatever the status is, returning the new value.
    async fn increment_retry(&self, id: MessageId) -> Result<u32>;

    /// Return a `Processing` or `Failed` message to `Pending`.
    ///
    /// Doing so for a message that is already `Pending` changes nothing, so
    /// reclaiming twice is harmless.
    async fn reset_to_pending(&self, id: MessageId, now: DateTime<Utc>) -> Result<()>;

    async fn find_stuck(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Message>>;

    /// `Failed(RetryLater)` messages under the retry budget whose last
    /// failure and last requeue are both older than `retry_delay`.
    async fn find_retry_eligible(
        &self,
        max_retries: u32,
        retry_delay: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>>;
}

/// Known modems and the arbitration policy between them.
#[async_trait]
pub trait ModemRegistry: Send + Sync + Debug {
    async fn register(&self, modem: NewModem, now: DateTime<Utc>) -> Result<Modem>;

    async fn get(&self, id: ModemId) -> Result<Modem>;

    async fn list(&self) -> Result<Vec<Modem>>;

    /// The active modem to use next, or `None` when there is no capacity.
    async fn best_available(&self) -> Result<Option<Modem>>;

    async fn record_success(&self, id: ModemId, now: DateTime<Utc>) -> Result<()>;

    /// Note a failure against the modem and return the updated row.
    /// The modem stays active.
    async fn record_error(&self, id: ModemId, detail: &str, now: DateTime<Utc>) -> Result<Modem>;

    async fn set_active(&self, id: ModemId, active: bool) -> Result<()>;

    async fn clear_error(&self, id: ModemId) -> Result<()>;
}

/// Notification records, produced by the trigger and consumed by sinks.
#[async_trait]
pub trait NotificationStore: Send + Sync + Debug {
    async fn create(&self, notification: NewNotification, now: DateTime<Utc>)
    -> Result<Notification>;

    async fn get(&self, id: NotificationId) -> Result<Notification>;

    /// Unprocessed notifications, most urgent first, then oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<Notification>>;

    async fn mark_processed(&self, id: NotificationId, now: DateTime<Utc>) -> Result<()>;

    /// Record a delivery failure. This is terminal: the notification counts
    /// as processed and is not offered again.
    async fn mark_failed(&self, id: NotificationId, reason: &str, now: DateTime<Utc>)
    -> Result<()>;

    /// Delete processed notifications created before `cutoff`.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// SMS received by the modems.
#[async_trait]
pub trait InboxStore: Send + Sync + Debug {
    /// Store an incoming SMS, or return `None` when it duplicates one already
    /// stored (see [`ReceivedSms::duplicates`]). Check and insert are atomic.
    async fn record(&self, sms: NewReceivedSms, now: DateTime<Utc>) -> Result<Option<ReceivedSms>>;

    async fn get(&self, id: ReceivedId) -> Result<ReceivedSms>;

    /// Newest `received_at` first. `search` keeps rows whose sender or body
    /// contains it.
    async fn list_received(&self, search: Option<&str>, limit: usize) -> Result<Vec<ReceivedSms>>;

    /// Delete SMS received before `cutoff`.
    async fn purge_received_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// The stores, opened together from one configuration.
#[derive(Debug, Clone)]
pub struct StoreHandles {
    pub messages: Arc<dyn MessageStore>,
    pub modems: Arc<dyn ModemRegistry>,
    pub notifications: Arc<dyn NotificationStore>,
    pub inbox: Arc<dyn InboxStore>,
}

impl StoreHandles {
    /// Use one backend value for every role.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: MessageStore + ModemRegistry + NotificationStore + InboxStore + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            messages: backend.clone(),
            modems: backend.clone(),
            notifications: backend.clone(),
            inbox: backend,
        }
    }
}
