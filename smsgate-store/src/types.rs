//! Rows owned by the stores and the identifiers that address them.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::LazyLock,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

static ULIDS: LazyLock<Mutex<ulid::Generator>> = LazyLock::new(|| Mutex::new(ulid::Generator::new()));

/// Next ULID from a process-wide monotonic generator.
///
/// Ids minted within the same millisecond still sort in the order they were
/// handed out, which is what keeps equal-priority messages FIFO when their
/// `created_at` collides.
fn next_ulid() -> ulid::Ulid {
    // Overflow needs 2^80 ids in one millisecond.
    ULIDS.lock().generate().unwrap_or_else(|_| ulid::Ulid::new())
}

/// Identifier for a queued message.
///
/// A ULID, so ids sort by creation time and can be handed to operators as
/// short opaque strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self { id: next_ulid() }
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s.trim()).map(Self::new)
    }
}

/// Identifier for a registered modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModemId(pub i64);

impl Display for ModemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "modem#{}", self.0)
    }
}

/// Identifier for a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub ulid::Ulid);

impl NotificationId {
    #[must_use]
    pub fn generate() -> Self {
        Self(next_ulid())
    }
}

impl Display for NotificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NotificationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s.trim()).map(Self)
    }
}

/// Identifier for a received SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceivedId(pub ulid::Ulid);

impl ReceivedId {
    #[must_use]
    pub fn generate() -> Self {
        Self(next_ulid())
    }
}

impl Display for ReceivedId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReceivedId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s.trim()).map(Self)
    }
}

/// Why a message is in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The dispatch failed but the retry budget is not exhausted yet.
    RetryLater,
    /// The retry budget is exhausted; only an operator can requeue it.
    MaxRetries,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetryLater => "retry_later",
            Self::MaxRetries => "max_retries",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retry_later" => Some(Self::RetryLater),
            "max_retries" => Some(Self::MaxRetries),
            _ => None,
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a message.
///
/// ```text
/// Pending/Scheduled --claim--> Processing --> Sent
///        ^                         |
///        |                         +--> Failed(RetryLater | MaxRetries)
///        +---- reset_to_pending ---+------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Scheduled,
    Processing,
    Sent,
    Failed(FailureKind),
}

impl MessageStatus {
    #[must_use]
    pub const fn label(self) -> StatusLabel {
        match self {
            Self::Pending => StatusLabel::Pending,
            Self::Scheduled => StatusLabel::Scheduled,
            Self::Processing => StatusLabel::Processing,
            Self::Sent => StatusLabel::Sent,
            Self::Failed(_) => StatusLabel::Failed,
        }
    }

    #[must_use]
    pub const fn failure_kind(self) -> Option<FailureKind> {
        match self {
            Self::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    /// Waiting for a dispatch pass to pick it up.
    #[must_use]
    pub const fn is_queued(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed ({kind})"),
            other => f.write_str(other.label().as_str()),
        }
    }
}

/// A [`MessageStatus`] without its payload, for filtering and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusLabel {
    Pending,
    Scheduled,
    Processing,
    Sent,
    Failed,
}

impl StatusLabel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StatusLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

impl Display for StatusLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character set the body needs on the air interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyEncoding {
    Gsm7,
    Unicode,
}

impl BodyEncoding {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gsm7 => "gsm7",
            Self::Unicode => "unicode",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gsm7" => Some(Self::Gsm7),
            "unicode" => Some(Self::Unicode),
            _ => None,
        }
    }
}

/// A message as accepted by the submission path, before the store assigns
/// its id and lifecycle fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub recipient: String,
    pub body: String,
    pub encoding: BodyEncoding,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub submitter: Option<String>,
}

impl NewMessage {
    /// Convenience constructor for an unscheduled GSM-7 message.
    pub fn new(recipient: impl Into<String>, body: impl Into<String>, priority: i32) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
            encoding: BodyEncoding::Gsm7,
            priority,
            scheduled_at: None,
            submitter: None,
        }
    }

    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub recipient: String,
    pub body: String,
    pub encoding: BodyEncoding,
    pub status: MessageStatus,
    pub priority: i32,
    pub submitter: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub assigned_modem: Option<ModemId>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Build the stored row for a freshly submitted message.
    ///
    /// A message scheduled in the future starts out `Scheduled`, everything
    /// else starts out `Pending`.
    #[must_use]
    pub fn from_new(new: NewMessage, now: DateTime<Utc>) -> Self {
        let status = match new.scheduled_at {
            Some(at) if at > now => MessageStatus::Scheduled,
            _ => MessageStatus::Pending,
        };

        Self {
            id: MessageId::generate(),
            recipient: new.recipient,
            body: new.body,
            encoding: new.encoding,
            status,
            priority: new.priority,
            submitter: new.submitter,
            scheduled_at: new.scheduled_at,
            assigned_modem: None,
            retry_count: 0,
            last_retry_at: None,
            processing_started_at: None,
            error_detail: None,
            created_at: now,
            sent_at: None,
            failed_at: None,
        }
    }

    #[must_use]
    pub const fn error_kind(&self) -> Option<FailureKind> {
        self.status.failure_kind()
    }

    /// Whether a dispatch pass at `now` may pick this message up.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_queued() && self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// Outcome of [`crate::MessageStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The message moved to `Processing` with this call.
    Claimed,
    /// The message was already `Processing` for the same modem; nothing changed.
    AlreadyClaimed,
}

/// Aggregate counts for the status query interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed_retryable: usize,
    pub failed_permanent: usize,
}

impl StatusCounts {
    #[must_use]
    pub const fn failed(&self) -> usize {
        self.failed_retryable + self.failed_permanent
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.scheduled + self.processing + self.sent + self.failed()
    }

    /// Count `n` more messages in `status`.
    pub(crate) fn add(&mut self, status: MessageStatus, n: usize) {
        let bucket = match status {
            MessageStatus::Pending => &mut self.pending,
            MessageStatus::Scheduled => &mut self.scheduled,
            MessageStatus::Processing => &mut self.processing,
            MessageStatus::Sent => &mut self.sent,
            MessageStatus::Failed(FailureKind::RetryLater) => &mut self.failed_retryable,
            MessageStatus::Failed(FailureKind::MaxRetries) => &mut self.failed_permanent,
        };
        *bucket += n;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewModem {
    pub name: String,
    pub device_path: String,
    pub priority: i32,
    pub is_active: bool,
}

impl NewModem {
    pub fn new(name: impl Into<String>, device_path: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            device_path: device_path.into(),
            priority,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modem {
    pub id: ModemId,
    pub name: String,
    pub device_path: String,
    pub priority: i32,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub sent_count: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Modem {
    /// Arbitration order: higher priority first, then the modem idle the
    /// longest (never used counts as longest), then the one that has sent
    /// the least, then the lowest id.
    #[must_use]
    pub fn arbitration_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.last_used_at.cmp(&other.last_used_at))
            .then_with(|| self.sent_count.cmp(&other.sent_count))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    PermanentFailure,
    QueueBlocked,
    ModemOffline,
}

impl NotificationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PermanentFailure => "sms_failed",
            Self::QueueBlocked => "queue_blocked",
            Self::ModemOffline => "modem_offline",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sms_failed" => Some(Self::PermanentFailure),
            "queue_blocked" => Some(Self::QueueBlocked),
            "modem_offline" => Some(Self::ModemOffline),
            _ => None,
        }
    }
}

impl Display for NotificationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared most urgent first so the derived `Ord` sorts `High` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationPriority {
    High,
    Medium,
    Low,
}

impl NotificationPriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub(crate) const fn rank(self) -> i64 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl Display for NotificationPriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub data: serde_json::Value,
    pub processed: bool,
    pub failed: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Notification {
    #[must_use]
    pub fn from_new(new: NewNotification, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::generate(),
            kind: new.kind,
            title: new.title,
            message: new.message,
            priority: new.priority,
            data: new.data,
            processed: false,
            failed: false,
            error: None,
            created_at: now,
            processed_at: None,
        }
    }
}

/// Two reads of the same sender and text this close together are one SMS.
pub const DUPLICATE_WINDOW_SECS: i64 = 300;

pub(crate) fn duplicate_window() -> chrono::TimeDelta {
    chrono::TimeDelta::seconds(DUPLICATE_WINDOW_SECS)
}

/// An incoming SMS as read from a modem, before the inbox assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReceivedSms {
    pub sender: String,
    pub body: String,
    pub encoding: BodyEncoding,
    /// Single-SMS parts the body occupied on the air interface.
    pub parts: u32,
    pub modem: Option<ModemId>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedSms {
    pub id: ReceivedId,
    pub sender: String,
    pub body: String,
    pub encoding: BodyEncoding,
    pub parts: u32,
    pub modem: Option<ModemId>,
    pub received_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl ReceivedSms {
    #[must_use]
    pub fn from_new(new: NewReceivedSms, now: DateTime<Utc>) -> Self {
        Self {
            id: ReceivedId::generate(),
            sender: new.sender,
            body: new.body,
            encoding: new.encoding,
            parts: new.parts,
            modem: new.modem,
            received_at: new.received_at,
            stored_at: now,
        }
    }

    /// Whether `other` is the same SMS read a second time: same sender and
    /// text, received within [`DUPLICATE_WINDOW_SECS`] of this one.
    #[must_use]
    pub fn duplicates(&self, other: &NewReceivedSms) -> bool {
        self.sender == other.sender
            && self.body == other.body
            && (self.received_at - other.received_at).abs() <= duplicate_window()
    }

    /// Case-sensitive substring match on sender or body.
    #[must_use]
    pub fn matches(&self, search: &str) -> bool {
        self.sender.contains(search) || self.body.contains(search)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;

    fn modem(id: i64, priority: i32, last_used: Option<i64>, sent: u64) -> Modem {
        let epoch = DateTime::<Utc>::default();
        Modem {
            id: ModemId(id),
            name: format!("m{id}"),
            device_path: format!("/dev/ttyUSB{id}"),
            priority,
            is_active: true,
            last_used_at: last_used.map(|s| epoch + TimeDelta::seconds(s)),
            sent_count: sent,
            last_error: None,
            last_error_at: None,
            error_count: 0,
            created_at: epoch,
        }
    }

    #[test]
    fn arbitration_prefers_priority_then_idle_then_sent_count() {
        let mut modems = vec![
            modem(1, 1, Some(100), 0),
            modem(2, 5, Some(100), 0),
            modem(3, 5, None, 10),
            modem(4, 5, Some(50), 0),
            modem(5, 5, None, 2),
        ];
        modems.sort_by(Modem::arbitration_cmp);

        let order: Vec<_> = modems.iter().map(|m| m.id.0).collect();
        assert_eq!(order, vec![5, 3, 4, 2, 1]);
    }

    #[test]
    fn future_schedule_starts_scheduled() {
        let now = Utc::now();
        let later = NewMessage::new("+33612345678", "hi", 0).scheduled_at(now + TimeDelta::hours(1));
        let past = NewMessage::new("+33612345678", "hi", 0).scheduled_at(now - TimeDelta::hours(1));

        assert_eq!(Message::from_new(later, now).status, MessageStatus::Scheduled);
        assert_eq!(Message::from_new(past, now).status, MessageStatus::Pending);
    }

    #[test]
    fn error_kind_only_exists_for_failed_messages() {
        let now = Utc::now();
        let mut message = Message::from_new(NewMessage::new("+33612345678", "hi", 0), now);
        assert_eq!(message.error_kind(), None);

        message.status = MessageStatus::Failed(FailureKind::RetryLater);
        assert_eq!(message.error_kind(), Some(FailureKind::RetryLater));

        message.status = MessageStatus::Sent;
        assert_eq!(message.error_kind(), None);
    }

    #[test]
    fn status_labels_parse_case_insensitively() {
        assert_eq!("Failed".parse::<StatusLabel>(), Ok(StatusLabel::Failed));
        assert!("bogus".parse::<StatusLabel>().is_err());
    }

    #[test]
    fn ids_minted_together_sort_in_minting_order() {
        let ids: Vec<_> = (0..64).map(|_| MessageId::generate()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, ids);
    }

    #[test]
    fn counts_accumulate_per_status() {
        let mut counts = StatusCounts::default();
        counts.add(MessageStatus::Pending, 3);
        counts.add(MessageStatus::Failed(FailureKind::MaxRetries), 2);
        counts.add(MessageStatus::Pending, 1);

        assert_eq!(counts.pending, 4);
        assert_eq!(counts.failed_permanent, 2);
        assert_eq!(counts.failed(), 2);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn duplicates_need_same_sender_and_text_within_the_window() {
        let now = Utc::now();
        let new = |sender: &str, body: &str, offset_secs: i64| NewReceivedSms {
            sender: sender.into(),
            body: body.into(),
            encoding: BodyEncoding::Gsm7,
            parts: 1,
            modem: None,
            received_at: now + TimeDelta::seconds(offset_secs),
        };
        let stored = ReceivedSms::from_new(new("+33600000001", "ping", 0), now);

        assert!(stored.duplicates(&new("+33600000001", "ping", 299)));
        assert!(stored.duplicates(&new("+33600000001", "ping", -300)));
        assert!(!stored.duplicates(&new("+33600000001", "ping", 301)));
        assert!(!stored.duplicates(&new("+33600000002", "ping", 0)));
        assert!(!stored.duplicates(&new("+33600000001", "pong", 0)));
    }

    #[test]
    fn message_ids_round_trip_through_strings() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().expect("valid ulid");
        assert_eq!(parsed, id);
    }
}
