//! Control protocol types and serialization

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, TimeZone, Utc, offset::LocalResult};
use serde::{Deserialize, Serialize};
use smsgate_store::{Message, Modem, Notification, ReceivedSms, StatusCounts};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Render unix milliseconds for humans.
fn format_timestamp(timestamp_ms: i64) -> String {
    if let LocalResult::Single(dt) = Utc.timestamp_millis_opt(timestamp_ms) {
        dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    } else {
        "unknown".to_string()
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn optional(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// Request sent to the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub command: RequestCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestCommand {
    System(SystemCommand),
    Queue(QueueCommand),
    Modem(ModemCommand),
    Notification(NotificationCommand),
    Inbox(InboxCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Liveness check
    Ping,
    /// Version, uptime, freeze flag and queue counts
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueCommand {
    /// Most recent messages first, optionally filtered by status label
    List {
        status: Option<String>,
        limit: usize,
    },
    View {
        id: String,
    },
    /// Requeue a failed message
    Retry {
        id: String,
    },
    /// Submit a message through the normal validation path
    Enqueue {
        recipient: String,
        body: String,
        priority: i32,
        /// Unix milliseconds
        scheduled_at: Option<i64>,
        submitter: Option<String>,
    },
    Stats,
    /// Wake the worker for an immediate cycle
    ProcessNow,
    /// Stop starting new cycles until unfrozen
    Freeze,
    Unfreeze,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModemCommand {
    List,
    Add {
        name: String,
        device_path: String,
        priority: i32,
    },
    SetActive {
        id: i64,
        active: bool,
    },
    /// Forget the modem's error history
    ClearError {
        id: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationCommand {
    Pending { limit: usize },
    MarkProcessed { id: String },
    MarkFailed { id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboxCommand {
    /// Newest received SMS first; `search` matches sender or text
    Received {
        search: Option<String>,
        limit: usize,
    },
}

/// Response from the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command succeeded
    Ok,
    /// Command succeeded with data
    Data(Box<ResponseData>),
    /// Command failed with error message
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    SystemStatus(SystemStatus),
    MessageList(Vec<MessageSummary>),
    MessageDetails(MessageDetails),
    QueueStats(QueueStats),
    ModemList(Vec<ModemInfo>),
    Modem(ModemInfo),
    NotificationList(Vec<NotificationInfo>),
    ReceivedList(Vec<ReceivedInfo>),
    /// Id assigned to a newly enqueued message
    Enqueued(String),
    /// Simple string message
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub frozen: bool,
    pub queue: QueueStats,
}

impl Display for SystemStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version:   {}", self.version)?;
        writeln!(f, "Uptime:    {}s", self.uptime_secs)?;
        writeln!(f, "Frozen:    {}", if self.frozen { "yes" } else { "no" })?;
        write!(f, "{}", self.queue)
    }
}

/// Message counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed_retryable: usize,
    pub failed_permanent: usize,
}

impl QueueStats {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending
            + self.scheduled
            + self.processing
            + self.sent
            + self.failed_retryable
            + self.failed_permanent
    }
}

impl From<StatusCounts> for QueueStats {
    fn from(counts: StatusCounts) -> Self {
        Self {
            pending: counts.pending,
            scheduled: counts.scheduled,
            processing: counts.processing,
            sent: counts.sent,
            failed_retryable: counts.failed_retryable,
            failed_permanent: counts.failed_permanent,
        }
    }
}

impl Display for QueueStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pending:    {}", self.pending)?;
        writeln!(f, "Scheduled:  {}", self.scheduled)?;
        writeln!(f, "Processing: {}", self.processing)?;
        writeln!(f, "Sent:       {}", self.sent)?;
        writeln!(
            f,
            "Failed:     {} (retrying {}, permanent {})",
            self.failed_retryable + self.failed_permanent,
            self.failed_retryable,
            self.failed_permanent
        )?;
        writeln!(f, "Total:      {}", self.total())
    }
}

/// One line per message for the list command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub recipient: String,
    pub status: String,
    pub priority: i32,
    pub retry_count: u32,
    pub created_at: i64,
}

impl From<&Message> for MessageSummary {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.to_string(),
            recipient: message.recipient.clone(),
            status: message.status.to_string(),
            priority: message.priority,
            retry_count: message.retry_count,
            created_at: millis(message.created_at),
        }
    }
}

impl Display for MessageSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<16} {:<24} p{} r{}  {}",
            self.id,
            self.recipient,
            self.status,
            self.priority,
            self.retry_count,
            format_timestamp(self.created_at)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetails {
    pub id: String,
    pub recipient: String,
    pub body: String,
    pub encoding: String,
    pub status: String,
    pub priority: i32,
    pub submitter: Option<String>,
    pub assigned_modem: Option<i64>,
    pub retry_count: u32,
    pub error_detail: Option<String>,
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub failed_at: Option<i64>,
}

impl From<&Message> for MessageDetails {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.to_string(),
            recipient: message.recipient.clone(),
            body: message.body.clone(),
            encoding: message.encoding.as_str().to_string(),
            status: message.status.to_string(),
            priority: message.priority,
            submitter: message.submitter.clone(),
            assigned_modem: message.assigned_modem.map(|m| m.0),
            retry_count: message.retry_count,
            error_detail: message.error_detail.clone(),
            created_at: millis(message.created_at),
            scheduled_at: message.scheduled_at.map(millis),
            sent_at: message.sent_at.map(millis),
            failed_at: message.failed_at.map(millis),
        }
    }
}

impl Display for MessageDetails {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "ID:        {}", self.id)?;
        writeln!(f, "Recipient: {}", self.recipient)?;
        writeln!(f, "Status:    {}", self.status)?;
        writeln!(f, "Priority:  {}", self.priority)?;
        writeln!(f, "Encoding:  {}", self.encoding)?;
        writeln!(f, "Retries:   {}", self.retry_count)?;
        writeln!(f, "Submitter: {}", optional(self.submitter.as_deref()))?;
        if let Some(modem) = self.assigned_modem {
            writeln!(f, "Modem:     #{modem}")?;
        }
        writeln!(f, "Created:   {}", format_timestamp(self.created_at))?;
        if let Some(at) = self.scheduled_at {
            writeln!(f, "Scheduled: {}", format_timestamp(at))?;
        }
        if let Some(at) = self.sent_at {
            writeln!(f, "Sent:      {}", format_timestamp(at))?;
        }
        if let Some(at) = self.failed_at {
            writeln!(f, "Failed:    {}", format_timestamp(at))?;
        }
        if let Some(error) = &self.error_detail {
            writeln!(f, "Error:     {error}")?;
        }
        f.write_str("\n--- Body ---\n")?;
        writeln!(f, "{}", self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemInfo {
    pub id: i64,
    pub name: String,
    pub device_path: String,
    pub priority: i32,
    pub is_active: bool,
    pub sent_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_used_at: Option<i64>,
}

impl From<&Modem> for ModemInfo {
    fn from(modem: &Modem) -> Self {
        Self {
            id: modem.id.0,
            name: modem.name.clone(),
            device_path: modem.device_path.clone(),
            priority: modem.priority,
            is_active: modem.is_active,
            sent_count: modem.sent_count,
            error_count: modem.error_count,
            last_error: modem.last_error.clone(),
            last_used_at: modem.last_used_at.map(millis),
        }
    }
}

impl Display for ModemInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:<3} {:<12} {:<16} p{} {:<8} sent {} errors {}",
            self.id,
            self.name,
            self.device_path,
            self.priority,
            if self.is_active { "active" } else { "inactive" },
            self.sent_count,
            self.error_count,
        )?;
        if let Some(at) = self.last_used_at {
            write!(f, " last used {}", format_timestamp(at))?;
        }
        if let Some(error) = &self.last_error {
            write!(f, " last error: {error}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationInfo {
    pub id: String,
    pub kind: String,
    pub priority: String,
    pub title: String,
    pub message: String,
    /// Structured payload, serialized as JSON
    pub data: String,
    pub created_at: i64,
}

impl From<&Notification> for NotificationInfo {
    fn from(notification: &Notification) -> Self {
        Self {
            id: notification.id.to_string(),
            kind: notification.kind.as_str().to_string(),
            priority: notification.priority.as_str().to_string(),
            title: notification.title.clone(),
            message: notification.message.clone(),
            data: notification.data.to_string(),
            created_at: millis(notification.created_at),
        }
    }
}

impl Display for NotificationInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} [{}] {} {}",
            self.id,
            self.priority,
            self.kind,
            format_timestamp(self.created_at)
        )?;
        writeln!(f, "  {}", self.title)?;
        write!(f, "  {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedInfo {
    pub id: String,
    pub sender: String,
    pub body: String,
    pub encoding: String,
    pub parts: u32,
    pub modem: Option<i64>,
    pub received_at: i64,
}

impl From<&ReceivedSms> for ReceivedInfo {
    fn from(sms: &ReceivedSms) -> Self {
        Self {
            id: sms.id.to_string(),
            sender: sms.sender.clone(),
            body: sms.body.clone(),
            encoding: sms.encoding.as_str().to_string(),
            parts: sms.parts,
            modem: sms.modem.map(|m| m.0),
            received_at: millis(sms.received_at),
        }
    }
}

impl Display for ReceivedInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<16} {}",
            self.id,
            self.sender,
            format_timestamp(self.received_at)
        )?;
        if let Some(modem) = self.modem {
            write!(f, " via #{modem}")?;
        }
        if self.parts > 1 {
            write!(f, " ({} parts)", self.parts)?;
        }
        write!(f, "\n  {}", self.body)
    }
}

fn write_lines<T: Display>(f: &mut Formatter<'_>, items: &[T], empty: &str) -> fmt::Result {
    if items.is_empty() {
        return writeln!(f, "{empty}");
    }
    for item in items {
        writeln!(f, "{item}")?;
    }
    Ok(())
}

impl Display for ResponseData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemStatus(status) => write!(f, "{status}"),
            Self::MessageList(messages) => write_lines(f, messages, "No messages"),
            Self::MessageDetails(details) => write!(f, "{details}"),
            Self::QueueStats(stats) => write!(f, "{stats}"),
            Self::ModemList(modems) => write_lines(f, modems, "No modems registered"),
            Self::Modem(modem) => writeln!(f, "{modem}"),
            Self::NotificationList(notifications) => {
                write_lines(f, notifications, "No pending notifications")
            }
            Self::ReceivedList(received) => write_lines(f, received, "No received SMS"),
            Self::Enqueued(id) => writeln!(f, "Queued {id}"),
            Self::Message(message) => writeln!(f, "{message}"),
        }
    }
}

impl Request {
    /// Create a new request with the current protocol version
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    /// Only an exact version match is accepted.
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.payload {
            ResponsePayload::Ok => writeln!(f, "OK"),
            ResponsePayload::Data(data) => write!(f, "{data}"),
            ResponsePayload::Error(e) => writeln!(f, "Error: {e}"),
        }
    }
}
