//! SQLite-backed stores.
//!
//! All statements run on tokio-rusqlite's background thread, one at a time,
//! which gives every operation row-level atomicity without extra locking.
//! Timestamps are stored as unix milliseconds.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{
    OptionalExtension, Row, params, params_from_iter,
    types::{Type, Value},
};
use smsgate_common::{clock::cutoff, internal};

use crate::{
    Result, StoreError,
    r#trait::{InboxStore, MessageStore, ModemRegistry, NotificationStore},
    types::{
        BodyEncoding, ClaimOutcome, FailureKind, Message, MessageId, MessageStatus, Modem,
        ModemId, NewMessage, NewModem, NewNotification, NewReceivedSms, Notification,
        NotificationId, NotificationKind, NotificationPriority, ReceivedId, ReceivedSms,
        StatusCounts, StatusLabel, duplicate_window,
    },
};

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS messages (
    id                    TEXT PRIMARY KEY,
    recipient             TEXT NOT NULL,
    body                  TEXT NOT NULL,
    encoding              TEXT NOT NULL,
    status                TEXT NOT NULL,
    error_kind            TEXT,
    priority              INTEGER NOT NULL DEFAULT 0,
    submitter             TEXT,
    scheduled_at          INTEGER,
    assigned_modem        INTEGER,
    retry_count           INTEGER NOT NULL DEFAULT 0,
    last_retry_at         INTEGER,
    processing_started_at INTEGER,
    error_detail          TEXT,
    created_at            INTEGER NOT NULL,
    sent_at               INTEGER,
    failed_at             INTEGER
);
CREATE INDEX IF NOT EXISTS idx_messages_ready
    ON messages (status, priority DESC, created_at);

CREATE TABLE IF NOT EXISTS modems (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    device_path   TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    is_active     INTEGER NOT NULL DEFAULT 1,
    last_used_at  INTEGER,
    sent_count    INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    last_error_at INTEGER,
    error_count   INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    title         TEXT NOT NULL,
    message       TEXT NOT NULL,
    priority      TEXT NOT NULL,
    priority_rank INTEGER NOT NULL,
    data          TEXT NOT NULL,
    processed     INTEGER NOT NULL DEFAULT 0,
    failed        INTEGER NOT NULL DEFAULT 0,
    error         TEXT,
    created_at    INTEGER NOT NULL,
    processed_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_notifications_pending
    ON notifications (processed, priority_rank, created_at);

CREATE TABLE IF NOT EXISTS received_sms (
    id          TEXT PRIMARY KEY,
    sender      TEXT NOT NULL,
    body        TEXT NOT NULL,
    encoding    TEXT NOT NULL,
    parts       INTEGER NOT NULL DEFAULT 1,
    modem_id    INTEGER,
    received_at INTEGER NOT NULL,
    stored_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_received_sender
    ON received_sms (sender, received_at);
CREATE INDEX IF NOT EXISTS idx_received_at
    ON received_sms (received_at);
";

const MESSAGE_COLUMNS: &str = "id, recipient, body, encoding, status, error_kind, priority, \
     submitter, scheduled_at, assigned_modem, retry_count, last_retry_at, \
     processing_started_at, error_detail, created_at, sent_at, failed_at";

const MODEM_COLUMNS: &str = "id, name, device_path, priority, is_active, last_used_at, \
     sent_count, last_error, last_error_at, error_count, created_at";

const NOTIFICATION_COLUMNS: &str = "id, kind, title, message, priority, data, processed, \
     failed, error, created_at, processed_at";

const RECEIVED_COLUMNS: &str =
    "id, sender, body, encoding, parts, modem_id, received_at, stored_at";

/// Stores backed by a single SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened and
    /// [`StoreError::Database`] if the schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        internal!("Opening SQLite store at {}", path.display());

        let conn = tokio_rusqlite::Connection::open(&path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        Self::with_connection(conn).await
    }

    /// A private in-memory database, mostly useful in tests.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: tokio_rusqlite::Connection) -> Result<Self> {
        conn.call(|conn| -> rusqlite::Result<()> { conn.execute_batch(SCHEMA) })
            .await?;
        Ok(Self { conn })
    }

    async fn execute(&self, sql: &'static str, values: Vec<Value>) -> Result<usize> {
        Ok(self
            .conn
            .call(move |conn| -> rusqlite::Result<usize> {
                conn.execute(sql, params_from_iter(values))
            })
            .await?)
    }

    async fn query_messages(&self, sql: String, values: Vec<Value>) -> Result<Vec<Message>> {
        Ok(self
            .conn
            .call(move |conn| -> rusqlite::Result<Vec<Message>> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), message_from_row)?;
                rows.collect()
            })
            .await?)
    }

    async fn current_status(&self, id: MessageId) -> Result<(MessageStatus, Option<ModemId>)> {
        let message = MessageStore::get(self, id).await?;
        Ok((message.status, message.assigned_modem))
    }

    /// Report why a conditional update touched no row.
    async fn rejected(&self, id: MessageId, to: &'static str) -> StoreError {
        match self.current_status(id).await {
            Ok((from, _)) => StoreError::InvalidTransition { id, from, to },
            Err(e) => e,
        }
    }
}

fn ms(at: DateTime<Utc>) -> Value {
    Value::Integer(at.timestamp_millis())
}

fn opt_ms(at: Option<DateTime<Utc>>) -> Value {
    at.map_or(Value::Null, ms)
}

fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

fn opt_text(s: Option<String>) -> Value {
    s.map_or(Value::Null, Value::Text)
}

fn limit(n: usize) -> Value {
    Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn bad_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), Type::Text)
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|millis| {
            DateTime::from_timestamp_millis(millis)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
        })
        .transpose()
}

fn status_from_columns(status: &str, error_kind: Option<&str>) -> Option<MessageStatus> {
    Some(match status {
        "pending" => MessageStatus::Pending,
        "scheduled" => MessageStatus::Scheduled,
        "processing" => MessageStatus::Processing,
        "sent" => MessageStatus::Sent,
        "failed" => MessageStatus::Failed(FailureKind::parse(error_kind?)?),
        _ => return None,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let encoding: String = row.get(3)?;
    let status: String = row.get(4)?;
    let error_kind: Option<String> = row.get(5)?;
    let retry_count: i64 = row.get(10)?;

    Ok(Message {
        id: id.parse().map_err(|_| bad_column(0, "id"))?,
        recipient: row.get(1)?,
        body: row.get(2)?,
        encoding: BodyEncoding::parse(&encoding).ok_or_else(|| bad_column(3, "encoding"))?,
        status: status_from_columns(&status, error_kind.as_deref())
            .ok_or_else(|| bad_column(4, "status"))?,
        priority: row.get(6)?,
        submitter: row.get(7)?,
        scheduled_at: opt_time_at(row, 8)?,
        assigned_modem: row.get::<_, Option<i64>>(9)?.map(ModemId),
        retry_count: u32::try_from(retry_count)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(10, retry_count))?,
        last_retry_at: opt_time_at(row, 11)?,
        processing_started_at: opt_time_at(row, 12)?,
        error_detail: row.get(13)?,
        created_at: time_at(row, 14)?,
        sent_at: opt_time_at(row, 15)?,
        failed_at: opt_time_at(row, 16)?,
    })
}

fn modem_from_row(row: &Row<'_>) -> rusqlite::Result<Modem> {
    let sent_count: i64 = row.get(6)?;
    let error_count: i64 = row.get(9)?;

    Ok(Modem {
        id: ModemId(row.get(0)?),
        name: row.get(1)?,
        device_path: row.get(2)?,
        priority: row.get(3)?,
        is_active: row.get(4)?,
        last_used_at: opt_time_at(row, 5)?,
        sent_count: u64::try_from(sent_count)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(6, sent_count))?,
        last_error: row.get(7)?,
        last_error_at: opt_time_at(row, 8)?,
        error_count: u64::try_from(error_count)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(9, error_count))?,
        created_at: time_at(row, 10)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let priority: String = row.get(4)?;
    let data: String = row.get(5)?;

    Ok(Notification {
        id: id.parse().map_err(|_| bad_column(0, "id"))?,
        kind: NotificationKind::parse(&kind).ok_or_else(|| bad_column(1, "kind"))?,
        title: row.get(2)?,
        message: row.get(3)?,
        priority: NotificationPriority::parse(&priority)
            .ok_or_else(|| bad_column(4, "priority"))?,
        data: serde_json::from_str(&data).map_err(|_| bad_column(5, "data"))?,
        processed: row.get(6)?,
        failed: row.get(7)?,
        error: row.get(8)?,
        created_at: time_at(row, 9)?,
        processed_at: opt_time_at(row, 10)?,
    })
}

fn received_from_row(row: &Row<'_>) -> rusqlite::Result<ReceivedSms> {
    let id: String = row.get(0)?;
    let encoding: String = row.get(3)?;
    let parts: i64 = row.get(4)?;

    Ok(ReceivedSms {
        id: id.parse().map_err(|_| bad_column(0, "id"))?,
        sender: row.get(1)?,
        body: row.get(2)?,
        encoding: BodyEncoding::parse(&encoding).ok_or_else(|| bad_column(3, "encoding"))?,
        parts: u32::try_from(parts)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, parts))?,
        modem: row.get::<_, Option<i64>>(5)?.map(ModemId),
        received_at: time_at(row, 6)?,
        stored_at: time_at(row, 7)?,
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert(&self, message: NewMessage, now: DateTime<Utc>) -> Result<Message> {
        let message = Message::from_new(message, now);
        self.execute(
            "INSERT INTO messages (id, recipient, body, encoding, status, priority, submitter, \
             scheduled_at, retry_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            vec![
                text(message.id.to_string()),
                text(message.recipient.clone()),
                text(message.body.clone()),
                text(message.encoding.as_str()),
                text(message.status.label().as_str()),
                Value::Integer(i64::from(message.priority)),
                opt_text(message.submitter.clone()),
                opt_ms(message.scheduled_at),
                ms(now),
            ],
        )
        .await?;
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        self.query_messages(sql, vec![text(id.to_string())])
            .await?
            .pop()
            .ok_or(StoreError::MessageNotFound(id))
    }

    async fn list(&self, status: Option<StatusLabel>, limit_to: usize) -> Result<Vec<Message>> {
        match status {
            Some(label) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                );
                self.query_messages(sql, vec![text(label.as_str()), limit(limit_to)])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     ORDER BY created_at DESC, id DESC LIMIT ?1"
                );
                self.query_messages(sql, vec![limit(limit_to)]).await
            }
        }
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows = self
            .conn
            .call(|conn| -> rusqlite::Result<Vec<(String, Option<String>, i64)>> {
                let mut stmt = conn.prepare(
                    "SELECT status, error_kind, COUNT(*) FROM messages \
                     GROUP BY status, error_kind",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
                rows.collect()
            })
            .await?;

        let mut counts = StatusCounts::default();
        for (status, error_kind, count) in rows {
            let status = status_from_columns(&status, error_kind.as_deref())
                .ok_or_else(|| StoreError::Corrupted(format!("unknown status '{status}'")))?;
            let count = usize::try_from(count)
                .map_err(|_| StoreError::Corrupted(format!("negative count for '{status}'")))?;
            counts.add(status, count);
        }
        Ok(counts)
    }

    async fn fetch_ready(&self, limit_to: usize, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status IN ('pending', 'scheduled') \
             AND (scheduled_at IS NULL OR scheduled_at <= ?1) \
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?2"
        );
        self.query_messages(sql, vec![ms(now), limit(limit_to)])
            .await
    }

    async fn claim(
        &self,
        id: MessageId,
        modem: ModemId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let changed = self
            .execute(
                "UPDATE messages SET status = 'processing', processing_started_at = ?2, \
                 assigned_modem = ?3 \
                 WHERE id = ?1 AND status IN ('pending', 'scheduled')",
                vec![text(id.to_string()), ms(now), Value::Integer(modem.0)],
            )
            .await?;
        if changed == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        match self.current_status(id).await? {
            (MessageStatus::Processing, Some(assigned)) if assigned == modem => {
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            (from, _) => Err(StoreError::InvalidTransition {
                id,
                from,
                to: "processing",
            }),
        }
    }

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<()> {
        let changed = self
            .execute(
                "UPDATE messages SET status = 'sent', sent_at = ?2, error_kind = NULL, \
                 error_detail = NULL WHERE id = ?1 AND status = 'processing'",
                vec![text(id.to_string()), ms(now)],
            )
            .await?;
        if changed == 1 {
            Ok(())
        } else {
            Err(self.rejected(id, "sent").await)
        }
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let changed = self
            .execute(
                "UPDATE messages SET status = 'failed', error_kind = ?2, error_detail = ?3, \
                 failed_at = ?4 WHERE id = ?1 AND status = 'processing'",
                vec![
                    text(id.to_string()),
                    text(kind.as_str()),
                    text(detail),
                    ms(now),
                ],
            )
            .await?;
        if changed == 1 {
            Ok(())
        } else {
            Err(self.rejected(id, "failed").await)
        }
    }

    async fn increment_retry(&self, id: MessageId) -> Result<u32> {
        let key = id.to_string();
        let count = self
            .conn
            .call(move |conn| -> rusqlite::Result<Option<i64>> {
                conn.query_row(
                    "UPDATE messages SET retry_count = retry_count + 1 WHERE id = ?1 \
                     RETURNING retry_count",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?
            .ok_or(StoreError::MessageNotFound(id))?;
        u32::try_from(count).map_err(|_| StoreError::Corrupted(format!("retry_count {count}")))
    }

    async fn reset_to_pending(&self, id: MessageId, now: DateTime<Utc>) -> Result<()> {
        let changed = self
            .execute(
                "UPDATE messages SET status = 'pending', processing_started_at = NULL, \
                 error_kind = NULL, error_detail = NULL, last_retry_at = ?2 \
                 WHERE id = ?1 AND status IN ('processing', 'failed')",
                vec![text(id.to_string()), ms(now)],
            )
            .await?;
        if changed == 1 {
            return Ok(());
        }

        match self.current_status(id).await? {
            (MessageStatus::Pending, _) => Ok(()),
            (from, _) => Err(StoreError::InvalidTransition {
                id,
                from,
                to: "pending",
            }),
        }
    }

    async fn find_stuck(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'processing' AND processing_started_at < ?1 \
             ORDER BY processing_started_at ASC"
        );
        self.query_messages(sql, vec![ms(cutoff(now, threshold))])
            .await
    }

    async fn find_retry_eligible(
        &self,
        max_retries: u32,
        retry_delay: Duration,
        limit_to: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'failed' AND error_kind = 'retry_later' \
             AND retry_count < ?1 \
             AND (last_retry_at IS NULL OR last_retry_at < ?2) \
             AND (failed_at IS NULL OR failed_at <= ?2) \
             ORDER BY created_at ASC, id ASC LIMIT ?3"
        );
        self.query_messages(
            sql,
            vec![
                Value::Integer(i64::from(max_retries)),
                ms(cutoff(now, retry_delay)),
                limit(limit_to),
            ],
        )
        .await
    }
}

impl SqliteStore {
    async fn query_modems(&self, sql: String, values: Vec<Value>) -> Result<Vec<Modem>> {
        Ok(self
            .conn
            .call(move |conn| -> rusqlite::Result<Vec<Modem>> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), modem_from_row)?;
                rows.collect()
            })
            .await?)
    }

    async fn update_modem(&self, id: ModemId, sql: &'static str, values: Vec<Value>) -> Result<()> {
        if self.execute(sql, values).await? == 1 {
            Ok(())
        } else {
            Err(StoreError::ModemNotFound(id))
        }
    }

    async fn query_notifications(
        &self,
        sql: String,
        values: Vec<Value>,
    ) -> Result<Vec<Notification>> {
        Ok(self
            .conn
            .call(move |conn| -> rusqlite::Result<Vec<Notification>> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), notification_from_row)?;
                rows.collect()
            })
            .await?)
    }

    async fn update_notification(
        &self,
        id: NotificationId,
        sql: &'static str,
        values: Vec<Value>,
    ) -> Result<()> {
        if self.execute(sql, values).await? == 1 {
            Ok(())
        } else {
            Err(StoreError::NotificationNotFound(id))
        }
    }
}

#[async_trait]
impl ModemRegistry for SqliteStore {
    async fn register(&self, modem: NewModem, now: DateTime<Utc>) -> Result<Modem> {
        let NewModem {
            name,
            device_path,
            priority,
            is_active,
        } = modem;
        let id = self
            .conn
            .call(move |conn| -> rusqlite::Result<i64> {
                conn.execute(
                    "INSERT INTO modems (name, device_path, priority, is_active, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![name, device_path, priority, is_active, now.timestamp_millis()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        ModemRegistry::get(self, ModemId(id)).await
    }

    async fn get(&self, id: ModemId) -> Result<Modem> {
        let sql = format!("SELECT {MODEM_COLUMNS} FROM modems WHERE id = ?1");
        self.query_modems(sql, vec![Value::Integer(id.0)])
            .await?
            .pop()
            .ok_or(StoreError::ModemNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Modem>> {
        let sql = format!("SELECT {MODEM_COLUMNS} FROM modems ORDER BY id ASC");
        self.query_modems(sql, Vec::new()).await
    }

    async fn best_available(&self) -> Result<Option<Modem>> {
        // `last_used_at IS NOT NULL` sorts never-used modems first.
        let sql = format!(
            "SELECT {MODEM_COLUMNS} FROM modems WHERE is_active = 1 \
             ORDER BY priority DESC, last_used_at IS NOT NULL, last_used_at ASC, \
             sent_count ASC, id ASC LIMIT 1"
        );
        Ok(self.query_modems(sql, Vec::new()).await?.pop())
    }

    async fn record_success(&self, id: ModemId, now: DateTime<Utc>) -> Result<()> {
        self.update_modem(
            id,
            "UPDATE modems SET sent_count = sent_count + 1, last_used_at = ?2 WHERE id = ?1",
            vec![Value::Integer(id.0), ms(now)],
        )
        .await
    }

    async fn record_error(&self, id: ModemId, detail: &str, now: DateTime<Utc>) -> Result<Modem> {
        self.update_modem(
            id,
            "UPDATE modems SET last_error = ?2, last_error_at = ?3, \
             error_count = error_count + 1 WHERE id = ?1",
            vec![Value::Integer(id.0), text(detail), ms(now)],
        )
        .await?;
        ModemRegistry::get(self, id).await
    }

    async fn set_active(&self, id: ModemId, active: bool) -> Result<()> {
        self.update_modem(
            id,
            "UPDATE modems SET is_active = ?2 WHERE id = ?1",
            vec![Value::Integer(id.0), Value::Integer(i64::from(active))],
        )
        .await
    }

    async fn clear_error(&self, id: ModemId) -> Result<()> {
        self.update_modem(
            id,
            "UPDATE modems SET last_error = NULL, last_error_at = NULL, error_count = 0 \
             WHERE id = ?1",
            vec![Value::Integer(id.0)],
        )
        .await
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn create(
        &self,
        notification: NewNotification,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        let notification = Notification::from_new(notification, now);
        let data = serde_json::to_string(&notification.data)
            .map_err(|e| StoreError::Corrupted(format!("notification data: {e}")))?;
        self.execute(
            "INSERT INTO notifications (id, kind, title, message, priority, priority_rank, \
             data, processed, failed, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8)",
            vec![
                text(notification.id.to_string()),
                text(notification.kind.as_str()),
                text(notification.title.clone()),
                text(notification.message.clone()),
                text(notification.priority.as_str()),
                Value::Integer(notification.priority.rank()),
                text(data),
                ms(now),
            ],
        )
        .await?;
        Ok(notification)
    }

    async fn get(&self, id: NotificationId) -> Result<Notification> {
        let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1");
        self.query_notifications(sql, vec![text(id.to_string())])
            .await?
            .pop()
            .ok_or(StoreError::NotificationNotFound(id))
    }

    async fn pending(&self, limit_to: usize) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE processed = 0 \
             ORDER BY priority_rank ASC, created_at ASC, id ASC LIMIT ?1"
        );
        self.query_notifications(sql, vec![limit(limit_to)]).await
    }

    async fn mark_processed(&self, id: NotificationId, now: DateTime<Utc>) -> Result<()> {
        self.update_notification(
            id,
            "UPDATE notifications SET processed = 1, processed_at = ?2 WHERE id = ?1",
            vec![text(id.to_string()), ms(now)],
        )
        .await
    }

    async fn mark_failed(&self, id: NotificationId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.update_notification(
            id,
            "UPDATE notifications SET processed = 1, failed = 1, error = ?2, processed_at = ?3 \
             WHERE id = ?1",
            vec![text(id.to_string()), text(reason), ms(now)],
        )
        .await
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.execute(
            "DELETE FROM notifications WHERE processed = 1 AND created_at < ?1",
            vec![ms(cutoff)],
        )
        .await
    }
}

impl SqliteStore {
    async fn query_received(&self, sql: String, values: Vec<Value>) -> Result<Vec<ReceivedSms>> {
        Ok(self
            .conn
            .call(move |conn| -> rusqlite::Result<Vec<ReceivedSms>> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), received_from_row)?;
                rows.collect()
            })
            .await?)
    }
}

#[async_trait]
impl InboxStore for SqliteStore {
    async fn record(&self, sms: NewReceivedSms, now: DateTime<Utc>) -> Result<Option<ReceivedSms>> {
        let sms = ReceivedSms::from_new(sms, now);
        let window = duplicate_window().num_milliseconds();
        let row = sms.clone();
        let inserted = self
            .conn
            .call(move |conn| -> rusqlite::Result<bool> {
                let tx = conn.transaction()?;
                let received = row.received_at.timestamp_millis();
                let duplicate: bool = tx.query_row(
                    "SELECT EXISTS (SELECT 1 FROM received_sms WHERE sender = ?1 AND body = ?2 \
                     AND received_at BETWEEN ?3 AND ?4)",
                    params![row.sender, row.body, received - window, received + window],
                    |r| r.get(0),
                )?;
                if duplicate {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO received_sms (id, sender, body, encoding, parts, modem_id, \
                     received_at, stored_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id.to_string(),
                        row.sender,
                        row.body,
                        row.encoding.as_str(),
                        i64::from(row.parts),
                        row.modem.map(|m| m.0),
                        received,
                        row.stored_at.timestamp_millis(),
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(inserted.then_some(sms))
    }

    async fn get(&self, id: ReceivedId) -> Result<ReceivedSms> {
        let sql = format!("SELECT {RECEIVED_COLUMNS} FROM received_sms WHERE id = ?1");
        self.query_received(sql, vec![text(id.to_string())])
            .await?
            .pop()
            .ok_or(StoreError::ReceivedNotFound(id))
    }

    async fn list_received(&self, search: Option<&str>, limit_to: usize) -> Result<Vec<ReceivedSms>> {
        match search {
            Some(needle) => {
                // instr() is a plain substring test, like the memory store.
                let sql = format!(
                    "SELECT {RECEIVED_COLUMNS} FROM received_sms \
                     WHERE instr(sender, ?1) > 0 OR instr(body, ?1) > 0 \
                     ORDER BY received_at DESC, id DESC LIMIT ?2"
                );
                self.query_received(sql, vec![text(needle), limit(limit_to)])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {RECEIVED_COLUMNS} FROM received_sms \
                     ORDER BY received_at DESC, id DESC LIMIT ?1"
                );
                self.query_received(sql, vec![limit(limit_to)]).await
            }
        }
    }

    async fn purge_received_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.execute(
            "DELETE FROM received_sms WHERE received_at < ?1",
            vec![ms(cutoff)],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use smsgate_common::{Clock, ManualClock};

    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.db");

        let first = SqliteStore::open(&path).await.expect("open");
        let now = ManualClock::default().now();
        first
            .insert(NewMessage::new("+33612345678", "persisted", 1), now)
            .await
            .expect("insert");
        drop(first);

        let second = SqliteStore::open(&path).await.expect("reopen");
        let counts = second.counts().await.expect("counts");
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn failed_status_keeps_its_kind() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let now = ManualClock::default().now();
        let msg = store
            .insert(NewMessage::new("+33612345678", "hello", 0), now)
            .await
            .expect("insert");

        store.claim(msg.id, ModemId(7), now).await.expect("claim");
        MessageStore::mark_failed(&store, msg.id, FailureKind::MaxRetries, "no signal", now)
            .await
            .expect("fail");

        let stored = MessageStore::get(&store, msg.id).await.expect("get");
        assert_eq!(stored.status, MessageStatus::Failed(FailureKind::MaxRetries));
        assert_eq!(stored.error_detail.as_deref(), Some("no signal"));
        assert_eq!(stored.assigned_modem, Some(ModemId(7)));

        let counts = store.counts().await.expect("counts");
        assert_eq!(counts.failed_permanent, 1);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn counts_come_from_grouped_rows() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let now = ManualClock::default().now();
        for _ in 0..3 {
            store
                .insert(NewMessage::new("+33612345678", "hello", 0), now)
                .await
                .expect("insert");
        }

        let counts = store.counts().await.expect("counts");
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn increment_retry_reports_missing_rows() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let missing = MessageId::generate();
        assert!(matches!(
            store.increment_retry(missing).await,
            Err(StoreError::MessageNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn notification_data_round_trips_as_json() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let clock = ManualClock::default();
        let created = store
            .create(
                NewNotification {
                    kind: NotificationKind::ModemOffline,
                    title: "Modem offline".into(),
                    message: "usb0 stopped answering".into(),
                    priority: NotificationPriority::High,
                    data: serde_json::json!({ "device_path": "/dev/ttyUSB0" }),
                },
                clock.now(),
            )
            .await
            .expect("create");
        clock.advance(TimeDelta::seconds(1));

        let fetched = NotificationStore::get(&store, created.id)
            .await
            .expect("get");
        assert_eq!(fetched, created);
    }
}
