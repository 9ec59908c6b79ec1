//! Error types for the smsgate-store crate.
//!
//! Errors fall in two groups. Row-local errors (a missing id, a transition
//! the row's current state does not allow) concern a single message and the
//! queue engine skips that message. Infrastructure errors (database failures,
//! an unreachable store) concern every row and abort the whole cycle.

use thiserror::Error;

use crate::types::{MessageId, MessageStatus, ModemId, NotificationId, ReceivedId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed a statement.
    #[error("Database error: {0}")]
    Database(String),

    /// The store cannot be reached at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Modem not found: {0}")]
    ModemNotFound(ModemId),

    #[error("Notification not found: {0}")]
    NotificationNotFound(NotificationId),

    #[error("Received SMS not found: {0}")]
    ReceivedNotFound(ReceivedId),

    /// The requested transition is not allowed from the row's current state.
    #[error("Message {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: &'static str,
    },

    /// Invalid store configuration.
    #[error("Invalid store configuration: {0}")]
    Configuration(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Concerns a single row; the rest of the store is healthy.
    #[must_use]
    pub const fn is_row_local(&self) -> bool {
        matches!(
            self,
            Self::MessageNotFound(_)
                | Self::ModemNotFound(_)
                | Self::NotificationNotFound(_)
                | Self::ReceivedNotFound(_)
                | Self::InvalidTransition { .. }
        )
    }

    /// The store as a whole is failing.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        !self.is_row_local()
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for StoreError {
    fn from(e: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Self::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_local_errors_do_not_count_as_infrastructure() {
        let missing = StoreError::MessageNotFound(MessageId::generate());
        assert!(missing.is_row_local());
        assert!(!missing.is_infrastructure());

        let transition = StoreError::InvalidTransition {
            id: MessageId::generate(),
            from: MessageStatus::Sent,
            to: "processing",
        };
        assert!(transition.is_row_local());
    }

    #[test]
    fn database_errors_are_infrastructure() {
        let err = StoreError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_infrastructure());
        assert!(err.to_string().starts_with("Database error"));

        assert!(StoreError::Unavailable("offline".into()).is_infrastructure());
    }
}
