pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryStore, SqliteStore, TestStore};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use r#trait::{InboxStore, MessageStore, ModemRegistry, NotificationStore, StoreHandles};
pub use types::{
    BodyEncoding, ClaimOutcome, DUPLICATE_WINDOW_SECS, FailureKind, Message, MessageId,
    MessageStatus, Modem, ModemId, NewMessage, NewModem, NewNotification, NewReceivedSms,
    Notification, NotificationId, NotificationKind, NotificationPriority, ReceivedId, ReceivedSms,
    StatusCounts, StatusLabel,
};
