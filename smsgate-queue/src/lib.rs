//! The SMS queue: one engine cycle that moves messages from submission to a
//! modem, the notifications it raises along the way, the submission path
//! that feeds it, and the inbox poller for the opposite direction.

mod config;
mod engine;
mod error;
mod inbox;
pub mod notify;
mod rate_limit;
mod report;
mod submit;
mod validate;

pub use config::{MAX_BATCH_SIZE, NotificationConfig, QueueConfig, SubmissionConfig};
pub use engine::QueueEngine;
pub use error::{QueueError, SubmitError};
pub use inbox::{InboxConfig, InboxPoller, ReceiveReport};
pub use notify::{
    Delivery, DrainSummary, EmailConfig, EmailSink, NotificationSink, NotificationTrigger,
    RecordingSink, SinkError, SmtpSecurity, WebhookConfig, WebhookSink,
};
pub use rate_limit::{RateLimitConfig, RateLimiter, SubmitterRateLimit};
pub use report::CycleReport;
pub use submit::{EnqueueRequest, SubmissionService};
pub use validate::{
    ValidationError, body_encoding, normalize_recipient, parts_count, validate_body,
};
