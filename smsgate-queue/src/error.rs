use std::time::Duration;

use smsgate_dispatch::DispatchError;
use smsgate_store::{MessageId, MessageStatus, StoreError};
use thiserror::Error;

use crate::ValidationError;

/// Reasons a queue cycle stopped early.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store failed as a whole; nothing more can be done this cycle.
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// The driver could not be started.
    #[error("Dispatch failure: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invalid queue configuration: {0}")]
    Configuration(String),
}

/// Reasons a submission or an administrative requeue was refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Too many submissions, retry in {}s", retry_after.as_secs().max(1))]
    Throttled { retry_after: Duration },

    #[error("Message {id} is {status}; only failed messages can be retried")]
    NotRetryable { id: MessageId, status: MessageStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}
