use std::fmt::{self, Debug, Display, Formatter};

use async_trait::async_trait;
use smsgate_store::{Message, Modem};

use crate::DispatchError;

/// Normalized result of one driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed { detail: String },
}

impl DispatchOutcome {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
        }
    }

    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

impl Display for DispatchOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => f.write_str("sent"),
            Self::Failed { detail } => write!(f, "failed: {detail}"),
        }
    }
}

/// Sends one message through one modem.
///
/// Implementations never retry; the queue engine owns the retry policy.
#[async_trait]
pub trait Dispatcher: Send + Sync + Debug {
    /// # Errors
    /// Returns [`DispatchError`] only when the driver could not be run.
    async fn send(&self, message: &Message, modem: &Modem) -> Result<DispatchOutcome, DispatchError>;
}
