use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// What one queue cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Stuck `Processing` messages returned to `Pending`
    pub reclaimed: usize,
    /// Messages handed to the dispatcher
    pub attempted: usize,
    pub sent: usize,
    pub failed_retryable: usize,
    pub failed_permanent: usize,
    /// Failed messages requeued by the retry pass
    pub requeued: usize,
    /// Messages passed over because their row changed under us
    pub skipped: usize,
    /// The dispatch pass stopped because no modem was available
    pub no_modem: bool,
    pub queue_blocked: bool,
    pub notifications_delivered: usize,
    pub notifications_failed: usize,
}

impl CycleReport {
    /// Nothing was found to do.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.reclaimed == 0
            && self.attempted == 0
            && self.requeued == 0
            && self.skipped == 0
            && self.notifications_delivered == 0
            && self.notifications_failed == 0
    }
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reclaimed={} attempted={} sent={} retry_later={} failed={} requeued={} skipped={}",
            self.reclaimed,
            self.attempted,
            self.sent,
            self.failed_retryable,
            self.failed_permanent,
            self.requeued,
            self.skipped,
        )?;
        if self.no_modem {
            f.write_str(" no_modem")?;
        }
        if self.queue_blocked {
            f.write_str(" queue_blocked")?;
        }
        write!(
            f,
            " notifications={}/{}",
            self.notifications_delivered,
            self.notifications_delivered + self.notifications_failed
        )
    }
}
