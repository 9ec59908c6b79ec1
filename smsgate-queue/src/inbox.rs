//! Inbound SMS: poll every active modem through the receiver and keep what
//! it returns in the inbox store.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use smsgate_common::{Clock, clock::cutoff, device, internal};
use smsgate_dispatch::{ReceiveOutcome, SmsReceiver};
use smsgate_store::{InboxStore, ModemRegistry, NewReceivedSms};

use crate::{QueueError, body_encoding, parts_count};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboxConfig {
    /// Received SMS older than this are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl InboxConfig {
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

/// What one receive pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveReport {
    pub modems_polled: usize,
    /// Modems whose receiver reported a failure
    pub modems_failed: usize,
    pub stored: usize,
    /// Messages already in the inbox
    pub duplicates: usize,
}

impl Display for ReceiveReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "modems={} failed={} stored={} duplicates={}",
            self.modems_polled, self.modems_failed, self.stored, self.duplicates
        )
    }
}

#[derive(Debug, Clone)]
pub struct InboxPoller {
    inbox: Arc<dyn InboxStore>,
    modems: Arc<dyn ModemRegistry>,
    receiver: Arc<dyn SmsReceiver>,
    clock: Arc<dyn Clock>,
}

impl InboxPoller {
    #[must_use]
    pub fn new(
        inbox: Arc<dyn InboxStore>,
        modems: Arc<dyn ModemRegistry>,
        receiver: Arc<dyn SmsReceiver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inbox,
            modems,
            receiver,
            clock,
        }
    }

    /// Ask every active modem for waiting SMS and store the new ones.
    ///
    /// A modem whose receiver reports a failure is skipped.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] when the store fails and
    /// [`QueueError::Dispatch`] when the receiver cannot be started.
    pub async fn poll(&self) -> Result<ReceiveReport, QueueError> {
        let mut report = ReceiveReport::default();

        for modem in self.modems.list().await?.into_iter().filter(|m| m.is_active) {
            report.modems_polled += 1;
            let messages = match self.receiver.receive(&modem).await? {
                ReceiveOutcome::Received(messages) => messages,
                ReceiveOutcome::Failed { detail } => {
                    device!(level = WARN, device = %modem.device_path, "Receive failed: {detail}");
                    report.modems_failed += 1;
                    continue;
                }
            };

            for incoming in messages {
                let now = self.clock.now();
                let encoding = body_encoding(&incoming.message);
                let sms = NewReceivedSms {
                    parts: parts_count(&incoming.message, encoding),
                    encoding,
                    sender: incoming.sender,
                    body: incoming.message,
                    modem: Some(modem.id),
                    received_at: incoming.received_at.unwrap_or(now),
                };
                match self.inbox.record(sms, now).await? {
                    Some(stored) => {
                        device!(
                            level = INFO,
                            id = %stored.id,
                            sender = %stored.sender,
                            device = %modem.device_path,
                            "SMS received"
                        );
                        report.stored += 1;
                    }
                    None => report.duplicates += 1,
                }
            }
        }

        Ok(report)
    }

    /// Delete received SMS older than `retention`.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] when the purge fails.
    pub async fn purge(&self, retention: Duration) -> Result<usize, QueueError> {
        let purged = self
            .inbox
            .purge_received_before(cutoff(self.clock.now(), retention))
            .await?;
        if purged > 0 {
            internal!(level = INFO, purged, "Purged old received SMS");
        }
        Ok(purged)
    }
}
