//! The queue cycle.
//!
//! One cycle runs four passes against the injected stores, in order:
//! reclaim stuck messages, dispatch ready ones, requeue retryable failures,
//! check queue health. A final step drains pending notifications.
//!
//! Store errors that concern a single row (it vanished, or another worker
//! moved it) skip that message. Any other store error, or a driver that
//! cannot be started, aborts the cycle.

use std::{sync::Arc, time::Duration};

use smsgate_common::{Clock, clock::cutoff, internal};
use smsgate_dispatch::{DispatchOutcome, Dispatcher};
use smsgate_store::{
    ClaimOutcome, FailureKind, Message, MessageStatus, MessageStore, Modem, ModemRegistry,
    StoreError,
};

use crate::{CycleReport, NotificationTrigger, QueueConfig, QueueError};

/// Keep the value, turn a row-local error into `None`, propagate the rest.
fn row_local<T>(result: Result<T, StoreError>, action: &str) -> Result<Option<T>, QueueError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_row_local() => {
            internal!(level = WARN, "Skipping {action}: {e}");
            Ok(None)
        }
        Err(e) => Err(QueueError::Store(e)),
    }
}

/// Drives messages through their lifecycle.
///
/// The engine keeps no state between cycles: everything lives in the stores,
/// so any number of cycles (or a fresh process) can pick up where the last
/// one stopped.
#[derive(Debug, Clone)]
pub struct QueueEngine {
    messages: Arc<dyn MessageStore>,
    modems: Arc<dyn ModemRegistry>,
    notifier: NotificationTrigger,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl QueueEngine {
    /// # Errors
    /// Returns [`QueueError::Configuration`] if `config` is out of range.
    pub fn new(
        messages: Arc<dyn MessageStore>,
        modems: Arc<dyn ModemRegistry>,
        notifier: NotificationTrigger,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            messages,
            modems,
            notifier,
            dispatcher,
            clock,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run one full cycle.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] when the store fails as a whole and
    /// [`QueueError::Dispatch`] when the driver cannot be started. Work done
    /// before the failure is kept.
    pub async fn run_cycle(&self) -> Result<CycleReport, QueueError> {
        let mut report = CycleReport::default();

        self.reclaim_stuck(&mut report).await?;
        self.dispatch_ready(&mut report).await?;
        self.requeue_failed(&mut report).await?;
        self.check_health(&mut report).await?;

        let drained = self
            .notifier
            .drain(self.config.notification_batch_size)
            .await;
        report.notifications_delivered = drained.delivered;
        report.notifications_failed = drained.failed;

        if report.is_idle() {
            internal!(level = DEBUG, "Queue cycle finished: {report}");
        } else {
            internal!(level = INFO, "Queue cycle finished: {report}");
        }
        Ok(report)
    }

    async fn reclaim_stuck(&self, report: &mut CycleReport) -> Result<(), QueueError> {
        let now = self.clock.now();
        let stuck = self
            .messages
            .find_stuck(self.config.stuck_threshold(), now)
            .await?;

        for message in stuck {
            if row_local(
                self.messages.reset_to_pending(message.id, now).await,
                "stuck message",
            )?
            .is_some()
            {
                internal!(
                    level = WARN,
                    id = %message.id,
                    modem = ?message.assigned_modem,
                    "Reclaimed message stuck in processing since {:?}",
                    message.processing_started_at
                );
                report.reclaimed += 1;
            }
        }
        Ok(())
    }

    async fn dispatch_ready(&self, report: &mut CycleReport) -> Result<(), QueueError> {
        let ready = self
            .messages
            .fetch_ready(self.config.batch_size, self.clock.now())
            .await?;

        for message in ready {
            let Some(modem) = self.modems.best_available().await? else {
                internal!(level = WARN, "No active modem available, dispatch pass stopped");
                report.no_modem = true;
                break;
            };

            let claimed = row_local(
                self.messages
                    .claim(message.id, modem.id, self.clock.now())
                    .await,
                "claim",
            )?;
            if claimed != Some(ClaimOutcome::Claimed) {
                report.skipped += 1;
                continue;
            }

            internal!(level = DEBUG, id = %message.id, modem = %modem.id, "Dispatching");
            report.attempted += 1;

            let outcome = match self.dispatcher.send(&message, &modem).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    internal!(level = ERROR, id = %message.id, "Aborting cycle: {e}");
                    // Give the message back rather than leave it for stuck
                    // reclamation.
                    if let Err(reset) = self
                        .messages
                        .reset_to_pending(message.id, self.clock.now())
                        .await
                    {
                        internal!(level = ERROR, id = %message.id, "Unable to release message: {reset}");
                    }
                    return Err(e.into());
                }
            };

            match outcome {
                DispatchOutcome::Sent => self.record_sent(&message, &modem, report).await?,
                DispatchOutcome::Failed { detail } => {
                    self.record_failure(&message, &modem, &detail, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn record_sent(
        &self,
        message: &Message,
        modem: &Modem,
        report: &mut CycleReport,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        if row_local(self.messages.mark_sent(message.id, now).await, "mark sent")?.is_none() {
            report.skipped += 1;
            return Ok(());
        }
        row_local(
            self.modems.record_success(modem.id, now).await,
            "modem success",
        )?;

        internal!(level = DEBUG, id = %message.id, modem = %modem.id, "Sent");
        report.sent += 1;
        Ok(())
    }

    async fn record_failure(
        &self,
        message: &Message,
        modem: &Modem,
        detail: &str,
        report: &mut CycleReport,
    ) -> Result<(), QueueError> {
        let Some(retries) = row_local(
            self.messages.increment_retry(message.id).await,
            "retry count",
        )?
        else {
            report.skipped += 1;
            return Ok(());
        };

        let kind = if retries >= self.config.max_retries {
            FailureKind::MaxRetries
        } else {
            FailureKind::RetryLater
        };

        let now = self.clock.now();
        if row_local(
            self.messages
                .mark_failed(message.id, kind, detail, now)
                .await,
            "mark failed",
        )?
        .is_none()
        {
            report.skipped += 1;
            return Ok(());
        }

        internal!(
            level = DEBUG,
            id = %message.id,
            modem = %modem.id,
            retries,
            "Failed ({kind}): {detail}"
        );

        if kind == FailureKind::RetryLater {
            report.failed_retryable += 1;
            return Ok(());
        }
        report.failed_permanent += 1;

        if let Some(modem) = row_local(
            self.modems.record_error(modem.id, detail, now).await,
            "modem error",
        )? && modem.error_count == self.config.modem_offline_threshold
        {
            self.notifier.modem_offline(&modem).await;
        }

        let failed = Message {
            status: MessageStatus::Failed(kind),
            retry_count: retries,
            error_detail: Some(detail.to_string()),
            failed_at: Some(now),
            ..message.clone()
        };
        self.notifier.permanent_failure(&failed, detail).await;
        Ok(())
    }

    async fn requeue_failed(&self, report: &mut CycleReport) -> Result<(), QueueError> {
        let now = self.clock.now();
        let eligible = self
            .messages
            .find_retry_eligible(
                self.config.max_retries,
                self.config.retry_delay(),
                self.config.retry_batch_size,
                now,
            )
            .await?;

        for message in eligible {
            if row_local(
                self.messages.reset_to_pending(message.id, now).await,
                "requeue",
            )?
            .is_some()
            {
                internal!(
                    level = DEBUG,
                    id = %message.id,
                    retries = message.retry_count,
                    "Requeued for retry"
                );
                report.requeued += 1;
            }
        }
        Ok(())
    }

    async fn check_health(&self, report: &mut CycleReport) -> Result<(), QueueError> {
        let pending = self.messages.counts().await?.pending;
        if pending > self.config.queue_blocked_threshold {
            internal!(level = WARN, pending, "Queue looks blocked");
            report.queue_blocked = true;
            self.notifier.queue_blocked(pending).await;
        }
        Ok(())
    }

    /// Delete processed notifications older than `retention`.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] if the store fails.
    pub async fn purge_notifications(&self, retention: Duration) -> Result<usize, QueueError> {
        let purged = self
            .notifier
            .store()
            .purge_processed_before(cutoff(self.clock.now(), retention))
            .await?;
        if purged > 0 {
            internal!(level = INFO, purged, "Purged old notifications");
        }
        Ok(purged)
    }
}
