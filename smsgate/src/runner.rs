//! Drives the queue engine under the single-instance lock, either once per
//! invocation (cron) or on an interval until told to stop (daemon).

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use smsgate_common::{Clock, Signal, internal};
use smsgate_queue::{CycleReport, InboxConfig, InboxPoller, QueueEngine, QueueError};
use thiserror::Error;
use tokio::{
    sync::{Notify, broadcast},
    time::MissedTickBehavior,
};

use crate::{LockError, LockFile};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Age after which a lock file is considered abandoned. The owner
    /// refreshes it three times per period.
    #[serde(default = "default_lock_grace_secs")]
    pub lock_grace_secs: u64,

    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// How long an in-flight cycle may run on after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Interval between purges of old notifications
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/lib/smsgate/worker.lock")
}

const fn default_lock_grace_secs() -> u64 {
    600
}

const fn default_cycle_interval_secs() -> u64 {
    30
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

const fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            lock_grace_secs: default_lock_grace_secs(),
            cycle_interval_secs: default_cycle_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub const fn lock_grace(&self) -> Duration {
        Duration::from_secs(self.lock_grace_secs)
    }

    #[must_use]
    pub fn lock_refresh_interval(&self) -> Duration {
        (self.lock_grace() / 3).max(Duration::from_millis(100))
    }

    #[must_use]
    pub const fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Queue cycle aborted: {0}")]
    Cycle(#[from] QueueError),

    #[error("Queue cycle task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another worker holds the lock; nothing was done.
    LockHeld,
    /// A single cycle ran to completion.
    Completed(CycleReport),
    /// The worker stopped on a shutdown signal.
    Stopped {
        cycles: u64,
        /// The in-flight cycle outlived the grace period and was dropped.
        abandoned: bool,
    },
}

/// Knobs shared between the runner and the control socket.
#[derive(Debug, Default)]
pub struct RunnerControl {
    frozen: AtomicBool,
    running: AtomicBool,
    wake: Notify,
}

impl RunnerControl {
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        internal!(level = INFO, "Worker frozen");
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::SeqCst);
        internal!(level = INFO, "Worker unfrozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Ask for a cycle now instead of at the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn state(&self) -> RunnerState {
        if self.running.load(Ordering::SeqCst) {
            RunnerState::Running
        } else {
            RunnerState::Idle
        }
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

/// How a supervised cycle ended.
struct CycleEnd {
    /// `None` when the cycle was abandoned.
    report: Option<CycleReport>,
    shutdown: bool,
}

fn flatten(
    joined: Result<Result<CycleReport, QueueError>, tokio::task::JoinError>,
) -> Result<CycleReport, RunnerError> {
    Ok(joined??)
}

#[derive(Debug)]
pub struct WorkerRunner {
    engine: QueueEngine,
    inbox: Option<(InboxPoller, InboxConfig)>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    control: Arc<RunnerControl>,
    last_cleanup: Option<DateTime<Utc>>,
}

impl WorkerRunner {
    #[must_use]
    pub fn new(
        engine: QueueEngine,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
        control: Arc<RunnerControl>,
    ) -> Self {
        Self {
            engine,
            inbox: None,
            clock,
            config,
            control,
            last_cleanup: None,
        }
    }

    /// Also read incoming SMS after every cycle and purge them past
    /// `config`'s retention.
    #[must_use]
    pub fn with_inbox(mut self, poller: InboxPoller, config: InboxConfig) -> Self {
        self.inbox = Some((poller, config));
        self
    }

    #[must_use]
    pub fn control(&self) -> Arc<RunnerControl> {
        Arc::clone(&self.control)
    }

    /// Cron shape: take the lock, run one cycle, release the lock.
    ///
    /// # Errors
    /// Returns an error if the lock cannot be handled or the cycle aborts.
    pub async fn run_once(
        &mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<RunOutcome, RunnerError> {
        let Some(guard) = LockFile::acquire(&self.config.lock_path, self.config.lock_grace())?
        else {
            internal!(level = INFO, "Another worker holds the lock, nothing to do");
            return Ok(RunOutcome::LockHeld);
        };
        let _refresher = guard.keep_fresh(self.config.lock_refresh_interval());

        let end = self.supervised_cycle(&mut shutdown).await?;
        match end.report {
            Some(report) => {
                self.cleanup_if_due().await;
                Ok(RunOutcome::Completed(report))
            }
            None => Ok(RunOutcome::Stopped {
                cycles: 0,
                abandoned: true,
            }),
        }
    }

    /// Daemon shape: hold the lock and run a cycle every `cycle_interval`,
    /// or straight away when woken, until a shutdown signal arrives.
    ///
    /// # Errors
    /// Returns an error if the lock cannot be handled or a cycle aborts.
    pub async fn serve(
        &mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<RunOutcome, RunnerError> {
        let Some(guard) = LockFile::acquire(&self.config.lock_path, self.config.lock_grace())?
        else {
            internal!(level = INFO, "Another worker holds the lock, nothing to do");
            return Ok(RunOutcome::LockHeld);
        };
        let refresher = guard.keep_fresh(self.config.lock_refresh_interval());

        internal!(
            level = INFO,
            interval = ?self.config.cycle_interval(),
            "Worker serving"
        );

        let mut ticker = tokio::time::interval(self.config.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.control.wake.notified() => {
                    internal!(level = DEBUG, "Cycle requested");
                }
                sig = shutdown.recv() => {
                    internal!(level = INFO, signal = ?sig, "Worker stopping");
                    break;
                }
            }

            if refresher.is_lost() {
                return Err(LockError::Lost {
                    path: guard.path().to_path_buf(),
                }
                .into());
            }

            if self.control.is_frozen() {
                internal!(level = DEBUG, "Worker frozen, skipping cycle");
                continue;
            }

            let end = self.supervised_cycle(&mut shutdown).await?;
            if end.report.is_none() {
                return Ok(RunOutcome::Stopped {
                    cycles,
                    abandoned: true,
                });
            }
            cycles += 1;
            if end.shutdown {
                break;
            }
            self.cleanup_if_due().await;
        }

        Ok(RunOutcome::Stopped {
            cycles,
            abandoned: false,
        })
    }

    /// Run one cycle on its own task so a shutdown can cut it short once the
    /// grace period is over. A dropped cycle leaves its message `Processing`
    /// for stuck reclamation to pick up.
    ///
    /// Incoming SMS are read after the queue is drained; a failed receive
    /// pass is logged and does not fail the cycle.
    async fn supervised_cycle(
        &self,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<CycleEnd, RunnerError> {
        let engine = self.engine.clone();
        let poller = self.inbox.as_ref().map(|(poller, _)| poller.clone());
        let mut task = tokio::spawn(async move {
            let report = engine.run_cycle().await?;
            if let Some(poller) = poller {
                match poller.poll().await {
                    Ok(received) => internal!(level = INFO, %received, "Receive pass finished"),
                    Err(e) => internal!(level = WARN, error = %e, "Receive pass failed"),
                }
            }
            Ok::<_, QueueError>(report)
        });

        self.control.set_running(true);
        let end = tokio::select! {
            joined = &mut task => flatten(joined).map(|report| CycleEnd {
                report: Some(report),
                shutdown: false,
            }),
            _ = shutdown.recv() => {
                let grace = self.config.shutdown_grace();
                internal!(level = INFO, ?grace, "Shutdown requested, letting the cycle finish");
                match tokio::time::timeout(grace, &mut task).await {
                    Ok(joined) => flatten(joined).map(|report| CycleEnd {
                        report: Some(report),
                        shutdown: true,
                    }),
                    Err(_) => {
                        task.abort();
                        internal!(level = WARN, "Cycle outlived the shutdown grace period, abandoning it");
                        Ok(CycleEnd {
                            report: None,
                            shutdown: true,
                        })
                    }
                }
            }
        };
        self.control.set_running(false);

        if let Err(e) = &end {
            internal!(level = ERROR, error = %e, "Queue cycle aborted");
        }
        end
    }

    async fn cleanup_if_due(&mut self) {
        let now = self.clock.now();
        let due = self.last_cleanup.is_none_or(|last| {
            (now - last).to_std().unwrap_or_default() >= self.config.cleanup_interval()
        });
        if !due {
            return;
        }

        let retention = self.engine.config().notification_retention();
        let mut clean = match self.engine.purge_notifications(retention).await {
            Ok(_) => true,
            Err(e) => {
                internal!(level = WARN, error = %e, "Notification cleanup failed");
                false
            }
        };

        if let Some((poller, config)) = &self.inbox {
            if let Err(e) = poller.purge(config.retention()).await {
                internal!(level = WARN, error = %e, "Received SMS cleanup failed");
                clean = false;
            }
        }

        if clean {
            self.last_cleanup = Some(now);
        }
    }
}
