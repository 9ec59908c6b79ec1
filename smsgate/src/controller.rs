use std::sync::{Arc, LazyLock};

use smsgate_common::{Clock, Signal, internal};
use smsgate_control::ControlServer;
use smsgate_queue::{InboxPoller, NotificationTrigger, QueueEngine, SubmissionService};
use tokio::sync::broadcast;

use crate::{
    ControlConfig, Gateway, GatewayControlHandler, RunOutcome, RunnerControl, WorkerRunner,
};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Turn SIGINT or SIGTERM into a [`Signal::Shutdown`] broadcast.
async fn forward_signals() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// A fully wired worker: stores opened, engine built, control handler ready.
pub struct Worker {
    pub runner: WorkerRunner,
    pub handler: Arc<GatewayControlHandler>,
    control: ControlConfig,
}

impl Worker {
    /// Open the stores and build every component from `gateway`.
    ///
    /// # Errors
    /// Returns an error if the store cannot be opened or a component
    /// rejects its configuration.
    pub async fn assemble(gateway: Gateway, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        gateway.validate()?;

        let stores = gateway.store.open().await?;
        let notifier = NotificationTrigger::from_config(
            stores.notifications.clone(),
            clock.clone(),
            &gateway.notifications,
        )?;
        let engine = QueueEngine::new(
            stores.messages.clone(),
            stores.modems.clone(),
            notifier,
            gateway.dispatcher.into_dispatcher(),
            clock.clone(),
            gateway.queue,
        )?;
        let submissions =
            SubmissionService::new(stores.messages.clone(), clock.clone(), gateway.submission);

        let control = Arc::new(RunnerControl::default());
        let mut runner = WorkerRunner::new(engine, clock.clone(), gateway.runner, control.clone());
        if let Some(receiver) = gateway.receiver.into_receiver() {
            let poller = InboxPoller::new(
                stores.inbox.clone(),
                stores.modems.clone(),
                receiver,
                clock.clone(),
            );
            runner = runner.with_inbox(poller, gateway.inbox);
        }
        let handler = Arc::new(GatewayControlHandler::new(stores, submissions, control, clock));

        Ok(Self {
            runner,
            handler,
            control: gateway.control,
        })
    }

    /// Cron shape.
    ///
    /// # Errors
    /// Returns an error if the cycle aborts.
    pub async fn run_once(mut self) -> anyhow::Result<RunOutcome> {
        let shutdown = SHUTDOWN_BROADCAST.subscribe();
        let signals = tokio::spawn(forward_signals());

        let outcome = self.runner.run_once(shutdown).await;
        signals.abort();

        Ok(outcome?)
    }

    /// Daemon shape: the runner plus, when enabled, the control socket.
    ///
    /// A control socket that cannot be bound is logged; the queue keeps
    /// running without it.
    ///
    /// # Errors
    /// Returns an error if a cycle aborts.
    pub async fn serve(mut self) -> anyhow::Result<RunOutcome> {
        let runner_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let signals = tokio::spawn(forward_signals());

        let control = self.control.enabled.then(|| {
            let server = ControlServer::new(&self.control.socket_path, self.handler.clone());
            let shutdown = SHUTDOWN_BROADCAST.subscribe();
            tokio::spawn(async move { server.serve(shutdown).await })
        });

        let outcome = self.runner.serve(runner_shutdown).await;

        // The runner may have stopped on its own; make sure everything else does too.
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
        signals.abort();

        if let Some(control) = control {
            match control.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => internal!(level = ERROR, error = %e, "Control server failed"),
                Err(e) => internal!(level = ERROR, error = %e, "Control server task failed"),
            }
        }

        internal!(level = INFO, ?outcome, "Worker stopped");
        Ok(outcome?)
    }
}
