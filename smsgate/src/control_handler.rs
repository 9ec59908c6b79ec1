//! Answers control socket requests against the live worker.

use std::{fmt::Display, str::FromStr, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::DateTime;
use smsgate_common::{Clock, internal};
use smsgate_control::{
    CommandHandler, ControlError, InboxCommand, MessageDetails, MessageSummary, ModemCommand,
    ModemInfo, NotificationCommand, NotificationInfo, QueueCommand, QueueStats, ReceivedInfo,
    Request, RequestCommand, Response, ResponseData, SystemCommand, SystemStatus,
};
use smsgate_queue::{EnqueueRequest, SubmissionService};
use smsgate_store::{MessageId, ModemId, NewModem, NotificationId, StatusLabel, StoreHandles};

use crate::RunnerControl;

/// Upper bound for list requests, whatever the client asks for.
const MAX_LIST_LIMIT: usize = 1_000;

type Result<T> = smsgate_control::Result<T>;

fn server_error(e: impl Display) -> ControlError {
    ControlError::Server(e.to_string())
}

fn parse_id<T>(raw: &str, what: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| ControlError::Server(format!("Invalid {what} id '{raw}': {e}")))
}

fn limit(requested: usize) -> usize {
    requested.clamp(1, MAX_LIST_LIMIT)
}

pub struct GatewayControlHandler {
    stores: StoreHandles,
    submissions: SubmissionService,
    runner: Arc<RunnerControl>,
    clock: Arc<dyn Clock>,
    start_time: Instant,
}

impl GatewayControlHandler {
    #[must_use]
    pub fn new(
        stores: StoreHandles,
        submissions: SubmissionService,
        runner: Arc<RunnerControl>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stores,
            submissions,
            runner,
            clock,
            start_time: Instant::now(),
        }
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let counts = self.stores.messages.counts().await.map_err(server_error)?;
        Ok(counts.into())
    }

    async fn handle_system_command(&self, command: SystemCommand) -> Result<Response> {
        match command {
            SystemCommand::Ping => Ok(Response::ok()),
            SystemCommand::Status => Ok(Response::data(ResponseData::SystemStatus(
                SystemStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    frozen: self.runner.is_frozen(),
                    queue: self.queue_stats().await?,
                },
            ))),
        }
    }

    async fn handle_queue_command(&self, command: QueueCommand) -> Result<Response> {
        match command {
            QueueCommand::List { status, limit: requested } => {
                let status = status
                    .as_deref()
                    .map(StatusLabel::from_str)
                    .transpose()
                    .map_err(ControlError::Server)?;
                let messages = self
                    .stores
                    .messages
                    .list(status, limit(requested))
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::MessageList(
                    messages.iter().map(MessageSummary::from).collect(),
                )))
            }

            QueueCommand::View { id } => {
                let id: MessageId = parse_id(&id, "message")?;
                let message = self.stores.messages.get(id).await.map_err(server_error)?;
                Ok(Response::data(ResponseData::MessageDetails(
                    MessageDetails::from(&message),
                )))
            }

            QueueCommand::Retry { id } => {
                let id: MessageId = parse_id(&id, "message")?;
                self.submissions.retry(id).await.map_err(server_error)?;
                Ok(Response::data(ResponseData::Message(format!(
                    "Message {id} requeued"
                ))))
            }

            QueueCommand::Enqueue {
                recipient,
                body,
                priority,
                scheduled_at,
                submitter,
            } => {
                let scheduled_at = scheduled_at
                    .map(|ms| {
                        DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                            ControlError::Server(format!("Invalid schedule time {ms}"))
                        })
                    })
                    .transpose()?;
                let id = self
                    .submissions
                    .enqueue(EnqueueRequest {
                        recipient,
                        body,
                        priority,
                        scheduled_at,
                        submitter,
                    })
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Enqueued(id.to_string())))
            }

            QueueCommand::Stats => Ok(Response::data(ResponseData::QueueStats(
                self.queue_stats().await?,
            ))),

            QueueCommand::ProcessNow => {
                self.runner.wake();
                Ok(Response::data(ResponseData::Message(
                    "Queue cycle requested".to_string(),
                )))
            }

            QueueCommand::Freeze => {
                self.runner.freeze();
                Ok(Response::ok())
            }

            QueueCommand::Unfreeze => {
                self.runner.unfreeze();
                Ok(Response::ok())
            }
        }
    }

    async fn handle_modem_command(&self, command: ModemCommand) -> Result<Response> {
        let modems = &self.stores.modems;
        match command {
            ModemCommand::List => {
                let list = modems.list().await.map_err(server_error)?;
                Ok(Response::data(ResponseData::ModemList(
                    list.iter().map(ModemInfo::from).collect(),
                )))
            }

            ModemCommand::Add {
                name,
                device_path,
                priority,
            } => {
                let modem = modems
                    .register(NewModem::new(name, device_path, priority), self.clock.now())
                    .await
                    .map_err(server_error)?;
                internal!(level = INFO, id = %modem.id, name = %modem.name, "Modem registered");
                Ok(Response::data(ResponseData::Modem(ModemInfo::from(&modem))))
            }

            ModemCommand::SetActive { id, active } => {
                modems
                    .set_active(ModemId(id), active)
                    .await
                    .map_err(server_error)?;
                Ok(Response::ok())
            }

            ModemCommand::ClearError { id } => {
                modems.clear_error(ModemId(id)).await.map_err(server_error)?;
                Ok(Response::ok())
            }
        }
    }

    async fn handle_notification_command(
        &self,
        command: NotificationCommand,
    ) -> Result<Response> {
        let notifications = &self.stores.notifications;
        match command {
            NotificationCommand::Pending { limit: requested } => {
                let pending = notifications
                    .pending(limit(requested))
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::NotificationList(
                    pending.iter().map(NotificationInfo::from).collect(),
                )))
            }

            NotificationCommand::MarkProcessed { id } => {
                let id: NotificationId = parse_id(&id, "notification")?;
                notifications
                    .mark_processed(id, self.clock.now())
                    .await
                    .map_err(server_error)?;
                Ok(Response::ok())
            }

            NotificationCommand::MarkFailed { id, reason } => {
                let id: NotificationId = parse_id(&id, "notification")?;
                notifications
                    .mark_failed(id, &reason, self.clock.now())
                    .await
                    .map_err(server_error)?;
                Ok(Response::ok())
            }
        }
    }

    async fn handle_inbox_command(&self, command: InboxCommand) -> Result<Response> {
        match command {
            InboxCommand::Received {
                search,
                limit: requested,
            } => {
                let search = search.as_deref().map(str::trim).filter(|s| !s.is_empty());
                let received = self
                    .stores
                    .inbox
                    .list_received(search, limit(requested))
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::ReceivedList(
                    received.iter().map(ReceivedInfo::from).collect(),
                )))
            }
        }
    }
}

#[async_trait]
impl CommandHandler for GatewayControlHandler {
    async fn handle_request(&self, request: Request) -> Result<Response> {
        match request.command {
            RequestCommand::System(command) => self.handle_system_command(command).await,
            RequestCommand::Queue(command) => self.handle_queue_command(command).await,
            RequestCommand::Modem(command) => self.handle_modem_command(command).await,
            RequestCommand::Notification(command) => {
                self.handle_notification_command(command).await
            }
            RequestCommand::Inbox(command) => self.handle_inbox_command(command).await,
        }
    }
}
