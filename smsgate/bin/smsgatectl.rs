//! Command-line utility for administering a running smsgate worker

use std::{path::PathBuf, process::ExitCode};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use smsgate_control::{
    ControlClient, DEFAULT_CONTROL_SOCKET, InboxCommand, ModemCommand, NotificationCommand,
    QueueCommand, RequestCommand, SystemCommand,
};

/// Manage a running smsgate worker over its control socket
#[derive(Parser, Debug)]
#[command(name = "smsgatectl", version, about, long_about = None)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 's', long, default_value = DEFAULT_CONTROL_SOCKET)]
    socket: PathBuf,

    /// Seconds to wait for the worker to answer
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Worker liveness and status
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
    /// Inspect and manage queued messages
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Manage the modem pool
    Modem {
        #[command(subcommand)]
        action: ModemAction,
    },
    /// Inspect and acknowledge notifications
    Notification {
        #[command(subcommand)]
        action: NotificationAction,
    },
    /// Read SMS received by the modems
    Inbox {
        #[command(subcommand)]
        action: InboxAction,
    },
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Check the worker is responding
    Ping,
    /// Version, uptime and queue counts
    Status,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List messages, newest first
    List {
        /// pending, scheduled, processing, sent or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one message in full
    View { id: String },
    /// Requeue a failed message
    Retry { id: String },
    /// Submit a message
    Enqueue {
        recipient: String,
        body: String,
        #[arg(long, default_value_t = 1)]
        priority: i32,
        /// Send no earlier than this RFC 3339 time
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
        #[arg(long)]
        submitter: Option<String>,
    },
    /// Message counts per status
    Stats,
    /// Run a queue cycle now
    ProcessNow,
    /// Stop starting new cycles
    Freeze,
    /// Resume cycles
    Unfreeze,
}

#[derive(Subcommand, Debug)]
enum ModemAction {
    List,
    /// Register a modem
    Add {
        name: String,
        device_path: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Put a modem back into rotation
    Enable { id: i64 },
    /// Take a modem out of rotation
    Disable { id: i64 },
    /// Reset a modem's error history
    ClearError { id: i64 },
}

#[derive(Subcommand, Debug)]
enum NotificationAction {
    /// Unprocessed notifications, most urgent first
    Pending {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark a notification as handled
    Ack { id: String },
    /// Mark a notification as failed
    Fail { id: String, reason: String },
}

#[derive(Subcommand, Debug)]
enum InboxAction {
    /// Received SMS, newest first
    List {
        /// Only SMS whose sender or text contains this
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 time: {e}"))
}

fn request(command: Commands) -> RequestCommand {
    match command {
        Commands::System { action } => RequestCommand::System(match action {
            SystemAction::Ping => SystemCommand::Ping,
            SystemAction::Status => SystemCommand::Status,
        }),
        Commands::Queue { action } => RequestCommand::Queue(match action {
            QueueAction::List { status, limit } => QueueCommand::List { status, limit },
            QueueAction::View { id } => QueueCommand::View { id },
            QueueAction::Retry { id } => QueueCommand::Retry { id },
            QueueAction::Enqueue {
                recipient,
                body,
                priority,
                at,
                submitter,
            } => QueueCommand::Enqueue {
                recipient,
                body,
                priority,
                scheduled_at: at.map(|at| at.timestamp_millis()),
                submitter,
            },
            QueueAction::Stats => QueueCommand::Stats,
            QueueAction::ProcessNow => QueueCommand::ProcessNow,
            QueueAction::Freeze => QueueCommand::Freeze,
            QueueAction::Unfreeze => QueueCommand::Unfreeze,
        }),
        Commands::Modem { action } => RequestCommand::Modem(match action {
            ModemAction::List => ModemCommand::List,
            ModemAction::Add {
                name,
                device_path,
                priority,
            } => ModemCommand::Add {
                name,
                device_path,
                priority,
            },
            ModemAction::Enable { id } => ModemCommand::SetActive { id, active: true },
            ModemAction::Disable { id } => ModemCommand::SetActive { id, active: false },
            ModemAction::ClearError { id } => ModemCommand::ClearError { id },
        }),
        Commands::Notification { action } => RequestCommand::Notification(match action {
            NotificationAction::Pending { limit } => NotificationCommand::Pending { limit },
            NotificationAction::Ack { id } => NotificationCommand::MarkProcessed { id },
            NotificationAction::Fail { id, reason } => {
                NotificationCommand::MarkFailed { id, reason }
            }
        }),
        Commands::Inbox { action } => RequestCommand::Inbox(match action {
            InboxAction::List { search, limit } => InboxCommand::Received { search, limit },
        }),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = ControlClient::new(cli.socket)
        .with_timeout(std::time::Duration::from_secs(cli.timeout));
    client.check_socket_exists().map_err(|e| {
        anyhow::anyhow!("{e}\nIs the worker running in serve mode with the control socket enabled?")
    })?;

    let response = client.send(request(cli.command)).await?;
    print!("{response}");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("smsgatectl: {e:#}");
            ExitCode::FAILURE
        }
    }
}
