//! Read incoming SMS off a modem.
//!
//! ```text
//! <program> [args..] --device=<path> --check-once --json-output
//! ```
//!
//! The receiver prints one JSON object on stdout:
//!
//! ```json
//! {"success": true, "messages": [{"sender": "+33612345678", "message": "STOP", "received_at": "2024-01-01T10:00:00Z"}]}
//! ```
//!
//! `received_at` may be left out, in which case the gateway stamps the time
//! it read the message.

use std::{
    fmt::{self, Debug, Display, Formatter},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use smsgate_common::device;
use smsgate_store::Modem;
use tokio::process::Command;

use crate::{
    DispatchError, DriverOutput, SubprocessReceiverConfig,
    subprocess::{DriverResult, truncate},
};

/// One SMS as reported by the receiver program.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IncomingSms {
    pub sender: String,
    #[serde(alias = "text")]
    pub message: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl IncomingSms {
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
            received_at: None,
        }
    }
}

/// Normalized result of one receive pass over a modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Received(Vec<IncomingSms>),
    Failed { detail: String },
}

impl Display for ReceiveOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received(messages) => write!(f, "{} received", messages.len()),
            Self::Failed { detail } => write!(f, "failed: {detail}"),
        }
    }
}

/// Collects the SMS waiting on one modem.
#[async_trait]
pub trait SmsReceiver: Send + Sync + Debug {
    /// # Errors
    /// Returns [`DispatchError`] only when the receiver could not be run.
    async fn receive(&self, modem: &Modem) -> Result<ReceiveOutcome, DispatchError>;
}

#[derive(Debug, Deserialize)]
struct ReceiverResult {
    #[serde(flatten)]
    status: DriverResult,
    #[serde(default)]
    messages: Vec<IncomingSms>,
}

impl DriverOutput {
    /// Reduce a receiver run to the messages it read, or why it failed.
    #[must_use]
    pub fn received(&self) -> ReceiveOutcome {
        if self.exit_code != Some(0) {
            return ReceiveOutcome::Failed {
                detail: self.failure_detail(),
            };
        }
        match self.json::<ReceiverResult>() {
            Some(result) if result.status.success => ReceiveOutcome::Received(result.messages),
            Some(result) => ReceiveOutcome::Failed {
                detail: truncate(
                    &result
                        .status
                        .error_detail()
                        .unwrap_or_else(|| "receiver reported failure".to_string()),
                ),
            },
            None => ReceiveOutcome::Failed {
                detail: self.malformed(),
            },
        }
    }
}

/// Runs the receiver program once per modem.
#[derive(Debug, Clone)]
pub struct SubprocessReceiver {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessReceiver {
    #[must_use]
    pub fn new(config: SubprocessReceiverConfig) -> Self {
        Self {
            program: config.program,
            args: config.args,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl SmsReceiver for SubprocessReceiver {
    async fn receive(&self, modem: &Modem) -> Result<ReceiveOutcome, DispatchError> {
        let program = self.program.display().to_string();
        device!(level = DEBUG, device = %modem.device_path, "Checking inbox with {program}");

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(format!("--device={}", modem.device_path))
            .arg("--check-once")
            .arg("--json-output")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DispatchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let Ok(waited) = tokio::time::timeout(self.timeout, child.wait_with_output()).await else {
            device!(level = WARN, device = %modem.device_path, "Receiver timed out after {:?}", self.timeout);
            return Ok(ReceiveOutcome::Failed {
                detail: format!("receiver timed out after {}s", self.timeout.as_secs()),
            });
        };
        let output = waited.map_err(|source| DispatchError::Wait { program, source })?;

        let outcome = DriverOutput::from(output).received();
        device!(level = DEBUG, device = %modem.device_path, "Receiver reported {outcome}");
        Ok(outcome)
    }
}
