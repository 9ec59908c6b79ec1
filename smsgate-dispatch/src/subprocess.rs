//! One driver process per message.
//!
//! ```text
//! <program> [args..] --device=<path> --recipient=<number> --message=<body> [--json-output]
//! ```
//!
//! The driver is spawned without a shell, so recipient and body reach it
//! verbatim. Values are attached to their flag with `=` so a body that
//! starts with `-` cannot be mistaken for an option. It is expected to print `{"success": true}` or
//! `{"success": false, "error": "..."}` on stdout and to exit non-zero on
//! failure.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use smsgate_common::device;
use smsgate_store::{Message, Modem};
use tokio::process::Command;

use crate::{DispatchError, DispatchOutcome, Dispatcher, SubprocessConfig};

/// Longest failure detail kept from driver output.
const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct SubprocessDispatcher {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    json_output: bool,
    require_json_result: bool,
}

impl SubprocessDispatcher {
    #[must_use]
    pub fn new(config: SubprocessConfig) -> Self {
        Self {
            program: config.program,
            args: config.args,
            timeout: Duration::from_secs(config.timeout_secs),
            json_output: config.json_output,
            require_json_result: config.require_json_result,
        }
    }

    fn command(&self, message: &Message, modem: &Modem) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(format!("--device={}", modem.device_path))
            .arg(format!("--recipient={}", message.recipient))
            .arg(format!("--message={}", message.body));
        if self.json_output {
            command.arg("--json-output");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Dispatcher for SubprocessDispatcher {
    async fn send(&self, message: &Message, modem: &Modem) -> Result<DispatchOutcome, DispatchError> {
        let program = self.program.display().to_string();
        device!(
            level = DEBUG,
            id = %message.id,
            device = %modem.device_path,
            "Invoking {program}"
        );

        let child = self
            .command(message, modem)
            .spawn()
            .map_err(|source| DispatchError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, and kill_on_drop
        // takes care of the process.
        let Ok(waited) = tokio::time::timeout(self.timeout, child.wait_with_output()).await else {
            device!(level = WARN, id = %message.id, "Driver timed out after {:?}", self.timeout);
            return Ok(DispatchOutcome::failed(format!(
                "driver timed out after {}s",
                self.timeout.as_secs()
            )));
        };
        let output = waited.map_err(|source| DispatchError::Wait { program, source })?;

        let outcome = DriverOutput::from(output).normalize(self.require_json_result);
        device!(level = DEBUG, id = %message.id, "Driver reported {outcome}");
        Ok(outcome)
    }
}

/// What a finished driver or receiver process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for DriverOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DriverResult {
    pub(crate) success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

impl DriverResult {
    pub(crate) fn error_detail(&self) -> Option<String> {
        let error = self.error.as_deref()?.trim();
        if error.is_empty() {
            return None;
        }
        Some(match self.error_type.as_deref() {
            Some(kind) if !kind.is_empty() => format!("{kind}: {error}"),
            _ => error.to_string(),
        })
    }
}

impl DriverOutput {
    /// Reduce the process result to sent or failed.
    ///
    /// With `require_json_result`, a zero exit only counts as sent when the
    /// driver also printed `{"success": true}`.
    #[must_use]
    pub fn normalize(&self, require_json_result: bool) -> DispatchOutcome {
        if self.exit_code != Some(0) {
            return DispatchOutcome::failed(self.failure_detail());
        }

        match self.json::<DriverResult>() {
            Some(result) if result.success => DispatchOutcome::Sent,
            Some(result) => DispatchOutcome::failed(truncate(
                &result
                    .error_detail()
                    .unwrap_or_else(|| "driver reported failure".to_string()),
            )),
            None if require_json_result => DispatchOutcome::failed(self.malformed()),
            None => DispatchOutcome::Sent,
        }
    }

    /// Why a process that exited non-zero failed: its JSON error, else
    /// stderr, else stdout, else the exit status.
    pub(crate) fn failure_detail(&self) -> String {
        let detail = self
            .json::<DriverResult>()
            .and_then(|result| result.error_detail())
            .or_else(|| first_non_empty(&[self.stderr.as_str(), self.stdout.as_str()]).map(str::to_string))
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("driver exited with status {code}"),
                None => "driver terminated by signal".to_string(),
            });
        truncate(&detail)
    }

    pub(crate) fn malformed(&self) -> String {
        truncate(&format!(
            "malformed driver response: {}",
            first_non_empty(&[self.stdout.as_str()]).unwrap_or("<empty>")
        ))
    }

    /// The JSON result, from the whole of stdout or failing that its last
    /// line (drivers sometimes print progress before the result).
    pub(crate) fn json<T: DeserializeOwned>(&self) -> Option<T> {
        let stdout = self.stdout.trim();
        serde_json::from_str(stdout).ok().or_else(|| {
            stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| line.starts_with('{'))
                .and_then(|line| serde_json::from_str(line).ok())
        })
    }
}

fn first_non_empty<'a>(candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .map(str::trim)
        .find(|s| !s.is_empty())
}

pub(crate) fn truncate(detail: &str) -> String {
    match detail.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((end, _)) => format!("{}...", &detail[..end]),
        None => detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> DriverOutput {
        DriverOutput {
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn zero_exit_with_success_json_is_sent() {
        let out = output(0, "{\n  \"success\": true,\n  \"modem_id\": \"0\"\n}\n", "");
        assert_eq!(out.normalize(true), DispatchOutcome::Sent);
    }

    #[test]
    fn zero_exit_with_failure_json_is_failed() {
        let out = output(0, r#"{"success": false, "error": "no signal"}"#, "");
        assert_eq!(out.normalize(true), DispatchOutcome::failed("no signal"));
    }

    #[test]
    fn zero_exit_without_json_depends_on_strictness() {
        let out = output(0, "SMS sent!\n", "");
        assert_eq!(
            out.normalize(true),
            DispatchOutcome::failed("malformed driver response: SMS sent!")
        );
        assert_eq!(out.normalize(false), DispatchOutcome::Sent);
    }

    #[test]
    fn non_zero_exit_prefers_json_error_then_stderr() {
        let json = output(
            1,
            r#"{"success": false, "error": "modem busy", "error_type": "SMS_ERROR"}"#,
            "traceback",
        );
        assert_eq!(
            json.normalize(true),
            DispatchOutcome::failed("SMS_ERROR: modem busy")
        );

        let stderr = output(2, "", "  device not found\n");
        assert_eq!(stderr.normalize(true), DispatchOutcome::failed("device not found"));

        let silent = output(3, "", "");
        assert_eq!(
            silent.normalize(false),
            DispatchOutcome::failed("driver exited with status 3")
        );
    }

    #[test]
    fn json_after_progress_lines_is_found() {
        let out = output(0, "connecting...\n{\"success\": true}\n", "");
        assert_eq!(out.normalize(true), DispatchOutcome::Sent);
    }

    #[test]
    fn killed_driver_is_a_failure() {
        let out = DriverOutput {
            exit_code: None,
            ..DriverOutput::default()
        };
        assert_eq!(
            out.normalize(true),
            DispatchOutcome::failed("driver terminated by signal")
        );
    }

    #[test]
    fn long_details_are_truncated_on_char_boundaries() {
        let long = "é".repeat(MAX_DETAIL_CHARS + 10);
        let DispatchOutcome::Failed { detail } = output(1, "", &long).normalize(true) else {
            panic!("expected a failure");
        };
        assert_eq!(detail.chars().count(), MAX_DETAIL_CHARS + 3);
        assert!(detail.ends_with("..."));
    }
}
