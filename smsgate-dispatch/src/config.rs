use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{Dispatcher, DryRunDispatcher, SmsReceiver, SubprocessDispatcher, SubprocessReceiver};

/// How messages leave the gateway.
///
/// ```ron
/// dispatcher: Subprocess((
///     program: "/usr/bin/python3",
///     args: ["/opt/smsgate/tools/send_sms_mmcli.py"],
///     timeout_secs: 30,
/// )),
/// ```
///
/// or `dispatcher: DryRun` to log instead of sending.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum DispatcherConfig {
    Subprocess(SubprocessConfig),
    DryRun,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::Subprocess(SubprocessConfig::default())
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn into_dispatcher(self) -> Arc<dyn Dispatcher> {
        match self {
            Self::Subprocess(config) => Arc::new(SubprocessDispatcher::new(config)),
            Self::DryRun => Arc::new(DryRunDispatcher),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubprocessConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Passed before the per-message arguments.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Append `--json-output` so the driver prints a machine readable result.
    #[serde(default = "default_true")]
    pub json_output: bool,

    /// Only count a zero exit as sent when the driver also printed
    /// `{"success": true}`. Turn off for drivers that print nothing.
    #[serde(default = "default_true")]
    pub require_json_result: bool,
}

fn default_program() -> PathBuf {
    PathBuf::from("/usr/local/bin/send_sms_mmcli.py")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            json_output: true,
            require_json_result: true,
        }
    }
}

/// How incoming SMS are read off the modems.
///
/// ```ron
/// receiver: Subprocess((
///     program: "/usr/local/bin/receive_sms_mmcli.py",
///     timeout_secs: 60,
/// )),
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum ReceiverConfig {
    #[default]
    Disabled,
    Subprocess(SubprocessReceiverConfig),
}

impl ReceiverConfig {
    /// `None` when receiving is disabled.
    #[must_use]
    pub fn into_receiver(self) -> Option<Arc<dyn SmsReceiver>> {
        match self {
            Self::Disabled => None,
            Self::Subprocess(config) => Some(Arc::new(SubprocessReceiver::new(config))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubprocessReceiverConfig {
    #[serde(default = "default_receiver_program")]
    pub program: PathBuf,

    /// Passed before the per-modem arguments.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_receiver_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_receiver_program() -> PathBuf {
    PathBuf::from("/usr/local/bin/receive_sms_mmcli.py")
}

const fn default_receiver_timeout_secs() -> u64 {
    60
}

impl Default for SubprocessReceiverConfig {
    fn default() -> Self {
        Self {
            program: default_receiver_program(),
            args: Vec::new(),
            timeout_secs: default_receiver_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn subprocess_fields_default() {
        let config: DispatcherConfig =
            ron::from_str(r#"Subprocess((program: "/opt/driver"))"#).expect("config");
        assert_eq!(
            config,
            DispatcherConfig::Subprocess(SubprocessConfig {
                program: PathBuf::from("/opt/driver"),
                ..SubprocessConfig::default()
            })
        );
    }

    #[test]
    fn receiving_is_off_unless_configured() {
        assert!(ReceiverConfig::default().into_receiver().is_none());

        let config: ReceiverConfig =
            ron::from_str(r#"Subprocess((args: ["--verbose"]))"#).expect("config");
        assert_eq!(
            config,
            ReceiverConfig::Subprocess(SubprocessReceiverConfig {
                args: vec!["--verbose".into()],
                ..SubprocessReceiverConfig::default()
            })
        );
        assert!(config.into_receiver().is_some());
    }

    #[test]
    fn dry_run_parses() {
        let config: DispatcherConfig = ron::from_str("DryRun").expect("config");
        assert_eq!(config, DispatcherConfig::DryRun);
    }
}
