use std::path::{Path, PathBuf};

use serde::Deserialize;
use smsgate_control::DEFAULT_CONTROL_SOCKET;
use smsgate_dispatch::{DispatcherConfig, ReceiverConfig};
use smsgate_queue::{InboxConfig, NotificationConfig, QueueConfig, SubmissionConfig};
use smsgate_store::StoreConfig;

use crate::RunnerConfig;

const CONFIG_ENV: &str = "SMSGATE_CONFIG";

/// Everything a worker process needs, read from one RON file.
///
/// ```ron
/// Gateway (
///     store: Sqlite(path: "/var/lib/smsgate/queue.db"),
///     dispatcher: Subprocess((program: "/usr/local/bin/send_sms_mmcli.py")),
///     queue: (batch_size: 20, max_retries: 3),
///     receiver: Subprocess((program: "/usr/local/bin/receive_sms_mmcli.py")),
///     inbox: (retention_days: 30),
///     notifications: (webhook: Some((url: "https://ops.example.com/hook"))),
/// )
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Gateway {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Reading incoming SMS is off unless a receiver is configured
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlConfig {
    /// Only the daemon shape listens; a cron run never opens the socket.
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

const fn default_control_enabled() -> bool {
    true
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_control_enabled(),
            socket_path: default_socket_path(),
        }
    }
}

impl Gateway {
    /// # Errors
    /// Returns an error if the text is not valid RON for this structure or a
    /// value is out of range.
    pub fn from_ron(text: &str) -> anyhow::Result<Self> {
        let gateway: Self = ron::from_str(text)?;
        gateway.validate()?;
        Ok(gateway)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;
        Self::from_ron(&text)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
    }

    /// # Errors
    /// Returns an error describing the first out-of-range value.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.queue.validate()?;
        if self.runner.cycle_interval_secs == 0 {
            anyhow::bail!("runner.cycle_interval_secs must be at least 1");
        }
        if self.runner.lock_grace_secs == 0 {
            anyhow::bail!("runner.lock_grace_secs must be at least 1");
        }
        Ok(())
    }
}

/// Find the configuration file using the following precedence:
/// 1. an explicit path (from `--config`)
/// 2. `SMSGATE_CONFIG` environment variable
/// 3. ./smsgate.config.ron
/// 4. /etc/smsgate/smsgate.config.ron
///
/// # Errors
/// Returns an error if an explicitly named file does not exist or none of
/// the default locations has one.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./smsgate.config.ron"),
        PathBuf::from("/etc/smsgate/smsgate.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn empty_gateway_uses_defaults() {
        let gateway = Gateway::from_ron("()").expect("config");
        assert_eq!(gateway, Gateway::default());
        assert_eq!(gateway.control.socket_path, PathBuf::from("/tmp/smsgate.sock"));
        assert_eq!(gateway.runner.lock_grace_secs, 600);
        assert_eq!(gateway.receiver, ReceiverConfig::Disabled);
        assert_eq!(gateway.inbox.retention_days, 30);
    }

    #[test]
    fn full_gateway_parses() {
        let gateway = Gateway::from_ron(
            r#"Gateway(
                store: Memory,
                dispatcher: DryRun,
                receiver: Subprocess((timeout_secs: 20)),
                inbox: (retention_days: 90),
                queue: (batch_size: 25, max_retries: 5),
                submission: (default_country_code: None),
                runner: (lock_path: "/run/smsgate.lock", cycle_interval_secs: 5),
                control: (enabled: false),
            )"#,
        )
        .expect("config");

        assert_eq!(gateway.store, StoreConfig::Memory);
        assert_eq!(gateway.dispatcher, DispatcherConfig::DryRun);
        let ReceiverConfig::Subprocess(receiver) = &gateway.receiver else {
            panic!("expected a subprocess receiver");
        };
        assert_eq!(receiver.timeout_secs, 20);
        assert_eq!(gateway.inbox.retention_days, 90);
        assert_eq!(gateway.queue.batch_size, 25);
        assert_eq!(gateway.queue.max_retries, 5);
        assert_eq!(gateway.submission.default_country_code, None);
        assert_eq!(gateway.runner.lock_path, PathBuf::from("/run/smsgate.lock"));
        assert_eq!(gateway.runner.cycle_interval_secs, 5);
        assert!(!gateway.control.enabled);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(Gateway::from_ron("(queue: (batch_size: 0))").is_err());
        assert!(Gateway::from_ron("(runner: (cycle_interval_secs: 0))").is_err());
        assert!(Gateway::from_ron("(runner: (lock_grace_secs: 0))").is_err());
    }

    #[test]
    fn explicit_path_wins_and_must_exist() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("gateway.ron");
        std::fs::write(&path, "()").expect("write config");

        assert_eq!(find_config_file(Some(&path)).expect("found"), path);
        assert!(find_config_file(Some(&dir.path().join("missing.ron"))).is_err());

        let gateway = Gateway::load(&path).expect("load");
        assert_eq!(gateway, Gateway::default());
    }
}
