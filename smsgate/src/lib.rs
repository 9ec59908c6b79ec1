pub mod config;
pub mod control_handler;
pub mod controller;
pub mod lock;
pub mod runner;

pub use config::{ControlConfig, Gateway, find_config_file};
pub use control_handler::GatewayControlHandler;
pub use controller::{SHUTDOWN_BROADCAST, Worker};
pub use lock::{LockError, LockFile, LockGuard, LockRefresher};
pub use runner::{RunOutcome, RunnerConfig, RunnerControl, RunnerError, RunnerState, WorkerRunner};
