pub mod clock;
pub mod logging;

pub use tracing;

pub use clock::{Clock, ManualClock, SystemClock};

/// Lifecycle signal broadcast to every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
