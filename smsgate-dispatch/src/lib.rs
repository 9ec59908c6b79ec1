//! Hand a claimed message to a modem driver and report what happened.
//!
//! The driver is an external program (one invocation per SMS) that prints a
//! JSON result on stdout. [`SubprocessDispatcher`] turns whatever the driver
//! does (exit code, output, hang) into a [`DispatchOutcome`]; only a driver
//! that cannot be started at all surfaces as a [`DispatchError`].
//!
//! The inbound direction works the same way: [`SubprocessReceiver`] runs a
//! receiver program per modem and turns its output into a [`ReceiveOutcome`].

mod config;
mod dispatcher;
mod dry_run;
mod error;
mod receiver;
mod scripted;
mod subprocess;

pub use config::{DispatcherConfig, ReceiverConfig, SubprocessConfig, SubprocessReceiverConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use dry_run::DryRunDispatcher;
pub use error::DispatchError;
pub use receiver::{IncomingSms, ReceiveOutcome, SmsReceiver, SubprocessReceiver};
pub use scripted::{DispatchCall, ScriptedDispatcher, ScriptedReceiver, ScriptedStep};
pub use subprocess::{DriverOutput, SubprocessDispatcher};
