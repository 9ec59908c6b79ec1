//! Control protocol for administering a running smsgate worker
//!
//! A Unix domain socket carries length-prefixed bincode frames so operators
//! can:
//! - inspect and requeue messages
//! - manage the modem pool
//! - acknowledge notifications
//! - freeze the worker or wake it for an immediate cycle

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    InboxCommand, MessageDetails, MessageSummary, ModemCommand, ModemInfo, NotificationCommand,
    NotificationInfo, PROTOCOL_VERSION, QueueCommand, QueueStats, ReceivedInfo, Request,
    RequestCommand, Response, ResponseData, ResponsePayload, SystemCommand, SystemStatus,
};
pub use server::{CommandHandler, ControlServer};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/smsgate.sock";
