use async_trait::async_trait;
use smsgate_common::device;
use smsgate_store::{Message, Modem};

use crate::{DispatchError, DispatchOutcome, Dispatcher};

/// Pretends every message went out. Nothing is sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunDispatcher;

#[async_trait]
impl Dispatcher for DryRunDispatcher {
    async fn send(&self, message: &Message, modem: &Modem) -> Result<DispatchOutcome, DispatchError> {
        device!(
            level = INFO,
            id = %message.id,
            recipient = %message.recipient,
            device = %modem.device_path,
            "[dry run] would send {} chars",
            message.body.chars().count()
        );
        Ok(DispatchOutcome::Sent)
    }
}
