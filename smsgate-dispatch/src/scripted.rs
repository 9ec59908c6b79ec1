use std::{collections::VecDeque, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use smsgate_store::{Message, MessageId, Modem, ModemId};

use crate::{DispatchError, DispatchOutcome, Dispatcher, IncomingSms, ReceiveOutcome, SmsReceiver};

/// What a [`ScriptedDispatcher`] does on its next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    Send,
    Fail(String),
    /// Behave like a driver binary that does not exist.
    SpawnError,
    /// Sleep, then perform the inner step.
    Delay(Duration, Box<Self>),
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCall {
    pub message: MessageId,
    pub recipient: String,
    pub modem: ModemId,
    pub device_path: String,
}

/// Replays scripted outcomes in order, then falls back to sending.
///
/// Clones share the script and the call log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDispatcher {
    script: Arc<Mutex<VecDeque<ScriptedStep>>>,
    calls: Arc<Mutex<Vec<DispatchCall>>>,
}

impl ScriptedDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(self, step: ScriptedStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    #[must_use]
    pub fn then_send(self) -> Self {
        self.then(ScriptedStep::Send)
    }

    #[must_use]
    pub fn then_fail(self, detail: impl Into<String>) -> Self {
        self.then(ScriptedStep::Fail(detail.into()))
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    async fn perform(step: ScriptedStep) -> Result<DispatchOutcome, DispatchError> {
        let mut step = step;
        loop {
            match step {
                ScriptedStep::Send => return Ok(DispatchOutcome::Sent),
                ScriptedStep::Fail(detail) => return Ok(DispatchOutcome::Failed { detail }),
                ScriptedStep::SpawnError => {
                    return Err(DispatchError::Spawn {
                        program: "scripted".to_string(),
                        source: io::Error::new(io::ErrorKind::NotFound, "no such driver"),
                    });
                }
                ScriptedStep::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn send(&self, message: &Message, modem: &Modem) -> Result<DispatchOutcome, DispatchError> {
        self.calls.lock().push(DispatchCall {
            message: message.id,
            recipient: message.recipient.clone(),
            modem: modem.id,
            device_path: modem.device_path.clone(),
        });
        let step = self.script.lock().pop_front().unwrap_or(ScriptedStep::Send);
        Self::perform(step).await
    }
}

/// Replays scripted receive results in order, then reports an empty inbox.
///
/// Clones share the script and the log of polled devices.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReceiver {
    script: Arc<Mutex<VecDeque<Result<ReceiveOutcome, String>>>>,
    polled: Arc<Mutex<Vec<String>>>,
}

impl ScriptedReceiver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then_receive(self, messages: Vec<IncomingSms>) -> Self {
        self.script.lock().push_back(Ok(ReceiveOutcome::Received(messages)));
        self
    }

    #[must_use]
    pub fn then_fail(self, detail: impl Into<String>) -> Self {
        self.script.lock().push_back(Ok(ReceiveOutcome::Failed {
            detail: detail.into(),
        }));
        self
    }

    /// Behave like a receiver binary that does not exist.
    #[must_use]
    pub fn then_spawn_error(self) -> Self {
        self.script.lock().push_back(Err("no such receiver".to_string()));
        self
    }

    /// Device paths polled so far, in order.
    pub fn polled(&self) -> Vec<String> {
        self.polled.lock().clone()
    }
}

#[async_trait]
impl SmsReceiver for ScriptedReceiver {
    async fn receive(&self, modem: &Modem) -> Result<ReceiveOutcome, DispatchError> {
        self.polled.lock().push(modem.device_path.clone());
        let step = self.script.lock().pop_front();
        match step {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(DispatchError::Spawn {
                program: "scripted".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, reason),
            }),
            None => Ok(ReceiveOutcome::Received(Vec::new())),
        }
    }
}
