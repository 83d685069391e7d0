//! Test doubles for the external collaborators.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::access::checker::MembershipOracle;
use crate::access::gate::ExternalGate;
use crate::access::types::Membership;
use crate::error::{GateError, SinkError};
use crate::media::delivery::{MessageRef, Payload, RetractOutcome, Sink};

/// Sink that records everything and can be told to fail
#[derive(Default)]
pub(crate) struct RecordingSink {
    emitted: Mutex<Vec<(String, Payload, MessageRef)>>,
    retracted: Mutex<Vec<(String, MessageRef)>>,
    emit_calls: AtomicUsize,
    fail_emit_at: Option<usize>,
    fail_emit_to: Option<String>,
    fail_retract: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the n-th emit call (0-based)
    pub fn fail_emit_at(mut self, index: usize) -> Self {
        self.fail_emit_at = Some(index);
        self
    }

    /// Fail every emit to one destination
    pub fn fail_emit_to(mut self, destination: &str) -> Self {
        self.fail_emit_to = Some(destination.to_string());
        self
    }

    pub fn fail_retract(mut self) -> Self {
        self.fail_retract = true;
        self
    }

    pub fn retracted(&self) -> Vec<(String, MessageRef)> {
        self.retracted.lock().unwrap().clone()
    }

    /// Text payloads sent to `destination`
    pub fn texts(&self, destination: &str) -> Vec<String> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _, _)| d == destination)
            .filter_map(|(_, p, _)| match p {
                Payload::Text(text) => Some(text.clone()),
                Payload::Media { .. } => None,
            })
            .collect()
    }

    /// Media payloads sent to `destination`
    pub fn media(&self, destination: &str) -> Vec<String> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _, _)| d == destination)
            .filter_map(|(_, p, _)| match p {
                Payload::Media { file_ref, .. } => Some(file_ref.clone()),
                Payload::Text(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn emit(&self, destination: &str, payload: Payload) -> Result<MessageRef, SinkError> {
        let call = self.emit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_emit_at == Some(call) {
            return Err(SinkError::Transport("injected failure".into()));
        }
        if self.fail_emit_to.as_deref() == Some(destination) {
            return Err(SinkError::Rejected("blocked by user".into()));
        }
        let message = MessageRef(format!("m{}", call));
        self.emitted
            .lock()
            .unwrap()
            .push((destination.to_string(), payload, message.clone()));
        Ok(message)
    }

    async fn retract(
        &self,
        destination: &str,
        message: &MessageRef,
    ) -> Result<RetractOutcome, SinkError> {
        if self.fail_retract {
            return Err(SinkError::Transport("injected failure".into()));
        }
        self.retracted
            .lock()
            .unwrap()
            .push((destination.to_string(), message.clone()));
        Ok(RetractOutcome::Retracted)
    }
}

enum GateBehavior {
    Redirect(String),
    Fail,
    Hang,
}

/// External gate double; records every long URL it was given
pub(crate) struct FakeGate {
    behavior: GateBehavior,
    requests: Mutex<Vec<String>>,
}

impl FakeGate {
    pub fn redirecting(short_url: &str) -> Self {
        Self::with(GateBehavior::Redirect(short_url.to_string()))
    }

    pub fn failing() -> Self {
        Self::with(GateBehavior::Fail)
    }

    /// Never answers; exercises the caller's timeout
    pub fn hanging() -> Self {
        Self::with(GateBehavior::Hang)
    }

    fn with(behavior: GateBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalGate for FakeGate {
    async fn request_redirect(&self, long_url: &str) -> Result<String, GateError> {
        self.requests.lock().unwrap().push(long_url.to_string());
        match &self.behavior {
            GateBehavior::Redirect(url) => Ok(url.clone()),
            GateBehavior::Fail => Err(GateError::GateFailed("injected failure".into())),
            GateBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Membership oracle with a default answer and per-channel overrides
pub(crate) struct FakeMembership {
    default: Membership,
    channels: HashMap<String, Membership>,
    delay: Option<Duration>,
}

impl FakeMembership {
    pub fn new(default: Membership) -> Self {
        Self {
            default,
            channels: HashMap::new(),
            delay: None,
        }
    }

    pub fn with_channel(mut self, channel: &str, status: Membership) -> Self {
        self.channels.insert(channel.to_string(), status);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl MembershipOracle for FakeMembership {
    async fn check_membership(&self, channel_id: &str, _user_id: &str) -> Membership {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.channels
            .get(channel_id)
            .copied()
            .unwrap_or(self.default)
    }
}
