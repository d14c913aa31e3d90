use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};

use approval_flow_core::{InstanceId, InstanceState};
use serde::{Deserialize, Serialize};

/// Emitted after every committed change of state or current step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateTransition {
    pub instance_id: InstanceId,
    pub entity_type: String,
    pub entity_id: String,
    pub old_state: Option<InstanceState>,
    pub new_state: InstanceState,
    pub step_id: Option<String>,
    pub resolved_approvers: BTreeSet<String>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification receiver is gone")]
    Disconnected,
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Fire-and-forget subscriber. Errors are logged by the runtime and never
/// fail the action that produced the transition.
pub trait NotificationSink: Send + Sync {
    /// # Errors
    /// Returns [`NotifyError`] when delivery could not be handed off.
    fn notify(&self, transition: &StateTransition) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn notify(&self, _transition: &StateTransition) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Pushes transitions onto an unbounded channel; never blocks.
pub struct ChannelNotifier {
    sender: Sender<StateTransition>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, Receiver<StateTransition>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, transition: &StateTransition) -> Result<(), NotifyError> {
        self.sender
            .send(transition.clone())
            .map_err(|_| NotifyError::Disconnected)
    }
}
