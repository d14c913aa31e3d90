use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::condition::EntitySnapshot;
use crate::error::EngineError;
use crate::{DefinitionId, InstanceId};

/// Actor recorded on events the engine emits on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    InProgress,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl InstanceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Start,
    Approve,
    Reject,
    Cancel,
    Expire,
    Advance,
}

impl EventAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
            Self::Advance => "advance",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "cancel" => Some(Self::Cancel),
            "expire" => Some(Self::Expire),
            "advance" => Some(Self::Advance),
            _ => None,
        }
    }
}

impl Display for EventAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_definition_id: DefinitionId,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_snapshot: EntitySnapshot,
    pub state: InstanceState,
    pub current_step_id: Option<String>,
    pub resolved_approvers: BTreeSet<String>,
    pub requester: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub version: u64,
}

impl WorkflowInstance {
    #[must_use]
    pub fn is_pending_for(&self, identity: &str) -> bool {
        self.state == InstanceState::InProgress && self.resolved_approvers.contains(identity)
    }

    /// Ordering key for history listings.
    #[must_use]
    pub fn activity_at(&self) -> OffsetDateTime {
        self.completed_at.unwrap_or(self.started_at)
    }
}

/// An event as the runtime proposes it, before the store sequences it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub action: EventAction,
    pub actor: String,
    /// Caller-supplied time; part of the idempotency key.
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub comment: Option<String>,
    pub resulting_state: InstanceState,
    pub resulting_step: Option<String>,
    /// Approver set frozen for the step entered by a `start` or `advance`.
    #[serde(default)]
    pub approvers: BTreeSet<String>,
    /// Snapshot captured on entry to a step.
    #[serde(default)]
    pub snapshot: Option<EntitySnapshot>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Instance version after the commit that wrote this event.
    pub instance_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub instance_id: InstanceId,
    pub action: EventAction,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub comment: Option<String>,
    pub resulting_state: InstanceState,
    pub resulting_step: Option<String>,
    #[serde(default)]
    pub approvers: BTreeSet<String>,
    #[serde(default)]
    pub snapshot: Option<EntitySnapshot>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub instance_version: u64,
}

impl Event {
    #[must_use]
    pub fn from_new(event_seq: i64, event_id: Ulid, instance_id: InstanceId, input: NewEvent) -> Self {
        Self {
            event_seq,
            event_id,
            instance_id,
            action: input.action,
            actor: input.actor,
            occurred_at: input.occurred_at,
            recorded_at: input.recorded_at,
            comment: input.comment,
            resulting_state: input.resulting_state,
            resulting_step: input.resulting_step,
            approvers: input.approvers,
            snapshot: input.snapshot,
            expires_at: input.expires_at,
            instance_version: input.instance_version,
        }
    }

    /// Whether this event is the record of the given request.
    #[must_use]
    pub fn matches_key(&self, action: EventAction, actor: &str, occurred_at: OffsetDateTime) -> bool {
        self.action == action && self.actor == actor && self.occurred_at == occurred_at
    }
}

/// Votes cast on the step the instance currently sits in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepTally {
    pub approvals: BTreeSet<String>,
    pub rejections: BTreeSet<String>,
}

impl StepTally {
    #[must_use]
    pub fn has_acted(&self, identity: &str) -> bool {
        self.approvals.contains(identity) || self.rejections.contains(identity)
    }

    #[must_use]
    pub fn approval_count(&self) -> usize {
        self.approvals.len()
    }

    #[must_use]
    pub fn rejection_count(&self) -> usize {
        self.rejections.len()
    }
}

/// State rebuilt from history alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceProjection {
    pub instance_id: InstanceId,
    pub state: InstanceState,
    pub current_step_id: Option<String>,
    pub resolved_approvers: BTreeSet<String>,
    pub entity_snapshot: Option<EntitySnapshot>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub version: u64,
    pub tally: StepTally,
    pub event_count: usize,
}

fn corrupted(instance_id: InstanceId, event: &Event, reason: &str) -> EngineError {
    EngineError::HistoryCorrupted {
        instance_id,
        reason: format!("event {} ({}): {reason}", event.event_seq, event.action),
    }
}

/// Fold events in `event_seq` order into the instance state they imply.
///
/// # Errors
/// Returns [`EngineError::HistoryCorrupted`] when the sequence is empty, out
/// of order, belongs to another instance, or describes a transition the
/// state machine does not allow.
pub fn project_instance(
    instance_id: InstanceId,
    events: &[Event],
) -> Result<InstanceProjection, EngineError> {
    let Some(first) = events.first() else {
        return Err(EngineError::HistoryCorrupted {
            instance_id,
            reason: "no events recorded".to_string(),
        });
    };
    if first.action != EventAction::Start {
        return Err(corrupted(instance_id, first, "history must begin with start"));
    }

    let mut projection = InstanceProjection {
        instance_id,
        state: InstanceState::InProgress,
        current_step_id: None,
        resolved_approvers: BTreeSet::new(),
        entity_snapshot: None,
        started_at: first.recorded_at,
        completed_at: None,
        expires_at: None,
        version: first.instance_version,
        tally: StepTally::default(),
        event_count: 0,
    };
    let mut previous_seq: Option<i64> = None;

    for event in events {
        if event.instance_id != instance_id {
            return Err(corrupted(instance_id, event, "belongs to another instance"));
        }
        if previous_seq.is_some_and(|seq| event.event_seq <= seq) {
            return Err(corrupted(instance_id, event, "event_seq is not increasing"));
        }
        if event.instance_version < projection.version {
            return Err(corrupted(instance_id, event, "instance version went backwards"));
        }
        if projection.event_count > 0 && projection.state.is_terminal() {
            return Err(corrupted(instance_id, event, "recorded after a terminal state"));
        }
        previous_seq = Some(event.event_seq);

        apply_event(&mut projection, event)?;
        projection.version = event.instance_version;
        projection.event_count += 1;
    }

    Ok(projection)
}

fn apply_event(projection: &mut InstanceProjection, event: &Event) -> Result<(), EngineError> {
    let instance_id = projection.instance_id;
    let expect_state = |expected: InstanceState| {
        if event.resulting_state == expected {
            Ok(())
        } else {
            Err(corrupted(
                instance_id,
                event,
                &format!("resulting_state {} where {expected} was required", event.resulting_state),
            ))
        }
    };

    match event.action {
        EventAction::Start => {
            if projection.event_count > 0 {
                return Err(corrupted(instance_id, event, "duplicate start"));
            }
            expect_state(InstanceState::InProgress)?;
            enter_step(projection, event);
        }
        EventAction::Approve => {
            expect_state(InstanceState::InProgress)?;
            check_vote(projection, event)?;
            projection.tally.approvals.insert(event.actor.clone());
        }
        EventAction::Reject => {
            check_vote(projection, event)?;
            projection.tally.rejections.insert(event.actor.clone());
            match event.resulting_state {
                InstanceState::InProgress => {}
                InstanceState::Rejected => terminate(projection, event),
                _ => return Err(corrupted(instance_id, event, "reject must stay open or reject")),
            }
        }
        EventAction::Advance => match event.resulting_state {
            InstanceState::InProgress if event.resulting_step.is_some() => enter_step(projection, event),
            InstanceState::Approved => terminate(projection, event),
            _ => return Err(corrupted(instance_id, event, "advance must enter a step or approve")),
        },
        EventAction::Cancel => {
            expect_state(InstanceState::Cancelled)?;
            terminate(projection, event);
        }
        EventAction::Expire => {
            expect_state(InstanceState::Expired)?;
            terminate(projection, event);
        }
    }
    Ok(())
}

fn check_vote(projection: &InstanceProjection, event: &Event) -> Result<(), EngineError> {
    if !projection.resolved_approvers.contains(&event.actor) {
        return Err(corrupted(projection.instance_id, event, "vote by an identity outside the approver set"));
    }
    if projection.tally.has_acted(&event.actor) {
        return Err(corrupted(projection.instance_id, event, "second vote on the same step"));
    }
    Ok(())
}

fn enter_step(projection: &mut InstanceProjection, event: &Event) {
    projection.state = InstanceState::InProgress;
    projection.current_step_id.clone_from(&event.resulting_step);
    projection.resolved_approvers.clone_from(&event.approvers);
    projection.expires_at = event.expires_at;
    if event.snapshot.is_some() {
        projection.entity_snapshot.clone_from(&event.snapshot);
    }
    projection.tally = StepTally::default();
}

fn terminate(projection: &mut InstanceProjection, event: &Event) {
    projection.state = event.resulting_state;
    projection.current_step_id = None;
    projection.completed_at = Some(event.recorded_at);
    if event.snapshot.is_some() {
        projection.entity_snapshot.clone_from(&event.snapshot);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub instance_id: InstanceId,
    pub consistent: bool,
    pub event_count: usize,
    pub issues: Vec<String>,
    pub projection: Option<InstanceProjection>,
}

/// Compare the stored instance row against what its history implies.
#[must_use]
pub fn audit_instance(instance: &WorkflowInstance, events: &[Event]) -> AuditReport {
    let projection = match project_instance(instance.id, events) {
        Ok(projection) => projection,
        Err(err) => {
            return AuditReport {
                instance_id: instance.id,
                consistent: false,
                event_count: events.len(),
                issues: vec![err.to_string()],
                projection: None,
            }
        }
    };

    let mut issues = Vec::new();
    if projection.state != instance.state {
        issues.push(format!("state: row={} history={}", instance.state, projection.state));
    }
    if projection.current_step_id != instance.current_step_id {
        issues.push(format!(
            "current_step_id: row={:?} history={:?}",
            instance.current_step_id, projection.current_step_id
        ));
    }
    if projection.resolved_approvers != instance.resolved_approvers {
        issues.push(format!(
            "resolved_approvers: row={:?} history={:?}",
            instance.resolved_approvers, projection.resolved_approvers
        ));
    }
    if projection.completed_at != instance.completed_at {
        issues.push(format!(
            "completed_at: row={:?} history={:?}",
            instance.completed_at, projection.completed_at
        ));
    }
    if projection.started_at != instance.started_at {
        issues.push("started_at differs from the start event".to_string());
    }
    if projection.version != instance.version {
        issues.push(format!(
            "version: row={} history={}",
            instance.version, projection.version
        ));
    }
    if projection
        .entity_snapshot
        .as_ref()
        .is_some_and(|snapshot| snapshot != &instance.entity_snapshot)
    {
        issues.push("entity_snapshot differs from the last captured snapshot".to_string());
    }

    AuditReport {
        instance_id: instance.id,
        consistent: issues.is_empty(),
        event_count: events.len(),
        issues,
        projection: Some(projection),
    }
}
