//! Instance runtime: starts approval instances and applies approve, reject,
//! cancel and expire actions under a per-instance compare-and-swap guard.
//!
//! Every action reads the instance with its `version`, plans the next row and
//! the events that explain it, and commits both atomically through
//! [`ApprovalStore::commit_transition`]. A lost race re-reads and re-plans, up
//! to [`EngineConfig::max_cas_attempts`] times.

use std::collections::BTreeSet;
use std::sync::Arc;

use approval_flow_core::{
    audit_instance, normalize_definition, project_instance, resolve_approvers, select_applicable,
    select_transition, validate_definition, ApprovalStore, ApproverDirectory, ApproverRejection,
    AuditReport, DefinitionDraft, DefinitionId, EngineConfig, EngineError, EntitySnapshot, Event,
    EventAction, HistoryPage, HistoryQuery, InstanceId, InstanceProjection, InstanceState,
    NewEvent, ResolutionContext, StaticDirectory, Step, StepTally, StoreError, ValidationIssue,
    ValidationResult, VetoPolicy, WorkflowDefinition, WorkflowInstance, SYSTEM_ACTOR,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

mod adapter;
mod clock;
mod notify;
mod sweeper;

pub use adapter::{
    static_adapters_from_json, AdapterError, EntityAdapter, EntityAdapterRegistry,
    StaticEntityAdapter,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use notify::{ChannelNotifier, NoopNotifier, NotificationSink, NotifyError, StateTransition};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperHandle};

const LOG_TARGET: &str = "approval_flow::runtime";
const MAX_HISTORY_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub requester: String,
}

impl StartRequest {
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            requester: requester.into(),
        }
    }
}

/// Approve, reject or cancel request. Supplying `occurred_at` makes the
/// request idempotent: a retry with the same key returns the recorded outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRequest {
    pub instance_id: InstanceId,
    pub actor: String,
    pub comment: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

impl ActionRequest {
    #[must_use]
    pub fn new(instance_id: InstanceId, actor: impl Into<String>) -> Self {
        Self {
            instance_id,
            actor: actor.into(),
            comment: None,
            occurred_at: None,
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn at(mut self, occurred_at: OffsetDateTime) -> Self {
        self.occurred_at = Some(approval_flow_core::normalize_timestamp(occurred_at));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub instance: WorkflowInstance,
    /// Events written by this call, or the recorded ones when `replayed`.
    pub events: Vec<Event>,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceView {
    pub instance: WorkflowInstance,
    pub step_name: Option<String>,
    pub quorum: Option<u32>,
    pub tally: StepTally,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisteredDefinition {
    pub definition: WorkflowDefinition,
    pub created: bool,
    pub warnings: Vec<ValidationIssue>,
}

struct StepEntry {
    approvers: BTreeSet<String>,
    expires_at: Option<OffsetDateTime>,
}

struct Plan {
    next: WorkflowInstance,
    events: Vec<NewEvent>,
}

pub struct ApprovalRuntime<S> {
    store: S,
    adapters: EntityAdapterRegistry,
    directory: Box<dyn ApproverDirectory + Send + Sync>,
    notifier: Box<dyn NotificationSink>,
    clock: Box<dyn Clock>,
    config: EngineConfig,
}

pub struct ApprovalRuntimeBuilder<S> {
    store: S,
    adapters: EntityAdapterRegistry,
    directory: Box<dyn ApproverDirectory + Send + Sync>,
    notifier: Box<dyn NotificationSink>,
    clock: Box<dyn Clock>,
    config: EngineConfig,
}

impl<S: ApprovalStore> ApprovalRuntimeBuilder<S> {
    #[must_use]
    pub fn adapter(mut self, adapter: impl EntityAdapter + 'static) -> Self {
        self.adapters.register(Arc::new(adapter));
        self
    }

    #[must_use]
    pub fn adapters(mut self, adapters: EntityAdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    #[must_use]
    pub fn directory(mut self, directory: impl ApproverDirectory + Send + Sync + 'static) -> Self {
        self.directory = Box::new(directory);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: impl NotificationSink + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    /// Returns [`EngineError::Configuration`] when the engine config is out of range.
    pub fn build(self) -> Result<ApprovalRuntime<S>, EngineError> {
        self.config.validate()?;
        Ok(ApprovalRuntime {
            store: self.store,
            adapters: self.adapters,
            directory: self.directory,
            notifier: self.notifier,
            clock: self.clock,
            config: self.config,
        })
    }
}

impl<S: ApprovalStore> ApprovalRuntime<S> {
    /// Starts a builder with no adapters, an empty directory, no notifier,
    /// the system clock and default config.
    #[must_use]
    pub fn builder(store: S) -> ApprovalRuntimeBuilder<S> {
        ApprovalRuntimeBuilder {
            store,
            adapters: EntityAdapterRegistry::new(),
            directory: Box::new(StaticDirectory::new()),
            notifier: Box::new(NoopNotifier),
            clock: Box::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> OffsetDateTime {
        approval_flow_core::normalize_timestamp(self.clock.now())
    }

    // ---------------------------------------------------------------- definitions

    /// Normalizes a draft and reports every structural issue without persisting.
    pub fn validate_definition(&self, draft: &DefinitionDraft) -> ValidationResult {
        let mut draft = draft.clone();
        normalize_definition(&mut draft);
        validate_definition(&draft)
    }

    /// # Errors
    /// [`EngineError::InvalidDefinition`] when validation reports errors and
    /// [`EngineError::DefinitionConflict`] when `(code, version)` is taken by
    /// different content.
    pub fn register_definition(
        &self,
        mut draft: DefinitionDraft,
    ) -> Result<RegisteredDefinition, EngineError> {
        normalize_definition(&mut draft);
        let warnings = validate_definition(&draft).into_result()?;
        let candidate = draft.into_definition(self.now())?;
        let put = self.store.put_definition(&candidate)?;
        let created = put.is_new();
        let definition = put.into_definition();

        if created {
            tracing::info!(
                target: LOG_TARGET,
                definition_id = %definition.id,
                code = %definition.code,
                version = definition.version,
                entity_type = %definition.entity_type,
                warnings = warnings.len(),
                "Definition registered"
            );
        } else {
            tracing::debug!(
                target: LOG_TARGET,
                definition_id = %definition.id,
                code = %definition.code,
                version = definition.version,
                "Definition already registered"
            );
        }

        Ok(RegisteredDefinition {
            definition,
            created,
            warnings,
        })
    }

    /// # Errors
    /// Same as [`Self::register_definition`], plus YAML parse failures.
    pub fn register_definition_yaml(&self, yaml: &str) -> Result<RegisteredDefinition, EngineError> {
        let draft = approval_flow_core::load_definition_yaml(yaml)?;
        self.register_definition(draft)
    }

    /// # Errors
    /// [`EngineError::DefinitionNotFound`] for an unknown id.
    pub fn deactivate_definition(&self, id: DefinitionId) -> Result<WorkflowDefinition, EngineError> {
        let definition = self
            .store
            .set_definition_active(id, false)
            .map_err(|err| match err {
                StoreError::NotFound(_) => EngineError::DefinitionNotFound(id.to_string()),
                other => other.into(),
            })?;
        tracing::info!(
            target: LOG_TARGET,
            definition_id = %definition.id,
            code = %definition.code,
            version = definition.version,
            "Definition deactivated"
        );
        Ok(definition)
    }

    /// # Errors
    /// [`EngineError::DefinitionNotFound`] for an unknown id.
    pub fn get_definition(&self, id: DefinitionId) -> Result<WorkflowDefinition, EngineError> {
        self.store
            .get_definition(id)?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    /// # Errors
    /// Storage failures only.
    pub fn list_definitions(
        &self,
        entity_type: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, EngineError> {
        Ok(self.store.list_definitions(entity_type)?)
    }

    /// Active definition that applies to `entity_type`.
    ///
    /// # Errors
    /// [`EngineError::NoApplicableWorkflow`] when none is active; callers
    /// treat the entity as auto-approved.
    pub fn lookup_definition(&self, entity_type: &str) -> Result<WorkflowDefinition, EngineError> {
        let candidates = self.store.active_definitions_for(entity_type)?;
        select_applicable(&candidates, entity_type)
            .cloned()
            .ok_or_else(|| EngineError::NoApplicableWorkflow {
                entity_type: entity_type.to_string(),
            })
    }

    // ------------------------------------------------------------------ actions

    /// # Errors
    /// [`EngineError::DuplicateInFlight`], [`EngineError::NoApplicableWorkflow`],
    /// [`EngineError::SnapshotUnavailable`], [`EngineError::NoEntryStep`] or
    /// [`EngineError::UnsatisfiableStep`]; nothing is persisted on failure.
    pub fn start_approval(&self, request: &StartRequest) -> Result<ActionOutcome, EngineError> {
        let requester = request.requester.trim();
        if request.entity_type.trim().is_empty()
            || request.entity_id.trim().is_empty()
            || requester.is_empty()
        {
            return Err(EngineError::Configuration(
                "entity_type, entity_id and requester MUST be non-empty".to_string(),
            ));
        }

        if let Some(existing) = self
            .store
            .find_in_flight(&request.entity_type, &request.entity_id)?
        {
            return Err(EngineError::DuplicateInFlight {
                entity_type: request.entity_type.clone(),
                entity_id: request.entity_id.clone(),
                existing: Some(existing.id),
            });
        }

        let definition = self.lookup_definition(&request.entity_type)?;
        let snapshot = self
            .adapters
            .snapshot(&request.entity_type, &request.entity_id)?;
        let entry = select_transition(&definition.transitions, None, &snapshot).ok_or(
            EngineError::NoEntryStep {
                definition_id: definition.id,
            },
        )?;

        let now = self.now();
        let mut instance = WorkflowInstance {
            id: InstanceId::new(),
            workflow_definition_id: definition.id,
            entity_type: request.entity_type.clone(),
            entity_id: request.entity_id.clone(),
            entity_snapshot: snapshot.clone(),
            state: InstanceState::InProgress,
            current_step_id: None,
            resolved_approvers: BTreeSet::new(),
            requester: requester.to_string(),
            started_at: now,
            completed_at: None,
            expires_at: None,
            version: 1,
        };
        let start_event = |step: Option<String>, entered: Option<&StepEntry>| NewEvent {
            action: EventAction::Start,
            actor: requester.to_string(),
            occurred_at: now,
            recorded_at: now,
            comment: None,
            resulting_state: InstanceState::InProgress,
            resulting_step: step,
            approvers: entered.map(|e| e.approvers.clone()).unwrap_or_default(),
            snapshot: Some(snapshot.clone()),
            expires_at: entered.and_then(|e| e.expires_at),
            instance_version: 1,
        };

        let events = match entry.to_step.as_deref() {
            Some(step_id) => {
                let entered = self.enter_step(&definition, step_id, &snapshot, requester, now)?;
                instance.current_step_id = Some(step_id.to_string());
                instance.resolved_approvers.clone_from(&entered.approvers);
                instance.expires_at = entered.expires_at;
                vec![start_event(Some(step_id.to_string()), Some(&entered))]
            }
            None => {
                instance.state = InstanceState::Approved;
                instance.completed_at = Some(now);
                vec![
                    start_event(None, None),
                    NewEvent {
                        action: EventAction::Advance,
                        actor: requester.to_string(),
                        occurred_at: now,
                        recorded_at: now,
                        comment: None,
                        resulting_state: InstanceState::Approved,
                        resulting_step: None,
                        approvers: BTreeSet::new(),
                        snapshot: None,
                        expires_at: None,
                        instance_version: 1,
                    },
                ]
            }
        };

        let committed = match self.store.insert_instance(&instance, events) {
            Ok(committed) => committed,
            Err(StoreError::DuplicateInFlight {
                entity_type,
                entity_id,
            }) => {
                let existing = self
                    .store
                    .find_in_flight(&entity_type, &entity_id)
                    .ok()
                    .flatten()
                    .map(|existing| existing.id);
                return Err(EngineError::DuplicateInFlight {
                    entity_type,
                    entity_id,
                    existing,
                });
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            target: LOG_TARGET,
            instance_id = %instance.id,
            definition_id = %definition.id,
            entity_type = %instance.entity_type,
            entity_id = %instance.entity_id,
            state = %instance.state,
            step_id = instance.current_step_id.as_deref().unwrap_or("-"),
            approvers = instance.resolved_approvers.len(),
            "Instance started"
        );
        self.publish(None, &instance);

        Ok(ActionOutcome {
            instance,
            events: committed,
            replayed: false,
        })
    }

    /// Records an approval; advances the instance when the step reaches quorum.
    ///
    /// # Errors
    /// [`EngineError::NotInProgress`], [`EngineError::NotAnApprover`],
    /// [`EngineError::SnapshotUnavailable`], [`EngineError::NoMatchingTransition`],
    /// [`EngineError::UnsatisfiableStep`] or [`EngineError::ConcurrentModification`].
    pub fn approve(&self, request: &ActionRequest) -> Result<ActionOutcome, EngineError> {
        self.act(EventAction::Approve, request, None)
    }

    /// # Errors
    /// [`EngineError::NotInProgress`], [`EngineError::NotAnApprover`] or
    /// [`EngineError::ConcurrentModification`].
    pub fn reject(&self, request: &ActionRequest) -> Result<ActionOutcome, EngineError> {
        self.act(EventAction::Reject, request, None)
    }

    /// Authorization to cancel is the caller's decision.
    ///
    /// # Errors
    /// [`EngineError::NotInProgress`] or [`EngineError::ConcurrentModification`].
    pub fn cancel(&self, request: &ActionRequest) -> Result<ActionOutcome, EngineError> {
        self.act(EventAction::Cancel, request, None)
    }

    /// Expires the instance if its deadline has passed on the runtime clock.
    ///
    /// # Errors
    /// [`EngineError::NotInProgress`], [`EngineError::NotExpired`] or
    /// [`EngineError::ConcurrentModification`].
    pub fn expire(&self, instance_id: InstanceId) -> Result<ActionOutcome, EngineError> {
        self.expire_as_of(instance_id, self.now())
    }

    /// # Errors
    /// Same as [`Self::expire`], judged against `now`.
    pub fn expire_as_of(
        &self,
        instance_id: InstanceId,
        now: OffsetDateTime,
    ) -> Result<ActionOutcome, EngineError> {
        let request = ActionRequest::new(instance_id, SYSTEM_ACTOR);
        self.act(EventAction::Expire, &request, Some(approval_flow_core::normalize_timestamp(now)))
    }

    // ------------------------------------------------------------------ queries

    /// # Errors
    /// [`EngineError::InstanceNotFound`] for an unknown id.
    pub fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceView, EngineError> {
        let instance = self.load_instance(instance_id)?;
        let events = self.store.list_events(instance_id)?;
        let tally = project_instance(instance_id, &events)?.tally;

        let step = match instance.current_step_id.as_deref() {
            Some(step_id) => self
                .store
                .get_definition(instance.workflow_definition_id)?
                .and_then(|definition| definition.step(step_id).cloned()),
            None => None,
        };

        Ok(InstanceView {
            step_name: step.as_ref().map(|step| step.name.clone()),
            quorum: step.as_ref().map(|step| step.quorum),
            instance,
            tally,
        })
    }

    /// Full event history in append order.
    ///
    /// # Errors
    /// [`EngineError::InstanceNotFound`] for an unknown id.
    pub fn history_events(&self, instance_id: InstanceId) -> Result<Vec<Event>, EngineError> {
        self.load_instance(instance_id)?;
        Ok(self.store.list_events(instance_id)?)
    }

    /// Rebuilds instance state from history alone.
    ///
    /// # Errors
    /// [`EngineError::HistoryCorrupted`] when the events do not fold.
    pub fn replay(&self, instance_id: InstanceId) -> Result<InstanceProjection, EngineError> {
        let events = self.history_events(instance_id)?;
        project_instance(instance_id, &events)
    }

    /// # Errors
    /// [`EngineError::InstanceNotFound`] for an unknown id.
    pub fn audit(&self, instance_id: InstanceId) -> Result<AuditReport, EngineError> {
        let instance = self.load_instance(instance_id)?;
        let events = self.store.list_events(instance_id)?;
        let report = audit_instance(&instance, &events);
        if !report.consistent {
            tracing::warn!(
                target: LOG_TARGET,
                instance_id = %instance_id,
                issues = ?report.issues,
                "History does not reproduce the instance row"
            );
        }
        Ok(report)
    }

    /// In-progress instances whose current approver set contains `identity`.
    ///
    /// # Errors
    /// Storage failures only.
    pub fn pending_for(&self, identity: &str) -> Result<Vec<WorkflowInstance>, EngineError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.list_pending_for(identity)?)
    }

    /// A `page_size` of 0 selects the configured default.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] for page 0, oversized pages or an empty range.
    pub fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage, EngineError> {
        let mut query = query.clone();
        if query.page_size == 0 {
            query.page_size = self.config.default_history_page_size;
        }
        if query.page == 0 {
            return Err(EngineError::Configuration("page MUST be >= 1".to_string()));
        }
        if query.page_size > MAX_HISTORY_PAGE_SIZE {
            return Err(EngineError::Configuration(format!(
                "page_size MUST be <= {MAX_HISTORY_PAGE_SIZE}"
            )));
        }
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from >= to {
                return Err(EngineError::Configuration(
                    "history range requires from < to".to_string(),
                ));
            }
        }
        Ok(self.store.query_history(&query)?)
    }

    // ---------------------------------------------------------------- internals

    fn load_instance(&self, instance_id: InstanceId) -> Result<WorkflowInstance, EngineError> {
        self.store
            .get_instance(instance_id)?
            .ok_or(EngineError::InstanceNotFound { instance_id })
    }

    fn act(
        &self,
        action: EventAction,
        request: &ActionRequest,
        as_of: Option<OffsetDateTime>,
    ) -> Result<ActionOutcome, EngineError> {
        // The idempotency key is matched exactly as it was recorded.
        let request = &ActionRequest {
            instance_id: request.instance_id,
            actor: request.actor.trim().to_string(),
            comment: request.comment.clone(),
            occurred_at: request
                .occurred_at
                .map(approval_flow_core::normalize_timestamp),
        };
        let attempts = self.config.max_cas_attempts;
        for attempt in 1..=attempts {
            let instance = self.load_instance(request.instance_id)?;
            let history = self.store.list_events(instance.id)?;

            if let Some(occurred_at) = request.occurred_at {
                if let Some(recorded) = history
                    .iter()
                    .find(|event| event.matches_key(action, &request.actor, occurred_at))
                {
                    tracing::info!(
                        target: LOG_TARGET,
                        instance_id = %instance.id,
                        action = %action,
                        actor = %request.actor,
                        event_seq = recorded.event_seq,
                        "Replayed request returns the recorded outcome"
                    );
                    let version = recorded.instance_version;
                    let events = history
                        .iter()
                        .filter(|event| event.instance_version == version)
                        .cloned()
                        .collect();
                    return Ok(ActionOutcome {
                        instance,
                        events,
                        replayed: true,
                    });
                }
            }

            let now = as_of.unwrap_or_else(|| self.now());
            let plan = self.plan(action, request, &instance, &history, now)?;
            match self
                .store
                .commit_transition(instance.version, &plan.next, plan.events)
            {
                Ok(committed) => {
                    self.log_committed(action, &request.actor, &instance, &plan.next);
                    if instance.state != plan.next.state
                        || instance.current_step_id != plan.next.current_step_id
                    {
                        self.publish(Some(instance.state), &plan.next);
                    }
                    return Ok(ActionOutcome {
                        instance: plan.next,
                        events: committed,
                        replayed: false,
                    });
                }
                Err(err @ (StoreError::VersionConflict { .. } | StoreError::DuplicateEvent { .. })) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        instance_id = %instance.id,
                        action = %action,
                        actor = %request.actor,
                        attempt,
                        error = %err,
                        "Compare-and-swap lost; retrying from a fresh read"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::warn!(
            target: LOG_TARGET,
            instance_id = %request.instance_id,
            action = %action,
            actor = %request.actor,
            attempts,
            "Compare-and-swap retries exhausted"
        );
        Err(EngineError::ConcurrentModification {
            instance_id: request.instance_id,
            attempts,
        })
    }

    fn plan(
        &self,
        action: EventAction,
        request: &ActionRequest,
        instance: &WorkflowInstance,
        history: &[Event],
        now: OffsetDateTime,
    ) -> Result<Plan, EngineError> {
        if instance.state.is_terminal() {
            return Err(EngineError::NotInProgress {
                instance_id: instance.id,
                state: instance.state,
            });
        }

        let actor = request.actor.clone();
        let occurred_at = request
            .occurred_at
            .unwrap_or_else(|| free_slot(history, &[], action, &actor, now));
        let version = instance.version + 1;
        let mut next = instance.clone();
        next.version = version;
        let mut event = NewEvent {
            action,
            actor: actor.clone(),
            occurred_at,
            recorded_at: now,
            comment: request.comment.clone(),
            resulting_state: InstanceState::InProgress,
            resulting_step: instance.current_step_id.clone(),
            approvers: BTreeSet::new(),
            snapshot: None,
            expires_at: None,
            instance_version: version,
        };

        match action {
            EventAction::Approve => {
                let (definition, tally) = self.current_step(instance, history)?;
                let step = step_of(&definition, instance)?;
                check_voter(instance, &tally, &actor)?;

                let approvals = tally.approval_count() + 1;
                if approvals < quorum_of(step) {
                    return Ok(Plan {
                        next,
                        events: vec![event],
                    });
                }

                let mut events = vec![event];
                let advance = self.advance(&definition, step, &mut next, &events, history, now)?;
                events.push(advance);
                Ok(Plan { next, events })
            }
            EventAction::Reject => {
                let (definition, tally) = self.current_step(instance, history)?;
                let step = step_of(&definition, instance)?;
                check_voter(instance, &tally, &actor)?;

                let terminates = match step.veto_policy {
                    VetoPolicy::AnyRejectionTerminates => true,
                    VetoPolicy::MajorityRequired => {
                        let approvals = tally.approval_count();
                        let undecided = instance
                            .resolved_approvers
                            .len()
                            .saturating_sub(approvals + tally.rejection_count() + 1);
                        approvals + undecided < quorum_of(step)
                    }
                };
                if terminates {
                    terminate(&mut next, &mut event, InstanceState::Rejected, now);
                }
                Ok(Plan {
                    next,
                    events: vec![event],
                })
            }
            EventAction::Cancel => {
                terminate(&mut next, &mut event, InstanceState::Cancelled, now);
                Ok(Plan {
                    next,
                    events: vec![event],
                })
            }
            EventAction::Expire => {
                match instance.expires_at {
                    Some(deadline) if deadline <= now => {}
                    expires_at => {
                        return Err(EngineError::NotExpired {
                            instance_id: instance.id,
                            expires_at,
                        })
                    }
                }
                terminate(&mut next, &mut event, InstanceState::Expired, now);
                Ok(Plan {
                    next,
                    events: vec![event],
                })
            }
            EventAction::Start | EventAction::Advance => Err(EngineError::Configuration(format!(
                "{action} is not a caller action"
            ))),
        }
    }

    /// Routes out of the current step. Mutates `next` and returns the advance
    /// event; the triggering actor is recorded on it.
    fn advance(
        &self,
        definition: &WorkflowDefinition,
        step: &Step,
        next: &mut WorkflowInstance,
        pending: &[NewEvent],
        history: &[Event],
        now: OffsetDateTime,
    ) -> Result<NewEvent, EngineError> {
        let Some(trigger) = pending.first() else {
            return Err(EngineError::Configuration(
                "advance requires a triggering event".to_string(),
            ));
        };
        let snapshot = self.adapters.snapshot(&next.entity_type, &next.entity_id)?;
        let transition = select_transition(&definition.transitions, Some(&step.id), &snapshot)
            .ok_or_else(|| EngineError::NoMatchingTransition {
                instance_id: next.id,
                step_id: step.id.clone(),
            })?;

        let mut event = NewEvent {
            action: EventAction::Advance,
            actor: trigger.actor.clone(),
            occurred_at: free_slot(
                history,
                pending,
                EventAction::Advance,
                &trigger.actor,
                trigger.occurred_at,
            ),
            recorded_at: now,
            comment: None,
            resulting_state: InstanceState::Approved,
            resulting_step: None,
            approvers: BTreeSet::new(),
            snapshot: Some(snapshot.clone()),
            expires_at: None,
            instance_version: next.version,
        };

        match transition.to_step.as_deref() {
            None => {
                next.state = InstanceState::Approved;
                next.current_step_id = None;
                next.completed_at = Some(now);
            }
            Some(to_step) => {
                let entered = self.enter_step(definition, to_step, &snapshot, &next.requester, now)?;
                next.current_step_id = Some(to_step.to_string());
                next.resolved_approvers.clone_from(&entered.approvers);
                next.expires_at = entered.expires_at;
                event.resulting_state = InstanceState::InProgress;
                event.resulting_step = Some(to_step.to_string());
                event.approvers = entered.approvers;
                event.expires_at = entered.expires_at;
            }
        }
        next.entity_snapshot = snapshot;
        Ok(event)
    }

    /// Freezes the approver set and deadline for a step being entered.
    fn enter_step(
        &self,
        definition: &WorkflowDefinition,
        step_id: &str,
        snapshot: &EntitySnapshot,
        requester: &str,
        now: OffsetDateTime,
    ) -> Result<StepEntry, EngineError> {
        let step = definition.step(step_id).ok_or_else(|| {
            EngineError::Configuration(format!(
                "definition {} routes to unknown step {step_id}",
                definition.id
            ))
        })?;
        let context = ResolutionContext {
            snapshot,
            requester,
            directory: self.directory.as_ref(),
        };
        let approvers = resolve_approvers(&step.approver_rule, &context);
        if approvers.len() < quorum_of(step) {
            return Err(EngineError::UnsatisfiableStep {
                step_id: step.id.clone(),
                quorum: step.quorum,
                available: approvers.len(),
            });
        }

        let expires_at = match step.timeout_secs {
            None => None,
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(|secs| now.checked_add(Duration::seconds(secs)))
                    .ok_or_else(|| {
                        EngineError::Configuration(format!(
                            "timeout_secs of step {step_id} overflows the deadline"
                        ))
                    })?,
            ),
        };

        Ok(StepEntry {
            approvers,
            expires_at,
        })
    }

    fn current_step(
        &self,
        instance: &WorkflowInstance,
        history: &[Event],
    ) -> Result<(WorkflowDefinition, StepTally), EngineError> {
        let definition = self
            .store
            .get_definition(instance.workflow_definition_id)?
            .ok_or_else(|| EngineError::HistoryCorrupted {
                instance_id: instance.id,
                reason: format!(
                    "pinned definition {} is missing",
                    instance.workflow_definition_id
                ),
            })?;
        let tally = project_instance(instance.id, history)?.tally;
        Ok((definition, tally))
    }

    fn log_committed(
        &self,
        action: EventAction,
        actor: &str,
        before: &WorkflowInstance,
        after: &WorkflowInstance,
    ) {
        if after.state.is_terminal() {
            tracing::info!(
                target: LOG_TARGET,
                instance_id = %after.id,
                action = %action,
                actor = %actor,
                state = %after.state,
                version = after.version,
                "Instance completed"
            );
        } else if before.current_step_id != after.current_step_id {
            tracing::info!(
                target: LOG_TARGET,
                instance_id = %after.id,
                actor = %actor,
                from_step = before.current_step_id.as_deref().unwrap_or("-"),
                step_id = after.current_step_id.as_deref().unwrap_or("-"),
                approvers = after.resolved_approvers.len(),
                version = after.version,
                "Instance advanced"
            );
        } else {
            tracing::debug!(
                target: LOG_TARGET,
                instance_id = %after.id,
                action = %action,
                actor = %actor,
                version = after.version,
                "Vote recorded"
            );
        }
    }

    fn publish(&self, old_state: Option<InstanceState>, instance: &WorkflowInstance) {
        let transition = StateTransition {
            instance_id: instance.id,
            entity_type: instance.entity_type.clone(),
            entity_id: instance.entity_id.clone(),
            old_state,
            new_state: instance.state,
            step_id: instance.current_step_id.clone(),
            resolved_approvers: instance.resolved_approvers.clone(),
        };
        if let Err(err) = self.notifier.notify(&transition) {
            tracing::warn!(
                target: LOG_TARGET,
                instance_id = %instance.id,
                error = %err,
                "Notification delivery failed"
            );
        }
    }
}

fn step_of<'a>(
    definition: &'a WorkflowDefinition,
    instance: &WorkflowInstance,
) -> Result<&'a Step, EngineError> {
    let corrupted = |reason: String| EngineError::HistoryCorrupted {
        instance_id: instance.id,
        reason,
    };
    let step_id = instance
        .current_step_id
        .as_deref()
        .ok_or_else(|| corrupted("in-progress instance has no current step".to_string()))?;
    definition.step(step_id).ok_or_else(|| {
        corrupted(format!(
            "current step {step_id} is not part of definition {}",
            definition.id
        ))
    })
}

fn check_voter(instance: &WorkflowInstance, tally: &StepTally, actor: &str) -> Result<(), EngineError> {
    let reject = |reason| EngineError::NotAnApprover {
        instance_id: instance.id,
        actor: actor.to_string(),
        reason,
    };
    if !instance.resolved_approvers.contains(actor) {
        return Err(reject(ApproverRejection::NotInApproverSet));
    }
    if tally.has_acted(actor) {
        return Err(reject(ApproverRejection::AlreadyActed));
    }
    Ok(())
}

fn quorum_of(step: &Step) -> usize {
    usize::try_from(step.quorum).unwrap_or(usize::MAX)
}

fn terminate(
    next: &mut WorkflowInstance,
    event: &mut NewEvent,
    state: InstanceState,
    now: OffsetDateTime,
) {
    next.state = state;
    next.current_step_id = None;
    next.completed_at = Some(now);
    event.resulting_state = state;
    event.resulting_step = None;
}

/// Earliest instant at or after `from` whose `(action, actor, occurred_at)`
/// key is not yet taken, stepping by one microsecond.
fn free_slot(
    history: &[Event],
    pending: &[NewEvent],
    action: EventAction,
    actor: &str,
    from: OffsetDateTime,
) -> OffsetDateTime {
    let taken = |at: OffsetDateTime| {
        history.iter().any(|event| event.matches_key(action, actor, at))
            || pending
                .iter()
                .any(|event| event.action == action && event.actor == actor && event.occurred_at == at)
    };
    let mut at = from;
    while taken(at) {
        at += Duration::microseconds(1);
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_flow_core::{ApproverRule, Condition, InMemoryApprovalStore, RoleRule, Transition};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn review_step(id: &str, quorum: u32) -> Step {
        Step {
            id: id.to_string(),
            sequence: 1,
            name: "Review".to_string(),
            approver_rule: ApproverRule::Role(RoleRule {
                role: "reviewers".to_string(),
            }),
            quorum,
            veto_policy: VetoPolicy::AnyRejectionTerminates,
            timeout_secs: None,
        }
    }

    fn route(from: Option<&str>, to: Option<&str>) -> Transition {
        Transition {
            from_step: from.map(str::to_string),
            to_step: to.map(str::to_string),
            condition: Condition::always(),
            order: 0,
        }
    }

    fn single_step(quorum: u32) -> DefinitionDraft {
        DefinitionDraft {
            code: "po".to_string(),
            version: 1,
            name: "Purchase orders".to_string(),
            entity_type: "purchase_order".to_string(),
            active: true,
            priority: 0,
            steps: vec![review_step("review", quorum)],
            transitions: vec![route(None, Some("review")), route(Some("review"), None)],
        }
    }

    fn runtime(users: &[&str], clock: ManualClock) -> ApprovalRuntime<InMemoryApprovalStore> {
        let adapter = StaticEntityAdapter::new("purchase_order")
            .with_record("po-1", EntitySnapshot::new().with("amount", 100.0));
        must(
            ApprovalRuntime::builder(InMemoryApprovalStore::new())
                .adapter(adapter)
                .directory(StaticDirectory::new().with_role("reviewers", users.iter().copied()))
                .clock(clock)
                .build(),
        )
    }

    #[test]
    fn frozen_clock_still_yields_distinct_event_keys() {
        let clock = ManualClock::new(OffsetDateTime::UNIX_EPOCH);
        let runtime = runtime(&["ann"], clock);
        let mut draft = single_step(1);
        draft.steps.push(Step {
            sequence: 2,
            ..review_step("final", 1)
        });
        draft.transitions = vec![
            route(None, Some("review")),
            route(Some("review"), Some("final")),
            route(Some("final"), None),
        ];
        must(runtime.register_definition(draft));

        let id = must(runtime.start_approval(&StartRequest::new("purchase_order", "po-1", "rita")))
            .instance
            .id;
        let first = must(runtime.approve(&ActionRequest::new(id, "ann")));
        assert_eq!(first.instance.current_step_id.as_deref(), Some("final"));

        let second = must(runtime.approve(&ActionRequest::new(id, "ann")));
        assert_eq!(second.instance.state, InstanceState::Approved);
        assert_eq!(
            second.events[0].occurred_at,
            OffsetDateTime::UNIX_EPOCH + Duration::microseconds(1)
        );
        assert!(must(runtime.audit(id)).consistent);
    }

    #[test]
    fn majority_rejection_waits_until_quorum_is_unreachable() {
        let clock = ManualClock::new(OffsetDateTime::UNIX_EPOCH);
        let runtime = runtime(&["ann", "ben", "cat"], clock);
        let mut draft = single_step(2);
        draft.steps[0].veto_policy = VetoPolicy::MajorityRequired;
        must(runtime.register_definition(draft));

        let id = must(runtime.start_approval(&StartRequest::new("purchase_order", "po-1", "rita")))
            .instance
            .id;
        let first = must(runtime.reject(&ActionRequest::new(id, "ann")));
        assert_eq!(first.instance.state, InstanceState::InProgress);

        let second = must(runtime.reject(&ActionRequest::new(id, "ben")));
        assert_eq!(second.instance.state, InstanceState::Rejected);
        assert!(must(runtime.audit(id)).consistent);
    }

    #[test]
    fn unknown_actor_and_double_vote_are_refused() {
        let clock = ManualClock::new(OffsetDateTime::UNIX_EPOCH);
        let runtime = runtime(&["ann", "ben"], clock);
        must(runtime.register_definition(single_step(2)));
        let id = must(runtime.start_approval(&StartRequest::new("purchase_order", "po-1", "rita")))
            .instance
            .id;

        assert!(matches!(
            runtime.approve(&ActionRequest::new(id, "mallory")),
            Err(EngineError::NotAnApprover {
                reason: ApproverRejection::NotInApproverSet,
                ..
            })
        ));
        must(runtime.approve(&ActionRequest::new(id, "ann")));
        assert!(matches!(
            runtime.approve(&ActionRequest::new(id, "ann")),
            Err(EngineError::NotAnApprover {
                reason: ApproverRejection::AlreadyActed,
                ..
            })
        ));
        assert_eq!(must(runtime.get_instance(id)).tally.approval_count(), 1);
    }

    #[test]
    fn history_query_rejects_bad_paging() {
        let runtime = runtime(&["ann"], ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let query = HistoryQuery {
            page: 0,
            ..HistoryQuery::default()
        };
        assert!(matches!(
            runtime.query_history(&query),
            Err(EngineError::Configuration(_))
        ));
        let query = HistoryQuery {
            page_size: 0,
            ..HistoryQuery::default()
        };
        assert_eq!(must(runtime.query_history(&query)).page_size, 50);
    }
}
