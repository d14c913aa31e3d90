//! Persistence contract for definitions, instances and the event ledger,
//! plus a process-local implementation used by tests and embedders.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::history::{Event, EventAction, InstanceState, NewEvent, WorkflowInstance};
use crate::{DefinitionId, InstanceId};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("instance {instance_id} is at version {actual}, expected {expected}")]
    VersionConflict {
        instance_id: InstanceId,
        expected: u64,
        actual: u64,
    },
    #[error("an in-progress instance already exists for {entity_type}/{entity_id}")]
    DuplicateInFlight {
        entity_type: String,
        entity_id: String,
    },
    #[error("{action} by {actor} is already recorded for instance {instance_id}")]
    DuplicateEvent {
        instance_id: InstanceId,
        action: EventAction,
        actor: String,
    },
    #[error("definition {code} v{version} is already registered with different content")]
    DefinitionConflict { code: String, version: u32 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { instance_id, .. }
            | StoreError::DuplicateEvent { instance_id, .. } => {
                EngineError::ConcurrentModification {
                    instance_id,
                    attempts: 1,
                }
            }
            StoreError::DuplicateInFlight {
                entity_type,
                entity_id,
            } => EngineError::DuplicateInFlight {
                entity_type,
                entity_id,
                existing: None,
            },
            StoreError::DefinitionConflict { code, version } => {
                EngineError::DefinitionConflict { code, version }
            }
            StoreError::NotFound(what) | StoreError::Backend(what) => EngineError::Storage(what),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionPut {
    Inserted(WorkflowDefinition),
    /// Same `(code, version)` and content hash was already registered.
    AlreadyPresent(WorkflowDefinition),
}

impl DefinitionPut {
    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        match self {
            Self::Inserted(definition) | Self::AlreadyPresent(definition) => definition,
        }
    }

    #[must_use]
    pub fn into_definition(self) -> WorkflowDefinition {
        match self {
            Self::Inserted(definition) | Self::AlreadyPresent(definition) => definition,
        }
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Filters for history listings. `from` is inclusive and `to` exclusive,
/// both applied to `completed_at`, or `started_at` while still open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryQuery {
    pub entity_type: Option<String>,
    pub state: Option<InstanceState>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            entity_type: None,
            state: None,
            from: None,
            to: None,
            page: 1,
            page_size: 50,
        }
    }
}

impl HistoryQuery {
    #[must_use]
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        let at = instance.activity_at();
        self.entity_type
            .as_deref()
            .map_or(true, |entity_type| instance.entity_type == entity_type)
            && self.state.map_or(true, |state| instance.state == state)
            && self.from.map_or(true, |from| at >= from)
            && self.to.map_or(true, |to| at < to)
    }

    /// Rows to skip for the requested 1-based page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryPage {
    pub items: Vec<WorkflowInstance>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// Storage the runtime needs. Every write is atomic: either the row change
/// and all of its events land, or nothing does.
pub trait ApprovalStore {
    /// # Errors
    /// [`StoreError::DefinitionConflict`] when `(code, version)` exists with another hash.
    fn put_definition(&self, definition: &WorkflowDefinition) -> Result<DefinitionPut, StoreError>;

    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn get_definition(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Every definition, active or not, optionally for one entity type.
    ///
    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn list_definitions(&self, entity_type: Option<&str>) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn active_definitions_for(&self, entity_type: &str) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// # Errors
    /// [`StoreError::NotFound`] for an unknown id.
    fn set_definition_active(
        &self,
        id: DefinitionId,
        active: bool,
    ) -> Result<WorkflowDefinition, StoreError>;

    /// # Errors
    /// [`StoreError::DuplicateInFlight`] when the entity already has an
    /// in-progress instance.
    fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError>;

    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn get_instance(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, StoreError>;

    /// The in-progress instance for an entity, if any.
    ///
    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn find_in_flight(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Compare-and-swap on `version`.
    ///
    /// # Errors
    /// [`StoreError::VersionConflict`] when the stored version is not
    /// `expected_version`; [`StoreError::DuplicateEvent`] when an event with
    /// the same `(action, actor, occurred_at)` already exists.
    fn commit_transition(
        &self,
        expected_version: u64,
        next: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Events in `event_seq` order.
    ///
    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn list_events(&self, id: InstanceId) -> Result<Vec<Event>, StoreError>;

    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn list_pending_for(&self, identity: &str) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError>;

    /// In-progress instances with `expires_at <= now`, earliest deadline first.
    ///
    /// # Errors
    /// [`StoreError::Backend`] when the store cannot be read.
    fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    definitions: BTreeMap<DefinitionId, WorkflowDefinition>,
    instances: BTreeMap<InstanceId, WorkflowInstance>,
    events: BTreeMap<InstanceId, Vec<Event>>,
    next_seq: i64,
}

impl MemoryState {
    fn sequence(&mut self, instance_id: InstanceId, inputs: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        let existing = self.events.get(&instance_id).map(Vec::as_slice).unwrap_or_default();
        let mut keys: BTreeSet<(EventAction, &str, OffsetDateTime)> = existing
            .iter()
            .map(|event| (event.action, event.actor.as_str(), event.occurred_at))
            .collect();
        for input in &inputs {
            if !keys.insert((input.action, input.actor.as_str(), input.occurred_at)) {
                return Err(StoreError::DuplicateEvent {
                    instance_id,
                    action: input.action,
                    actor: input.actor.clone(),
                });
            }
        }

        let mut sequenced = Vec::with_capacity(inputs.len());
        for input in inputs {
            self.next_seq += 1;
            sequenced.push(Event::from_new(self.next_seq, Ulid::new(), instance_id, input));
        }
        Ok(sequenced)
    }
}

/// Mutex-guarded maps; a single lock covers each call.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    state: Mutex<MemoryState>,
}

impl InMemoryApprovalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }
}

fn sort_definitions(definitions: &mut [WorkflowDefinition]) {
    definitions.sort_by(|lhs, rhs| {
        lhs.entity_type
            .cmp(&rhs.entity_type)
            .then_with(|| lhs.code.cmp(&rhs.code))
            .then(lhs.version.cmp(&rhs.version))
    });
}

impl ApprovalStore for InMemoryApprovalStore {
    fn put_definition(&self, definition: &WorkflowDefinition) -> Result<DefinitionPut, StoreError> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .definitions
            .values()
            .find(|stored| stored.code == definition.code && stored.version == definition.version)
        {
            if existing.content_hash == definition.content_hash {
                return Ok(DefinitionPut::AlreadyPresent(existing.clone()));
            }
            return Err(StoreError::DefinitionConflict {
                code: definition.code.clone(),
                version: definition.version,
            });
        }
        state.definitions.insert(definition.id, definition.clone());
        Ok(DefinitionPut::Inserted(definition.clone()))
    }

    fn get_definition(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.lock()?.definitions.get(&id).cloned())
    }

    fn list_definitions(&self, entity_type: Option<&str>) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let state = self.lock()?;
        let mut definitions: Vec<WorkflowDefinition> = state
            .definitions
            .values()
            .filter(|definition| entity_type.map_or(true, |wanted| definition.entity_type == wanted))
            .cloned()
            .collect();
        sort_definitions(&mut definitions);
        Ok(definitions)
    }

    fn active_definitions_for(&self, entity_type: &str) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut definitions = self.list_definitions(Some(entity_type))?;
        definitions.retain(|definition| definition.active);
        Ok(definitions)
    }

    fn set_definition_active(
        &self,
        id: DefinitionId,
        active: bool,
    ) -> Result<WorkflowDefinition, StoreError> {
        let mut state = self.lock()?;
        let Some(definition) = state.definitions.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("workflow definition {id}")));
        };
        definition.active = active;
        Ok(definition.clone())
    }

    fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut state = self.lock()?;
        if instance.state == InstanceState::InProgress
            && state.instances.values().any(|stored| {
                stored.state == InstanceState::InProgress
                    && stored.entity_type == instance.entity_type
                    && stored.entity_id == instance.entity_id
            })
        {
            return Err(StoreError::DuplicateInFlight {
                entity_type: instance.entity_type.clone(),
                entity_id: instance.entity_id.clone(),
            });
        }
        if state.instances.contains_key(&instance.id) {
            return Err(StoreError::Backend(format!(
                "instance id {} already exists",
                instance.id
            )));
        }

        let sequenced = state.sequence(instance.id, events)?;
        state.instances.insert(instance.id, instance.clone());
        state.events.insert(instance.id, sequenced.clone());
        Ok(sequenced)
    }

    fn get_instance(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.lock()?.instances.get(&id).cloned())
    }

    fn find_in_flight(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self
            .lock()?
            .instances
            .values()
            .find(|instance| {
                instance.state == InstanceState::InProgress
                    && instance.entity_type == entity_type
                    && instance.entity_id == entity_id
            })
            .cloned())
    }

    fn commit_transition(
        &self,
        expected_version: u64,
        next: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut state = self.lock()?;
        let Some(current) = state.instances.get(&next.id) else {
            return Err(StoreError::NotFound(format!("workflow instance {}", next.id)));
        };
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                instance_id: next.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        if current.state.is_terminal() {
            return Err(StoreError::Backend(format!(
                "instance {} is {} and can no longer change",
                next.id, current.state
            )));
        }

        let sequenced = state.sequence(next.id, events)?;
        state.instances.insert(next.id, next.clone());
        state
            .events
            .entry(next.id)
            .or_default()
            .extend(sequenced.iter().cloned());
        Ok(sequenced)
    }

    fn list_events(&self, id: InstanceId) -> Result<Vec<Event>, StoreError> {
        Ok(self.lock()?.events.get(&id).cloned().unwrap_or_default())
    }

    fn list_pending_for(&self, identity: &str) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.lock()?;
        let mut pending: Vec<WorkflowInstance> = state
            .instances
            .values()
            .filter(|instance| instance.is_pending_for(identity))
            .cloned()
            .collect();
        pending.sort_by(|lhs, rhs| lhs.started_at.cmp(&rhs.started_at).then(lhs.id.cmp(&rhs.id)));
        Ok(pending)
    }

    fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        let state = self.lock()?;
        let mut matching: Vec<&WorkflowInstance> = state
            .instances
            .values()
            .filter(|instance| query.matches(instance))
            .collect();
        matching.sort_by(|lhs, rhs| {
            rhs.activity_at()
                .cmp(&lhs.activity_at())
                .then(rhs.id.cmp(&lhs.id))
        });

        let total = u64::try_from(matching.len()).unwrap_or(u64::MAX);
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let page_size = usize::try_from(query.page_size).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page_size)
            .cloned()
            .collect();

        Ok(HistoryPage {
            items,
            page: query.page.max(1),
            page_size: query.page_size,
            total,
        })
    }

    fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.lock()?;
        let mut expired: Vec<WorkflowInstance> = state
            .instances
            .values()
            .filter(|instance| {
                instance.state == InstanceState::InProgress
                    && instance.expires_at.is_some_and(|deadline| deadline <= now)
            })
            .cloned()
            .collect();
        expired.sort_by(|lhs, rhs| lhs.expires_at.cmp(&rhs.expires_at).then(lhs.id.cmp(&rhs.id)));
        expired.truncate(limit);
        Ok(expired)
    }
}
