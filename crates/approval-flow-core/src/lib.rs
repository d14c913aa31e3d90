//! Data model and pure decision logic for the approval workflow engine.
//!
//! Nothing in this crate performs I/O. Definitions are validated here, routing
//! conditions and approver rules are evaluated here, and instance history is
//! folded back into state here. Persistence lives behind [`ApprovalStore`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod condition;
mod config;
mod definition;
mod error;
mod history;
mod resolver;
pub mod store;

pub use condition::{
    select_transition, Condition, EntitySnapshot, FieldValue, Operator, Predicate, PredicateValue,
};
pub use config::EngineConfig;
pub use definition::{
    load_definition_from_path, load_definition_yaml, normalize_definition, parse_definition_yaml,
    select_applicable, validate_definition, ApproverBracket, ApproverRule, DefinitionDraft,
    IssueSeverity, Step, Transition, ValidationIssue, ValidationResult, VetoPolicy, WorkflowDefinition,
};
pub use error::{ApproverRejection, EngineError, ErrorCategory};
pub use history::{
    audit_instance, project_instance, AuditReport, Event, EventAction, InstanceProjection,
    InstanceState, NewEvent, StepTally, WorkflowInstance, SYSTEM_ACTOR,
};
pub use resolver::{
    resolve_approvers, AmountBracketRule, ApproverDirectory, RequesterManagerRule,
    ResolutionContext, ResolveApprovers, RoleRule, SnapshotFieldRule, StaticDirectory, UserRule,
};
pub use store::{
    ApprovalStore, DefinitionPut, HistoryPage, HistoryQuery, InMemoryApprovalStore, StoreError,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct InstanceId(pub Ulid);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DefinitionId(pub Ulid);

impl DefinitionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DefinitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DefinitionId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim()).map(Self)
    }
}

/// Current UTC time at microsecond precision, the precision every store keeps.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    normalize_timestamp(OffsetDateTime::now_utc())
}

/// Converts to UTC and drops sub-microsecond precision.
#[must_use]
pub fn normalize_timestamp(value: OffsetDateTime) -> OffsetDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    let micros = utc.nanosecond() / 1_000;
    utc.replace_nanosecond(micros * 1_000).unwrap_or(utc)
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::Configuration`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Configuration(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Configuration(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(normalize_timestamp(parsed))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Configuration`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EngineError::Configuration(format!("failed to format RFC3339 timestamp: {err}"))
        })
}
