use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::definition::ValidationIssue;
use crate::history::InstanceState;
use crate::{DefinitionId, InstanceId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Request,
    Concurrency,
    Collaborator,
    Storage,
    Integrity,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Request => "request",
            Self::Concurrency => "concurrency",
            Self::Collaborator => "collaborator",
            Self::Storage => "storage",
            Self::Integrity => "integrity",
        }
    }
}

/// Why an actor's vote was refused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ApproverRejection {
    NotInApproverSet,
    AlreadyActed,
}

impl Display for ApproverRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInApproverSet => write!(f, "not in the approver set of the current step"),
            Self::AlreadyActed => write!(f, "already acted on the current step"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EngineError {
    #[error("invalid workflow definition: {}", summarize_issues(.0))]
    InvalidDefinition(Vec<ValidationIssue>),
    #[error("definition {code} v{version} is already registered with different content")]
    DefinitionConflict { code: String, version: u32 },
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),
    #[error("an in-progress instance already exists for {entity_type}/{entity_id}")]
    DuplicateInFlight {
        entity_type: String,
        entity_id: String,
        existing: Option<InstanceId>,
    },
    #[error("no active workflow definition for entity type {entity_type}")]
    NoApplicableWorkflow { entity_type: String },
    #[error("definition {definition_id} has no start transition matching the snapshot")]
    NoEntryStep { definition_id: DefinitionId },
    #[error("no transition out of step {step_id} matches the snapshot of instance {instance_id}")]
    NoMatchingTransition {
        instance_id: InstanceId,
        step_id: String,
    },
    #[error("step {step_id} needs {quorum} approvals but only {available} approvers resolved")]
    UnsatisfiableStep {
        step_id: String,
        quorum: u32,
        available: usize,
    },
    #[error("instance {instance_id} not found")]
    InstanceNotFound { instance_id: InstanceId },
    #[error("instance {instance_id} is {state}, not in progress")]
    NotInProgress {
        instance_id: InstanceId,
        state: InstanceState,
    },
    #[error("{actor} cannot act on instance {instance_id}: {reason}")]
    NotAnApprover {
        instance_id: InstanceId,
        actor: String,
        reason: ApproverRejection,
    },
    #[error("instance {instance_id} has not reached its deadline")]
    NotExpired {
        instance_id: InstanceId,
        expires_at: Option<OffsetDateTime>,
    },
    #[error("instance {instance_id} was modified concurrently; gave up after {attempts} attempts")]
    ConcurrentModification {
        instance_id: InstanceId,
        attempts: u32,
    },
    #[error("snapshot unavailable for {entity_type}/{entity_id}: {reason}")]
    SnapshotUnavailable {
        entity_type: String,
        entity_id: String,
        reason: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("history of instance {instance_id} is inconsistent: {reason}")]
    HistoryCorrupted {
        instance_id: InstanceId,
        reason: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Stable machine-readable reason code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::DefinitionConflict { .. } => "definition_conflict",
            Self::DefinitionNotFound(_) => "definition_not_found",
            Self::DuplicateInFlight { .. } => "duplicate_in_flight",
            Self::NoApplicableWorkflow { .. } => "no_applicable_workflow",
            Self::NoEntryStep { .. } => "no_entry_step",
            Self::NoMatchingTransition { .. } => "no_matching_transition",
            Self::UnsatisfiableStep { .. } => "unsatisfiable_step",
            Self::InstanceNotFound { .. } => "instance_not_found",
            Self::NotInProgress { .. } => "not_in_progress",
            Self::NotAnApprover { .. } => "not_an_approver",
            Self::NotExpired { .. } => "not_expired",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::SnapshotUnavailable { .. } => "snapshot_unavailable",
            Self::Storage(_) => "storage",
            Self::HistoryCorrupted { .. } => "history_corrupted",
            Self::Configuration(_) => "configuration",
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidDefinition(_)
            | Self::DefinitionConflict { .. }
            | Self::UnsatisfiableStep { .. }
            | Self::Configuration(_) => ErrorCategory::Configuration,
            Self::DefinitionNotFound(_)
            | Self::DuplicateInFlight { .. }
            | Self::NoApplicableWorkflow { .. }
            | Self::NoEntryStep { .. }
            | Self::NoMatchingTransition { .. }
            | Self::InstanceNotFound { .. }
            | Self::NotInProgress { .. }
            | Self::NotAnApprover { .. }
            | Self::NotExpired { .. } => ErrorCategory::Request,
            Self::ConcurrentModification { .. } => ErrorCategory::Concurrency,
            Self::SnapshotUnavailable { .. } => ErrorCategory::Collaborator,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::HistoryCorrupted { .. } => ErrorCategory::Integrity,
        }
    }

    /// Whether the caller may retry the whole action with a fresh read.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::SnapshotUnavailable { .. } | Self::Storage(_)
        )
    }
}

fn summarize_issues(issues: &[ValidationIssue]) -> String {
    if issues.is_empty() {
        return "no issues reported".to_string();
    }
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.code, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_errors_match_taxonomy() {
        let conflict = EngineError::ConcurrentModification {
            instance_id: InstanceId::new(),
            attempts: 5,
        };
        assert!(conflict.is_retriable());
        assert_eq!(conflict.category(), ErrorCategory::Concurrency);

        let terminal = EngineError::NotInProgress {
            instance_id: InstanceId::new(),
            state: InstanceState::Approved,
        };
        assert!(!terminal.is_retriable());
        assert_eq!(terminal.code(), "not_in_progress");
        assert_eq!(terminal.category(), ErrorCategory::Request);
    }
}
