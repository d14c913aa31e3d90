use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::condition::Condition;
use crate::error::EngineError;
use crate::resolver::{
    AmountBracketRule, RequesterManagerRule, RoleRule, SnapshotFieldRule, UserRule,
};
use crate::DefinitionId;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VetoPolicy {
    #[default]
    AnyRejectionTerminates,
    MajorityRequired,
}

/// One `min_value` threshold of an amount bracket rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApproverBracket {
    pub min_value: f64,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverRule {
    User(UserRule),
    Role(RoleRule),
    RequesterManager(RequesterManagerRule),
    SnapshotField(SnapshotFieldRule),
    AmountBracket(AmountBracketRule),
}

impl ApproverRule {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Role(_) => "role",
            Self::RequesterManager(_) => "requester_manager",
            Self::SnapshotField(_) => "snapshot_field",
            Self::AmountBracket(_) => "amount_bracket",
        }
    }

    /// Largest approver set this rule can produce, when knowable without a directory.
    #[must_use]
    pub fn static_bound(&self) -> Option<usize> {
        match self {
            Self::User(_) | Self::RequesterManager(_) | Self::SnapshotField(_) => Some(1),
            Self::Role(_) => None,
            Self::AmountBracket(rule) => {
                if rule.brackets.iter().any(|bracket| !bracket.roles.is_empty()) {
                    return None;
                }
                rule.brackets
                    .iter()
                    .map(|bracket| distinct_count(&bracket.users))
                    .max()
            }
        }
    }
}

fn distinct_count(values: &[String]) -> usize {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect::<BTreeSet<_>>()
        .len()
}

fn default_quorum() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub sequence: u32,
    pub name: String,
    pub approver_rule: ApproverRule,
    #[serde(default = "default_quorum")]
    pub quorum: u32,
    #[serde(default)]
    pub veto_policy: VetoPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Edge of the step graph. `None` endpoints are the virtual start and
/// terminal ("approved") nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    #[serde(default)]
    pub from_step: Option<String>,
    #[serde(default)]
    pub to_step: Option<String>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub order: i32,
}

/// Authored form of a definition, before the store assigns identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefinitionDraft {
    pub code: String,
    pub version: u32,
    pub name: String,
    pub entity_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Serialize)]
struct HashedContent<'a> {
    code: &'a str,
    version: u32,
    name: &'a str,
    entity_type: &'a str,
    priority: i32,
    steps: &'a [Step],
    transitions: &'a [Transition],
}

impl DefinitionDraft {
    /// SHA-256 over the canonical JSON of everything except `active`.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] if the content cannot be serialized.
    pub fn content_hash(&self) -> Result<String, EngineError> {
        let content = HashedContent {
            code: &self.code,
            version: self.version,
            name: &self.name,
            entity_type: &self.entity_type,
            priority: self.priority,
            steps: &self.steps,
            transitions: &self.transitions,
        };
        let bytes = serde_json::to_vec(&content).map_err(|err| {
            EngineError::Configuration(format!("failed to serialize definition: {err}"))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Assigns a fresh id and hash. Does not validate.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] if hashing fails.
    pub fn into_definition(self, created_at: OffsetDateTime) -> Result<WorkflowDefinition, EngineError> {
        let content_hash = self.content_hash()?;
        Ok(WorkflowDefinition {
            id: DefinitionId::new(),
            code: self.code,
            version: self.version,
            name: self.name,
            entity_type: self.entity_type,
            active: self.active,
            priority: self.priority,
            steps: self.steps,
            transitions: self.transitions,
            content_hash,
            created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub code: String,
    pub version: u32,
    pub name: String,
    pub entity_type: String,
    pub active: bool,
    pub priority: i32,
    pub steps: Vec<Step>,
    pub transitions: Vec<Transition>,
    pub content_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    #[must_use]
    pub fn to_draft(&self) -> DefinitionDraft {
        DefinitionDraft {
            code: self.code.clone(),
            version: self.version,
            name: self.name.clone(),
            entity_type: self.entity_type.clone(),
            active: self.active,
            priority: self.priority,
            steps: self.steps.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn error(&mut self, code: &str, step_id: Option<&str>, message: String) {
        self.errors.push(ValidationIssue {
            code: code.to_string(),
            severity: IssueSeverity::Error,
            message,
            step_id: step_id.map(str::to_string),
        });
    }

    fn warning(&mut self, code: &str, step_id: Option<&str>, message: String) {
        self.warnings.push(ValidationIssue {
            code: code.to_string(),
            severity: IssueSeverity::Warning,
            message,
            step_id: step_id.map(str::to_string),
        });
    }

    #[must_use]
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }

    #[must_use]
    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|issue| issue.code == code)
    }

    /// # Errors
    /// Returns [`EngineError::InvalidDefinition`] carrying every error issue.
    pub fn into_result(self) -> Result<Vec<ValidationIssue>, EngineError> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(EngineError::InvalidDefinition(self.errors))
        }
    }
}

/// Structural checks a definition must pass before it can be registered.
#[must_use]
pub fn validate_definition(draft: &DefinitionDraft) -> ValidationResult {
    let mut result = ValidationResult::default();

    for (field, value) in [
        ("code", &draft.code),
        ("name", &draft.name),
        ("entity_type", &draft.entity_type),
    ] {
        if value.trim().is_empty() {
            result.error("empty_field", None, format!("{field} MUST be non-empty"));
        }
    }
    if draft.version == 0 {
        result.error("invalid_version", None, "version MUST be >= 1".to_string());
    }
    if draft.steps.is_empty() {
        result.error("no_steps", None, "definition has no steps".to_string());
    }

    let mut step_ids = BTreeSet::new();
    for step in &draft.steps {
        if step.id.trim().is_empty() {
            result.error("empty_field", None, "step id MUST be non-empty".to_string());
            continue;
        }
        if !step_ids.insert(step.id.as_str()) {
            result.error(
                "duplicate_step",
                Some(&step.id),
                format!("duplicate step id: {}", step.id),
            );
        }
        validate_step(step, &mut result);
    }

    let mut references_ok = true;
    for transition in &draft.transitions {
        for endpoint in [&transition.from_step, &transition.to_step].into_iter().flatten() {
            if !step_ids.contains(endpoint.as_str()) {
                references_ok = false;
                result.error(
                    "unknown_step",
                    Some(endpoint),
                    format!("transition references unknown step {endpoint}"),
                );
            }
        }
        for predicate in &transition.condition.all {
            if !predicate.is_well_formed() {
                result.error(
                    "malformed_predicate",
                    transition.from_step.as_deref(),
                    format!(
                        "predicate on field '{}' has a value shape that does not fit operator {:?}",
                        predicate.field, predicate.op
                    ),
                );
            }
        }
    }

    if references_ok && !step_ids.is_empty() {
        check_graph(draft, &step_ids, &mut result);
    }
    check_fallbacks(draft, &step_ids, &mut result);

    result.valid = result.errors.is_empty();
    result
}

fn validate_step(step: &Step, result: &mut ValidationResult) {
    let step_id = Some(step.id.as_str());
    if step.name.trim().is_empty() {
        result.error("empty_field", step_id, format!("step {} has an empty name", step.id));
    }
    if step.quorum == 0 {
        result.error(
            "invalid_quorum",
            step_id,
            format!("step {} quorum MUST be >= 1", step.id),
        );
    }
    if step.timeout_secs == Some(0) {
        result.error(
            "invalid_timeout",
            step_id,
            format!("step {} timeout_secs MUST be >= 1", step.id),
        );
    }

    if let Some(message) = rule_payload_problem(&step.approver_rule) {
        result.error("invalid_approver_rule", step_id, format!("step {}: {message}", step.id));
        return;
    }

    let quorum = usize::try_from(step.quorum).unwrap_or(usize::MAX);
    match step.approver_rule.static_bound() {
        Some(bound) if quorum > bound => result.error(
            "quorum_exceeds_approvers",
            step_id,
            format!(
                "step {} requires {} approvals but its {} rule yields at most {bound}",
                step.id,
                step.quorum,
                step.approver_rule.kind()
            ),
        ),
        None if quorum > 1 => result.warning(
            "quorum_unverifiable",
            step_id,
            format!(
                "step {} quorum {} depends on directory contents at runtime",
                step.id, step.quorum
            ),
        ),
        _ => {}
    }

    if let ApproverRule::AmountBracket(rule) = &step.approver_rule {
        for bracket in &rule.brackets {
            if bracket.roles.is_empty() && distinct_count(&bracket.users) < quorum {
                result.warning(
                    "bracket_below_quorum",
                    step_id,
                    format!(
                        "bracket min_value {} of step {} lists fewer users than quorum {}",
                        bracket.min_value, step.id, step.quorum
                    ),
                );
            }
        }
    }
}

fn rule_payload_problem(rule: &ApproverRule) -> Option<String> {
    match rule {
        ApproverRule::User(rule) if rule.user.trim().is_empty() => {
            Some("user rule has an empty user".to_string())
        }
        ApproverRule::Role(rule) if rule.role.trim().is_empty() => {
            Some("role rule has an empty role".to_string())
        }
        ApproverRule::SnapshotField(rule) if rule.field.trim().is_empty() => {
            Some("snapshot_field rule has an empty field".to_string())
        }
        ApproverRule::AmountBracket(rule) => {
            if rule.field.trim().is_empty() {
                return Some("amount_bracket rule has an empty field".to_string());
            }
            if rule.brackets.is_empty() {
                return Some("amount_bracket rule has no brackets".to_string());
            }
            let mut seen = Vec::<f64>::new();
            for bracket in &rule.brackets {
                if !bracket.min_value.is_finite() {
                    return Some("bracket min_value MUST be finite".to_string());
                }
                if seen.iter().any(|value| (value - bracket.min_value).abs() < f64::EPSILON) {
                    return Some(format!("duplicate bracket min_value {}", bracket.min_value));
                }
                seen.push(bracket.min_value);
                if distinct_count(&bracket.users) == 0 && distinct_count(&bracket.roles) == 0 {
                    return Some(format!(
                        "bracket min_value {} names no users or roles",
                        bracket.min_value
                    ));
                }
            }
            None
        }
        _ => None,
    }
}

fn check_graph(draft: &DefinitionDraft, step_ids: &BTreeSet<&str>, result: &mut ValidationResult) {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> =
        step_ids.iter().map(|id| (*id, BTreeSet::new())).collect();
    for transition in &draft.transitions {
        if let (Some(from), Some(to)) = (&transition.from_step, &transition.to_step) {
            if let Some(preds) = remaining.get_mut(to.as_str()) {
                preds.insert(from.as_str());
            }
        }
    }

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, preds)| preds.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            remaining.remove(id);
            for preds in remaining.values_mut() {
                preds.remove(id);
            }
        }
    }

    if !remaining.is_empty() {
        let ids: Vec<&str> = remaining.keys().copied().collect();
        result.error(
            "cycle",
            None,
            format!("step graph has a cycle among: {}", ids.join(", ")),
        );
    }

    let mut reached = BTreeSet::new();
    let mut queue = VecDeque::from([None::<&str>]);
    while let Some(node) = queue.pop_front() {
        for transition in &draft.transitions {
            if transition.from_step.as_deref() != node {
                continue;
            }
            if let Some(to) = transition.to_step.as_deref() {
                if reached.insert(to) {
                    queue.push_back(Some(to));
                }
            }
        }
    }
    for id in step_ids {
        if !reached.contains(id) {
            result.error(
                "unreachable_step",
                Some(id),
                format!("step {id} is not reachable from the start node"),
            );
        }
    }
}

fn check_fallbacks(draft: &DefinitionDraft, step_ids: &BTreeSet<&str>, result: &mut ValidationResult) {
    let mut sources: Vec<Option<&str>> = vec![None];
    sources.extend(step_ids.iter().map(|id| Some(*id)));

    for source in sources {
        let mut outgoing = draft
            .transitions
            .iter()
            .enumerate()
            .filter(|(_, transition)| transition.from_step.as_deref() == source)
            .collect::<Vec<_>>();
        outgoing.sort_by_key(|(position, transition)| (transition.order, *position));

        let fallback = outgoing
            .iter()
            .position(|(_, transition)| transition.condition.is_unconditional());
        match (fallback, source) {
            (None, None) => result.error(
                "missing_start_fallback",
                None,
                "no unconditional transition out of the start node".to_string(),
            ),
            (None, Some(id)) => result.error(
                "missing_fallback",
                Some(id),
                format!("step {id} has no unconditional fallback transition"),
            ),
            (Some(index), _) => {
                for (_, shadowed) in outgoing.iter().skip(index + 1) {
                    result.warning(
                        "shadowed_transition",
                        source,
                        format!(
                            "transition to {} (order {}) can never fire after an earlier fallback",
                            shadowed.to_step.as_deref().unwrap_or("<approved>"),
                            shadowed.order
                        ),
                    );
                }
            }
        }
    }
}

/// Canonical ordering: steps by `(sequence, id)`, transitions stably by
/// `(from_step, order)` so declaration order still breaks ties.
pub fn normalize_definition(draft: &mut DefinitionDraft) {
    draft.code = draft.code.trim().to_string();
    draft.name = draft.name.trim().to_string();
    draft.entity_type = draft.entity_type.trim().to_string();

    for step in &mut draft.steps {
        step.id = step.id.trim().to_string();
    }
    draft
        .steps
        .sort_by(|lhs, rhs| lhs.sequence.cmp(&rhs.sequence).then_with(|| lhs.id.cmp(&rhs.id)));

    for transition in &mut draft.transitions {
        transition.from_step = transition.from_step.take().map(|id| id.trim().to_string());
        transition.to_step = transition.to_step.take().map(|id| id.trim().to_string());
    }
    draft
        .transitions
        .sort_by(|lhs, rhs| lhs.from_step.cmp(&rhs.from_step).then(lhs.order.cmp(&rhs.order)));
}

/// Active definition for `entity_type` with the lowest priority, then the
/// highest version, then the lowest id.
#[must_use]
pub fn select_applicable<'a>(
    definitions: &'a [WorkflowDefinition],
    entity_type: &str,
) -> Option<&'a WorkflowDefinition> {
    definitions
        .iter()
        .filter(|definition| definition.active && definition.entity_type == entity_type)
        .min_by_key(|definition| (definition.priority, Reverse(definition.version), definition.id))
}

/// Parse and normalize a YAML definition document without validating it.
///
/// # Errors
/// Returns [`EngineError::Configuration`] on malformed YAML.
pub fn parse_definition_yaml(yaml: &str) -> Result<DefinitionDraft, EngineError> {
    let mut draft: DefinitionDraft = serde_yaml::from_str(yaml).map_err(|err| {
        EngineError::Configuration(format!("invalid workflow definition YAML: {err}"))
    })?;
    normalize_definition(&mut draft);
    Ok(draft)
}

/// Parse, normalize and validate a YAML definition document.
///
/// # Errors
/// Returns [`EngineError::Configuration`] on malformed YAML and
/// [`EngineError::InvalidDefinition`] when validation reports errors.
pub fn load_definition_yaml(yaml: &str) -> Result<DefinitionDraft, EngineError> {
    let draft = parse_definition_yaml(yaml)?;
    validate_definition(&draft).into_result()?;
    Ok(draft)
}

/// # Errors
/// Returns [`EngineError::Configuration`] when the file cannot be read, plus
/// every error of [`load_definition_yaml`].
pub fn load_definition_from_path(path: &Path) -> Result<DefinitionDraft, EngineError> {
    let content = fs::read_to_string(path).map_err(|err| {
        EngineError::Configuration(format!("failed to read {}: {err}", path.display()))
    })?;
    load_definition_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{FieldValue, Operator, Predicate, PredicateValue};
    use proptest::prelude::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn user_step(id: &str, user: &str) -> Step {
        Step {
            id: id.to_string(),
            sequence: 0,
            name: id.to_string(),
            approver_rule: ApproverRule::User(UserRule {
                user: user.to_string(),
            }),
            quorum: 1,
            veto_policy: VetoPolicy::AnyRejectionTerminates,
            timeout_secs: None,
        }
    }

    fn edge(from: Option<&str>, to: Option<&str>) -> Transition {
        Transition {
            from_step: from.map(str::to_string),
            to_step: to.map(str::to_string),
            condition: Condition::always(),
            order: 0,
        }
    }

    fn draft(steps: Vec<Step>, transitions: Vec<Transition>) -> DefinitionDraft {
        DefinitionDraft {
            code: "po".to_string(),
            version: 1,
            name: "Purchase orders".to_string(),
            entity_type: "purchase_order".to_string(),
            active: true,
            priority: 0,
            steps,
            transitions,
        }
    }

    const TWO_STEP_YAML: &str = r"
code: po-approval
version: 2
name: Purchase order approval
entity_type: purchase_order
priority: 10
steps:
  - id: finance
    sequence: 2
    name: Finance sign-off
    approver_rule:
      kind: role
      role: finance
    quorum: 2
    veto_policy: majority_required
    timeout_secs: 86400
  - id: manager
    sequence: 1
    name: Manager review
    approver_rule:
      kind: requester_manager
transitions:
  - from_step: manager
    to_step: finance
    order: 0
    condition:
      - field: amount
        op: gt
        value: 10000
  - from_step: manager
    order: 1
  - to_step: manager
  - from_step: finance
";

    #[test]
    fn yaml_definition_loads_and_normalizes() {
        let loaded = must(load_definition_yaml(TWO_STEP_YAML));
        assert_eq!(loaded.steps[0].id, "manager");
        assert_eq!(loaded.steps[1].veto_policy, VetoPolicy::MajorityRequired);
        assert_eq!(loaded.steps[1].timeout_secs, Some(86_400));
        assert!(loaded.transitions[0].from_step.is_none());
        assert!(matches!(
            loaded.transitions[2].condition.all[0].value,
            PredicateValue::Scalar(FieldValue::Number(_))
        ));

        let result = validate_definition(&loaded);
        assert!(result.valid);
        assert!(result.has_warning("quorum_unverifiable"));
    }

    #[test]
    fn content_hash_ignores_active_flag() {
        let first = must(load_definition_yaml(TWO_STEP_YAML));
        let mut second = first.clone();
        second.active = false;
        assert_eq!(must(first.content_hash()), must(second.content_hash()));
        second.priority = 11;
        assert_ne!(must(first.content_hash()), must(second.content_hash()));
    }

    #[test]
    fn cycle_and_unreachable_steps_are_rejected() {
        let cyclic = draft(
            vec![user_step("a", "alice"), user_step("b", "bob")],
            vec![
                edge(None, Some("a")),
                edge(Some("a"), Some("b")),
                edge(Some("b"), Some("a")),
            ],
        );
        let result = validate_definition(&cyclic);
        assert!(!result.valid);
        assert!(result.has_error("cycle"));

        let orphan = draft(
            vec![user_step("a", "alice"), user_step("b", "bob")],
            vec![edge(None, Some("a")), edge(Some("a"), None), edge(Some("b"), None)],
        );
        let result = validate_definition(&orphan);
        assert!(result.has_error("unreachable_step"));
        assert!(result
            .errors
            .iter()
            .any(|issue| issue.step_id.as_deref() == Some("b")));
    }

    #[test]
    fn missing_fallbacks_are_rejected() {
        let conditional = Transition {
            condition: Condition {
                all: vec![Predicate {
                    field: "amount".to_string(),
                    op: Operator::Gt,
                    value: PredicateValue::Scalar(FieldValue::Number(5.0)),
                }],
            },
            ..edge(Some("a"), None)
        };
        let result = validate_definition(&draft(
            vec![user_step("a", "alice")],
            vec![edge(None, Some("a")), conditional],
        ));
        assert!(result.has_error("missing_fallback"));

        let result = validate_definition(&draft(vec![user_step("a", "alice")], vec![edge(Some("a"), None)]));
        assert!(result.has_error("missing_start_fallback"));
        assert!(result.has_error("unreachable_step"));
    }

    #[test]
    fn quorum_above_static_bound_is_an_error() {
        let mut step = user_step("a", "alice");
        step.quorum = 2;
        let result = validate_definition(&draft(
            vec![step],
            vec![edge(None, Some("a")), edge(Some("a"), None)],
        ));
        assert!(result.has_error("quorum_exceeds_approvers"));
    }

    #[test]
    fn shadowed_transitions_warn_and_unknown_steps_fail() {
        let result = validate_definition(&draft(
            vec![user_step("a", "alice")],
            vec![
                edge(None, Some("a")),
                edge(Some("a"), None),
                Transition {
                    order: 5,
                    ..edge(Some("a"), Some("ghost"))
                },
            ],
        ));
        assert!(result.has_error("unknown_step"));

        let result = validate_definition(&draft(
            vec![user_step("a", "alice")],
            vec![
                edge(None, Some("a")),
                edge(Some("a"), None),
                Transition {
                    order: 5,
                    ..edge(Some("a"), None)
                },
            ],
        ));
        assert!(result.valid);
        assert!(result.has_warning("shadowed_transition"));
    }

    #[test]
    fn applicable_definition_prefers_low_priority_then_high_version() {
        let now = crate::now_utc();
        let base = draft(vec![user_step("a", "alice")], vec![edge(None, Some("a")), edge(Some("a"), None)]);
        let low = must(DefinitionDraft { priority: 1, ..base.clone() }.into_definition(now));
        let newer = must(DefinitionDraft { priority: 1, version: 3, ..base.clone() }.into_definition(now));
        let preferred = must(DefinitionDraft { priority: 0, ..base.clone() }.into_definition(now));
        let inactive = must(DefinitionDraft { priority: -5, active: false, ..base }.into_definition(now));

        let all = vec![low.clone(), newer.clone(), preferred.clone(), inactive];
        assert_eq!(select_applicable(&all, "purchase_order").map(|d| d.id), Some(preferred.id));

        let without_preferred = vec![low, newer.clone()];
        assert_eq!(
            select_applicable(&without_preferred, "purchase_order").map(|d| d.id),
            Some(newer.id)
        );
        assert!(select_applicable(&all, "expense").is_none());
    }

    #[test]
    fn malformed_yaml_is_a_configuration_error() {
        let err = load_definition_yaml("code: [unterminated");
        assert!(matches!(err, Err(EngineError::Configuration(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn linear_chains_always_validate(len in 1usize..8, order in 0i32..4) {
            let steps: Vec<Step> = (0..len).map(|i| user_step(&format!("s{i}"), &format!("user{i}"))).collect();
            let mut transitions = vec![edge(None, Some("s0"))];
            for i in 0..len {
                let next = if i + 1 < len { Some(format!("s{}", i + 1)) } else { None };
                transitions.push(Transition {
                    order,
                    ..edge(Some(&format!("s{i}")), next.as_deref())
                });
            }
            let result = validate_definition(&draft(steps, transitions));
            prop_assert!(result.valid, "{:?}", result.errors);
        }

        #[test]
        fn back_edges_always_fail(len in 2usize..8, back in 0usize..8) {
            let steps: Vec<Step> = (0..len).map(|i| user_step(&format!("s{i}"), "alice")).collect();
            let mut transitions = vec![edge(None, Some("s0"))];
            for i in 0..len {
                let next = if i + 1 < len { Some(format!("s{}", i + 1)) } else { None };
                transitions.push(edge(Some(&format!("s{i}")), next.as_deref()));
            }
            let target = back % len;
            transitions.push(Transition {
                order: 1,
                ..edge(Some(&format!("s{}", len - 1)), Some(&format!("s{target}")))
            });
            let result = validate_definition(&draft(steps, transitions));
            prop_assert!(result.has_error("cycle"));
        }
    }
}
