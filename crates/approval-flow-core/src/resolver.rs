use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::condition::{EntitySnapshot, FieldValue};
use crate::definition::{ApproverBracket, ApproverRule};
use crate::error::EngineError;

/// Role membership and reporting lines consulted by role and manager rules.
pub trait ApproverDirectory {
    fn role_members(&self, role: &str) -> Vec<String>;
    fn manager_of(&self, identity: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticDirectory {
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub managers: BTreeMap<String, String>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_role<I, S>(mut self, role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles
            .insert(role.into(), members.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_manager(mut self, identity: impl Into<String>, manager: impl Into<String>) -> Self {
        self.managers.insert(identity.into(), manager.into());
        self
    }

    /// # Errors
    /// Returns [`EngineError::Configuration`] when the document does not match
    /// `{ "roles": { role: [identity] }, "managers": { identity: manager } }`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, EngineError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            EngineError::Configuration(format!("invalid approver directory: {err}"))
        })
    }
}

impl ApproverDirectory for StaticDirectory {
    fn role_members(&self, role: &str) -> Vec<String> {
        self.roles.get(role).cloned().unwrap_or_default()
    }

    fn manager_of(&self, identity: &str) -> Option<String> {
        self.managers.get(identity).cloned()
    }
}

/// Inputs available to a rule at step entry.
pub struct ResolutionContext<'a> {
    pub snapshot: &'a EntitySnapshot,
    pub requester: &'a str,
    pub directory: &'a dyn ApproverDirectory,
}

/// One implementation per approver rule kind.
pub trait ResolveApprovers {
    fn resolve(&self, context: &ResolutionContext<'_>) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRule {
    pub user: String,
}

impl ResolveApprovers for UserRule {
    fn resolve(&self, _context: &ResolutionContext<'_>) -> Vec<String> {
        vec![self.user.clone()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleRule {
    pub role: String,
}

impl ResolveApprovers for RoleRule {
    fn resolve(&self, context: &ResolutionContext<'_>) -> Vec<String> {
        context.directory.role_members(self.role.trim())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequesterManagerRule {}

impl ResolveApprovers for RequesterManagerRule {
    fn resolve(&self, context: &ResolutionContext<'_>) -> Vec<String> {
        context
            .directory
            .manager_of(context.requester.trim())
            .into_iter()
            .collect()
    }
}

/// The approver identity is read from a text field of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotFieldRule {
    pub field: String,
}

impl ResolveApprovers for SnapshotFieldRule {
    fn resolve(&self, context: &ResolutionContext<'_>) -> Vec<String> {
        context
            .snapshot
            .get(&self.field)
            .and_then(FieldValue::as_text)
            .map(str::to_string)
            .into_iter()
            .collect()
    }
}

/// Picks the bracket with the highest `min_value` not above the numeric
/// field value. A missing or non-numeric field, or a value below every
/// bracket, resolves to nobody.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmountBracketRule {
    pub field: String,
    pub brackets: Vec<ApproverBracket>,
}

impl AmountBracketRule {
    #[must_use]
    pub fn bracket_for(&self, amount: f64) -> Option<&ApproverBracket> {
        self.brackets
            .iter()
            .filter(|bracket| bracket.min_value <= amount)
            .max_by(|lhs, rhs| lhs.min_value.total_cmp(&rhs.min_value))
    }
}

impl ResolveApprovers for AmountBracketRule {
    fn resolve(&self, context: &ResolutionContext<'_>) -> Vec<String> {
        let Some(amount) = context.snapshot.get(&self.field).and_then(FieldValue::as_number) else {
            return Vec::new();
        };
        let Some(bracket) = self.bracket_for(amount) else {
            return Vec::new();
        };

        let mut identities = bracket.users.clone();
        for role in &bracket.roles {
            identities.extend(context.directory.role_members(role.trim()));
        }
        identities
    }
}

impl ApproverRule {
    fn resolver(&self) -> &dyn ResolveApprovers {
        match self {
            Self::User(rule) => rule,
            Self::Role(rule) => rule,
            Self::RequesterManager(rule) => rule,
            Self::SnapshotField(rule) => rule,
            Self::AmountBracket(rule) => rule,
        }
    }
}

/// Concrete, deduplicated approver set for a rule at this moment.
#[must_use]
pub fn resolve_approvers(rule: &ApproverRule, context: &ResolutionContext<'_>) -> BTreeSet<String> {
    rule.resolver()
        .resolve(context)
        .into_iter()
        .map(|identity| identity.trim().to_string())
        .filter(|identity| !identity.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        StaticDirectory::new()
            .with_role("finance", ["fiona", "frank", " fiona "])
            .with_role("cfo", ["carla"])
            .with_manager("rita", "mark")
    }

    fn resolve(rule: &ApproverRule, snapshot: &EntitySnapshot, requester: &str) -> Vec<String> {
        let directory = directory();
        let context = ResolutionContext {
            snapshot,
            requester,
            directory: &directory,
        };
        resolve_approvers(rule, &context).into_iter().collect()
    }

    #[test]
    fn role_and_manager_rules_consult_directory() {
        let snapshot = EntitySnapshot::new();
        let role = ApproverRule::Role(RoleRule {
            role: "finance".to_string(),
        });
        assert_eq!(resolve(&role, &snapshot, "rita"), vec!["fiona", "frank"]);

        let manager = ApproverRule::RequesterManager(RequesterManagerRule {});
        assert_eq!(resolve(&manager, &snapshot, "rita"), vec!["mark"]);
        assert!(resolve(&manager, &snapshot, "nobody").is_empty());
    }

    #[test]
    fn snapshot_field_rule_reads_text_only() {
        let rule = ApproverRule::SnapshotField(SnapshotFieldRule {
            field: "owner".to_string(),
        });
        let named = EntitySnapshot::new().with("owner", "olga");
        let numeric = EntitySnapshot::new().with("owner", 7.0);
        assert_eq!(resolve(&rule, &named, "rita"), vec!["olga"]);
        assert!(resolve(&rule, &numeric, "rita").is_empty());
    }

    #[test]
    fn amount_bracket_picks_highest_threshold_reached() {
        let rule = ApproverRule::AmountBracket(AmountBracketRule {
            field: "total".to_string(),
            brackets: vec![
                ApproverBracket {
                    min_value: 10_000.0,
                    users: vec!["vp".to_string()],
                    roles: vec!["cfo".to_string()],
                },
                ApproverBracket {
                    min_value: 0.0,
                    users: vec!["lead".to_string()],
                    roles: Vec::new(),
                },
            ],
        });

        let small = EntitySnapshot::new().with("total", 250.0);
        let large = EntitySnapshot::new().with("total", 10_000.0);
        let negative = EntitySnapshot::new().with("total", -1.0);

        assert_eq!(resolve(&rule, &small, "rita"), vec!["lead"]);
        assert_eq!(resolve(&rule, &large, "rita"), vec!["carla", "vp"]);
        assert!(resolve(&rule, &negative, "rita").is_empty());
        assert!(resolve(&rule, &EntitySnapshot::new(), "rita").is_empty());
    }

    #[test]
    fn directory_parses_from_json() {
        let value = serde_json::json!({
            "roles": { "ops": ["otto"] },
            "managers": { "otto": "olivia" }
        });
        let parsed = match StaticDirectory::from_json(&value) {
            Ok(directory) => directory,
            Err(err) => panic!("directory must parse: {err}"),
        };
        assert_eq!(parsed.role_members("ops"), vec!["otto"]);
        assert_eq!(parsed.manager_of("otto").as_deref(), Some("olivia"));
        assert!(StaticDirectory::from_json(&serde_json::json!({"roles": 3})).is_err());
    }
}
