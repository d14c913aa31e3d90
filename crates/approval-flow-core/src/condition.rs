use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::Transition;

/// A scalar value carried by an entity snapshot or a predicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Ordering between two values of the same kind; `None` on a kind mismatch.
    fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(left), Self::Bool(right)) => Some(left.cmp(right)),
            (Self::Number(left), Self::Number(right)) => left.partial_cmp(right),
            (Self::Text(left), Self::Text(right)) => Some(left.cmp(right)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Point-in-time capture of the fields of a business record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EntitySnapshot {
    pub fields: BTreeMap<String, FieldValue>,
}

impl EntitySnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

impl Operator {
    #[must_use]
    pub fn expects_list(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PredicateValue {
    List(Vec<FieldValue>),
    Scalar(FieldValue),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: Operator,
    pub value: PredicateValue,
}

impl Predicate {
    /// A missing field never satisfies a predicate. Values of different
    /// kinds are unequal, so only `ne` and `not_in` hold across kinds.
    #[must_use]
    pub fn evaluate(&self, snapshot: &EntitySnapshot) -> bool {
        let Some(actual) = snapshot.get(&self.field) else {
            return false;
        };

        match (&self.op, &self.value) {
            (Operator::In, PredicateValue::List(items)) => {
                items.iter().any(|item| actual.compare(item) == Some(Ordering::Equal))
            }
            (Operator::NotIn, PredicateValue::List(items)) => {
                items.iter().all(|item| actual.compare(item) != Some(Ordering::Equal))
            }
            (Operator::In | Operator::NotIn, PredicateValue::Scalar(_))
            | (_, PredicateValue::List(_)) => false,
            (op, PredicateValue::Scalar(expected)) => {
                let ordering = actual.compare(expected);
                match op {
                    Operator::Eq => ordering == Some(Ordering::Equal),
                    Operator::Ne => ordering != Some(Ordering::Equal),
                    Operator::Gt => ordering == Some(Ordering::Greater),
                    Operator::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    Operator::Lt => ordering == Some(Ordering::Less),
                    Operator::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    Operator::In | Operator::NotIn => false,
                }
            }
        }
    }

    /// Whether the value shape fits the operator.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        if self.field.trim().is_empty() {
            return false;
        }
        match (&self.value, self.op.expects_list()) {
            (PredicateValue::List(items), true) => !items.is_empty(),
            (PredicateValue::Scalar(_), false) => true,
            _ => false,
        }
    }
}

/// Conjunction of predicates; the empty condition always holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Condition {
    pub all: Vec<Predicate>,
}

impl Condition {
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_unconditional(&self) -> bool {
        self.all.is_empty()
    }

    #[must_use]
    pub fn evaluate(&self, snapshot: &EntitySnapshot) -> bool {
        self.all.iter().all(|predicate| predicate.evaluate(snapshot))
    }
}

/// Picks the first transition out of `from` whose condition holds, ordered by
/// `order` and then by declaration position.
#[must_use]
pub fn select_transition<'a>(
    transitions: &'a [Transition],
    from: Option<&str>,
    snapshot: &EntitySnapshot,
) -> Option<&'a Transition> {
    let mut candidates = transitions
        .iter()
        .enumerate()
        .filter(|(_, transition)| transition.from_step.as_deref() == from)
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(position, transition)| (transition.order, *position));
    candidates
        .into_iter()
        .map(|(_, transition)| transition)
        .find(|transition| transition.condition.evaluate(snapshot))
}
