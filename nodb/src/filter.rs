use crate::document::{Document, DELETED_FIELD};
use crate::error::{NodbError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// What a single filter entry requires of a document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The field exists and is strictly equal to the value.
    Equals(Value),
    /// The field does not exist on the document.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every listed field satisfies its condition.
    Normal,
    /// The complement of `Normal`.
    Inverted,
}

/// A flat map of field conditions. Fields not listed are unconstrained,
/// so an empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from a JSON object of `field: value` pairs.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Null => Ok(Filter::new()),
            other => Err(NodbError::InvalidFilter(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .insert(field.into(), Condition::Equals(value.into()));
        self
    }

    pub fn absent(mut self, field: impl Into<String>) -> Self {
        self.conditions.insert(field.into(), Condition::Absent);
        self
    }

    /// This filter plus the requirement that the document is not
    /// tombstoned. Overrides any condition the caller put on `__deleted`.
    pub fn excluding_deleted(&self) -> Self {
        self.clone().absent(DELETED_FIELD)
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether every condition holds for `doc`.
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| match (condition, doc.get(field)) {
                (Condition::Absent, found) => found.is_none(),
                (Condition::Equals(_), None) => false,
                (Condition::Equals(expected), Some(actual)) => {
                    strict_eq(expected, actual.as_ref())
                }
            })
    }

    pub fn predicate(&self, mode: Mode) -> impl Fn(&Document) -> bool + '_ {
        move |doc: &Document| match mode {
            Mode::Normal => self.matches(doc),
            Mode::Inverted => !self.matches(doc),
        }
    }
}

impl FromIterator<(String, Value)> for Filter {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Filter {
            conditions: iter
                .into_iter()
                .map(|(k, v)| (k, Condition::Equals(v)))
                .collect(),
        }
    }
}

/// Strict equality: scalars by value, numbers by numeric value. Arrays and
/// objects are never equal to one another.
fn strict_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => false,
    }
}
