//! Field-path predicates over stored documents.
//!
//! Predicates speak the same `/`-delimited camelCase path vocabulary as the
//! document mapper. The evaluator here is the reference implementation;
//! providers may translate predicates into a native query form, but must
//! agree with it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateOp {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

/// One comparison against a document field path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPredicate {
    pub path: String,
    pub op: PredicateOp,
    pub value: Value,
}

impl FieldPredicate {
    pub fn matches(&self, document: &Value) -> bool {
        let actual = lookup(document, &self.path);
        match self.op {
            PredicateOp::Equals => actual == Some(&self.value),
            PredicateOp::NotEquals => actual != Some(&self.value),
            PredicateOp::Contains => match (actual, &self.value) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            PredicateOp::GreaterThan => {
                compare(actual, &self.value) == Some(Ordering::Greater)
            }
            PredicateOp::LessThan => compare(actual, &self.value) == Some(Ordering::Less),
        }
    }
}

/// Conjunction of field predicates; empty matches every document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Predicate {
    pub clauses: Vec<FieldPredicate>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, op: PredicateOp, value: Value) -> Self {
        self.clauses.push(FieldPredicate {
            path: path.into(),
            op,
            value,
        });
        self
    }

    /// Single-clause equality predicate.
    pub fn equals(path: impl Into<String>, value: Value) -> Self {
        Self::new().with(path, PredicateOp::Equals, value)
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.clauses.iter().all(|clause| clause.matches(document))
    }
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('/') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}
