//! Query filter clauses.

use crate::object::RemoteObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A filter predicate over remote object fields.
///
/// Clauses form a tree. The sync engine builds
/// `base AND (_modified > biggest_remote_time)`; the base is whatever the
/// embedding application supplies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Clause {
    /// Matches every object.
    All,
    /// Field equals value.
    Eq {
        /// Field name.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Field is greater than value.
    GreaterThan {
        /// Field name.
        field: String,
        /// Lower bound.
        value: Value,
        /// Whether the bound itself matches.
        inclusive: bool,
    },
    /// Field is less than value.
    LessThan {
        /// Field name.
        field: String,
        /// Upper bound.
        value: Value,
        /// Whether the bound itself matches.
        inclusive: bool,
    },
    /// Every child clause matches.
    And {
        /// Child clauses.
        clauses: Vec<Clause>,
    },
    /// At least one child clause matches.
    Or {
        /// Child clauses.
        clauses: Vec<Clause>,
    },
    /// The child clause does not match.
    Not {
        /// Negated clause.
        clause: Box<Clause>,
    },
}

impl Clause {
    /// Creates an equality clause.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Clause::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates an exclusive lower-bound clause.
    pub fn greater_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Clause::GreaterThan {
            field: field.into(),
            value: value.into(),
            inclusive: false,
        }
    }

    /// Creates an exclusive upper-bound clause.
    pub fn less_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Clause::LessThan {
            field: field.into(),
            value: value.into(),
            inclusive: false,
        }
    }

    /// Conjunction of two clauses. Nested conjunctions are flattened.
    pub fn and(left: Clause, right: Clause) -> Self {
        let mut clauses = Vec::new();
        for clause in [left, right] {
            match clause {
                Clause::And { clauses: inner } => clauses.extend(inner),
                Clause::All => {}
                other => clauses.push(other),
            }
        }
        match clauses.len() {
            0 => Clause::All,
            1 => clauses.remove(0),
            _ => Clause::And { clauses },
        }
    }

    /// Disjunction of two clauses.
    pub fn or(left: Clause, right: Clause) -> Self {
        Clause::Or {
            clauses: vec![left, right],
        }
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: Clause) -> Self {
        Clause::Not {
            clause: Box::new(clause),
        }
    }

    /// Evaluates this clause against an object.
    ///
    /// A missing field never satisfies a comparison. Values of different
    /// JSON kinds are never ordered against each other.
    pub fn matches(&self, object: &RemoteObject) -> bool {
        match self {
            Clause::All => true,
            Clause::Eq { field, value } => object
                .get(field)
                .is_some_and(|actual| compare_values(&actual, value) == Some(Ordering::Equal)),
            Clause::GreaterThan {
                field,
                value,
                inclusive,
            } => match object.get(field).and_then(|a| compare_values(&a, value)) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => *inclusive,
                _ => false,
            },
            Clause::LessThan {
                field,
                value,
                inclusive,
            } => match object.get(field).and_then(|a| compare_values(&a, value)) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => *inclusive,
                _ => false,
            },
            Clause::And { clauses } => clauses.iter().all(|c| c.matches(object)),
            Clause::Or { clauses } => clauses.iter().any(|c| c.matches(object)),
            Clause::Not { clause } => !clause.matches(object),
        }
    }
}

/// Orders two JSON scalars of the same kind.
///
/// Integers compare exactly; other numbers fall back to `f64`. Arrays and
/// objects are only comparable for equality.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}
