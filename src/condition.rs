//! Backend-neutral filter conditions
//!
//! The query compiler emits one condition per backend a stage supports. Both
//! the node store and the search index evaluate them over node properties.

use crate::types::{Properties, PropertyValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    MatchAll,
    Equal(String, PropertyValue),
    NotEqual(String, PropertyValue),
    LessThan(String, PropertyValue),
    LessThanEq(String, PropertyValue),
    GreaterThan(String, PropertyValue),
    GreaterThanEq(String, PropertyValue),
    In(String, Vec<PropertyValue>),
    Exists(String),
    Prefix(String, String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Condition::Equal(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Condition::GreaterThan(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Condition::LessThan(field.into(), value.into())
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::MatchAll => other,
            Condition::And(mut parts) => {
                parts.push(other);
                Condition::And(parts)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    /// Evaluate against a node's properties
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Condition::MatchAll => true,
            Condition::Equal(field, value) => props
                .get(field)
                .map(|v| values_equal(v, value))
                .unwrap_or(matches!(value, PropertyValue::Null)),
            Condition::NotEqual(field, value) => !props
                .get(field)
                .map(|v| values_equal(v, value))
                .unwrap_or(matches!(value, PropertyValue::Null)),
            Condition::LessThan(field, value) => {
                compare_field(props, field, value) == Some(Ordering::Less)
            }
            Condition::LessThanEq(field, value) => matches!(
                compare_field(props, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::GreaterThan(field, value) => {
                compare_field(props, field, value) == Some(Ordering::Greater)
            }
            Condition::GreaterThanEq(field, value) => matches!(
                compare_field(props, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::In(field, values) => props
                .get(field)
                .map(|v| values.iter().any(|candidate| values_equal(v, candidate)))
                .unwrap_or(false),
            Condition::Exists(field) => props.contains_key(field),
            Condition::Prefix(field, prefix) => props
                .get(field)
                .and_then(|v| v.as_str())
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            Condition::And(parts) => parts.iter().all(|c| c.matches(props)),
            Condition::Or(parts) => parts.iter().any(|c| c.matches(props)),
            Condition::Not(inner) => !inner.matches(props),
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::MatchAll
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::MatchAll => write!(f, "*"),
            Condition::Equal(k, v) => write!(f, "{} = {}", k, v),
            Condition::NotEqual(k, v) => write!(f, "{} != {}", k, v),
            Condition::LessThan(k, v) => write!(f, "{} < {}", k, v),
            Condition::LessThanEq(k, v) => write!(f, "{} <= {}", k, v),
            Condition::GreaterThan(k, v) => write!(f, "{} > {}", k, v),
            Condition::GreaterThanEq(k, v) => write!(f, "{} >= {}", k, v),
            Condition::In(k, values) => {
                write!(f, "{} IN [", k)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Condition::Exists(k) => write!(f, "EXISTS {}", k),
            Condition::Prefix(k, p) => write!(f, "{} STARTS WITH \"{}\"", k, p),
            Condition::And(parts) => write_joined(f, parts, " AND "),
            Condition::Or(parts) => write_joined(f, parts, " OR "),
            Condition::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", part)?;
    }
    write!(f, ")")
}

fn compare_field(props: &Properties, field: &str, value: &PropertyValue) -> Option<Ordering> {
    props.get(field).and_then(|v| compare_values(v, value))
}

fn compare_values(a: &PropertyValue, b: &PropertyValue) -> Option<Ordering> {
    match (a, b) {
        (PropertyValue::Int(a), PropertyValue::Int(b)) => Some(a.cmp(b)),
        (PropertyValue::Float(a), PropertyValue::Float(b)) => a.partial_cmp(b),
        (PropertyValue::Int(a), PropertyValue::Float(b)) => (*a as f64).partial_cmp(b),
        (PropertyValue::Float(a), PropertyValue::Int(b)) => a.partial_cmp(&(*b as f64)),
        (PropertyValue::String(a), PropertyValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    match (a, b) {
        (PropertyValue::Null, PropertyValue::Null) => true,
        (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a == b,
        (PropertyValue::Int(a), PropertyValue::Int(b)) => a == b,
        (PropertyValue::Float(a), PropertyValue::Float(b)) => (a - b).abs() < f64::EPSILON,
        (PropertyValue::Int(a), PropertyValue::Float(b))
        | (PropertyValue::Float(b), PropertyValue::Int(a)) => (*a as f64 - b).abs() < f64::EPSILON,
        (PropertyValue::String(a), PropertyValue::String(b)) => a == b,
        _ => false,
    }
}
