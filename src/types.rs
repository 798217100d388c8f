//! Core type definitions for the archival record graph

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Unique identifier for graph nodes (domains, intermediate and leaf nodes)
///
/// Opaque and immutable once assigned. Must not contain the path separator.
pub type NodeId = String;

/// Ancestor-depth map: every transitive ancestor mapped to its minimal distance
pub type AncestorDepths = BTreeMap<NodeId, u32>;

/// Parent link categories
///
/// Each category is stored separately on a node. Wherever both are consulted,
/// `Domain` is checked before `Structural`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParentLink {
    /// Link from a top-level node to its domain (root)
    Domain,
    /// Link from a node to an intermediate parent
    Structural,
}

impl ParentLink {
    /// Resolution order used by ancestor checks and path enumeration
    pub const ORDER: [ParentLink; 2] = [ParentLink::Domain, ParentLink::Structural];

    pub fn field_name(&self) -> &'static str {
        match self {
            ParentLink::Domain => "_dom",
            ParentLink::Structural => "_up",
        }
    }
}

/// Property values (heterogeneous types)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Properties map (node attributes)
pub type Properties = HashMap<String, PropertyValue>;

/// Build a properties map from key/value pairs
pub fn properties<K, V, I>(pairs: I) -> Properties
where
    K: Into<String>,
    V: Into<PropertyValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
