//! Events: the unit of data flow between nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Vector(_) => None,
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            Value::Scalar(v) => core::slice::from_ref(v),
            Value::Vector(v) => v,
        }
    }

    /// Edge weight application.
    pub fn scaled(&self, weight: f64) -> Value {
        match self {
            Value::Scalar(v) => Value::Scalar(v * weight),
            Value::Vector(v) => Value::Vector(v.iter().map(|x| x * weight).collect()),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Scalar(0.0)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

/// Per-event metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            MetaValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

pub type Meta = BTreeMap<String, MetaValue>;

/// (node id, port name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

/// An event addressed to an input port, as supplied by the ingestion layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub ts: u64,
    pub target: PortRef,
    pub idx: Vec<i64>,
    pub value: Value,
    pub meta: Meta,
}

impl Event {
    pub fn new(ts: u64, target: PortRef, value: impl Into<Value>) -> Self {
        Self {
            ts,
            target,
            idx: Vec::new(),
            value: value.into(),
            meta: Meta::new(),
        }
    }

    pub fn with_idx(mut self, idx: impl Into<Vec<i64>>) -> Self {
        self.idx = idx.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Canonical order key: timestamp, then index tuple (primary index first,
/// remaining lexicographically), then ingestion sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub ts: u64,
    pub idx: Vec<i64>,
    pub seq: u64,
}
