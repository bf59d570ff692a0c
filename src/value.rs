//! Values observed on OPC UA nodes
//!
//! `Value` is a closed set of variants; every OPC UA built-in type maps onto
//! one of them, and anything that cannot is carried as `Unsupported` so the
//! translator can report it instead of guessing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::source::NodeId;

/// Typed node value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Named fields; arrays use positional keys ("0", "1", ...)
    Structured(BTreeMap<String, Value>),
    /// A source value with no lossless representation here
    Unsupported { type_name: String, detail: String },
}

impl Value {
    /// Type tag carried in the payload document
    pub fn type_name(&self) -> &str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Structured(_) => "structured",
            Value::Unsupported { type_name, .. } => type_name,
        }
    }

    /// Builds a structured value from an array of elements
    pub fn from_elements(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Structured(
            elements
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        )
    }
}

/// Coarse OPC UA status severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityLevel {
    Good,
    Uncertain,
    Bad,
}

impl QualityLevel {
    /// Severity from the top two bits of an OPC UA status code
    pub fn from_status_code(code: u32) -> Self {
        match code >> 30 {
            0 => QualityLevel::Good,
            1 => QualityLevel::Uncertain,
            _ => QualityLevel::Bad,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Good => "Good",
            QualityLevel::Uncertain => "Uncertain",
            QualityLevel::Bad => "Bad",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality attached to a value change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quality {
    pub level: QualityLevel,
    /// Raw OPC UA status code
    pub code: u32,
    /// Symbolic status name when known
    pub reason: Option<String>,
}

impl Quality {
    pub fn good() -> Self {
        Self {
            level: QualityLevel::Good,
            code: 0,
            reason: None,
        }
    }

    pub fn from_status_code(code: u32, reason: Option<String>) -> Self {
        Self {
            level: QualityLevel::from_status_code(code),
            code,
            reason,
        }
    }
}

/// One monitored-item notification
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChangeEvent {
    pub node_id: NodeId,
    pub value: Value,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub quality: Quality,
}

impl ValueChangeEvent {
    /// Whether `other` carries the same observation (value, quality, source time)
    pub fn same_observation(&self, other: &ValueChangeEvent) -> bool {
        self.node_id == other.node_id
            && self.value == other.value
            && self.quality == other.quality
            && self.source_timestamp == other.source_timestamp
    }
}
