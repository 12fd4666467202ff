//! Node values exchanged with an instrument
//!
//! Supports the minimal set of scalar types an automation server exposes
//! on the metric nodes twinlink reads and the setpoints it writes.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value of a single instrument node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value")]
pub enum NodeValue {
    /// Node has no value (bad quality or not yet written)
    #[default]
    Null,

    /// Boolean value
    Boolean(bool),

    /// Integer number
    Integer(i64),

    /// Floating point number
    Float(OrderedFloat<f64>),

    /// UTF-8 string
    String(String),
}

impl NodeValue {
    /// Convert to boolean if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NodeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert to integer if possible
    ///
    /// Floats convert only when they carry no fractional part, since the
    /// counters read through this path must never be silently rounded.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NodeValue::Integer(i) => Some(*i),
            NodeValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(f.into_inner() as i64),
            NodeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to float if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Float(f) => Some(f.into_inner()),
            NodeValue::Integer(i) => Some(*i as f64),
            NodeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to string slice if possible
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeValue::Null => "Null",
            NodeValue::Boolean(_) => "Boolean",
            NodeValue::Integer(_) => "Integer",
            NodeValue::Float(_) => "Float",
            NodeValue::String(_) => "String",
        }
    }

    /// Build a node value from a JSON scalar, as found in twin desired properties
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(NodeValue::Null),
            serde_json::Value::Bool(b) => Some(NodeValue::Boolean(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(NodeValue::Integer)
                .or_else(|| n.as_f64().map(NodeValue::from)),
            serde_json::Value::String(s) => Some(NodeValue::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Null => write!(f, "null"),
            NodeValue::Boolean(b) => write!(f, "{b}"),
            NodeValue::Integer(i) => write!(f, "{i}"),
            NodeValue::Float(fl) => write!(f, "{fl}"),
            NodeValue::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for NodeValue {
    fn from(b: bool) -> Self {
        NodeValue::Boolean(b)
    }
}

impl From<i32> for NodeValue {
    fn from(i: i32) -> Self {
        NodeValue::Integer(i64::from(i))
    }
}

impl From<i64> for NodeValue {
    fn from(i: i64) -> Self {
        NodeValue::Integer(i)
    }
}

impl From<f64> for NodeValue {
    fn from(f: f64) -> Self {
        NodeValue::Float(OrderedFloat(f))
    }
}

impl From<String> for NodeValue {
    fn from(s: String) -> Self {
        NodeValue::String(s)
    }
}

impl From<&str> for NodeValue {
    fn from(s: &str) -> Self {
        NodeValue::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_conversions() {
        assert_eq!(NodeValue::from(42).as_i64(), Some(42));
        assert_eq!(NodeValue::from(3.5).as_f64(), Some(3.5));
        assert_eq!(NodeValue::from("hello").as_str(), Some("hello"));
        assert_eq!(NodeValue::from(true).as_bool(), Some(true));
    }

    #[test]
    fn test_fractional_float_is_not_an_integer() {
        assert_eq!(NodeValue::from(4.0).as_i64(), Some(4));
        assert_eq!(NodeValue::from(4.5).as_i64(), None);
        assert_eq!(NodeValue::Null.as_i64(), None);
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(NodeValue::from_json(&json!(60)), Some(NodeValue::Integer(60)));
        assert_eq!(NodeValue::from_json(&json!(12.5)), Some(NodeValue::from(12.5)));
        assert_eq!(NodeValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeValue::from("Running").to_string(), "Running");
        assert_eq!(NodeValue::from(7).to_string(), "7");
        assert_eq!(NodeValue::Null.to_string(), "null");
    }
}
