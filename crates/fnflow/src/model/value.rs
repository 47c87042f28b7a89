//! `TypedValue`: a self-describing value flowing through task inputs/outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Discriminant for a [`TypedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Nil,
    Bool,
    Number,
    String,
    List,
    Map,
    /// A source string to be evaluated by the expression resolver.
    Expression,
}

/// A self-describing value: a type tag, a JSON body, and free-form labels.
///
/// Labels are used both for selector routing (on events) and to record
/// provenance — the expression resolver stamps a `src` label on every value
/// it resolves from an expression, carrying the original source string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: serde_json::Value,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TypedValue {
    pub fn new(value_type: ValueType, value: serde_json::Value) -> Self {
        Self {
            value_type,
            value,
            labels: BTreeMap::new(),
        }
    }

    pub fn nil() -> Self {
        Self::new(ValueType::Nil, serde_json::Value::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(ValueType::String, serde_json::Value::String(s.into()))
    }

    pub fn expression(src: impl Into<String>) -> Self {
        Self::new(ValueType::Expression, serde_json::Value::String(src.into()))
    }

    /// Infer a [`TypedValue`] from a raw JSON value (used when parsing
    /// inputs that aren't already typed, e.g. the YAML front-end would
    /// call this — kept here since the resolver needs the same inference
    /// when re-typing an evaluated expression result).
    pub fn parse(value: serde_json::Value) -> Self {
        match &value {
            serde_json::Value::Null => Self::new(ValueType::Nil, value),
            serde_json::Value::Bool(_) => Self::new(ValueType::Bool, value),
            serde_json::Value::Number(_) => Self::new(ValueType::Number, value),
            serde_json::Value::String(_) => Self::new(ValueType::String, value),
            serde_json::Value::Array(_) => Self::new(ValueType::List, value),
            serde_json::Value::Object(_) => Self::new(ValueType::Map, value),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_expression(&self) -> bool {
        self.value_type == ValueType::Expression
    }

    /// Strips the expression source out of the value, e.g. `{{ $.tasks.t1.output }}`.
    pub fn expression_source(&self) -> Option<&str> {
        if !self.is_expression() {
            return None;
        }
        self.value.as_str()
    }

    /// A short, truncated description, mirroring the original's `TypedValue.Short()`
    /// used for log lines where the full value would be noisy.
    pub fn short(&self) -> String {
        const MAX_LEN: usize = 32;
        let raw = self.value.to_string();
        let val = if raw.len() > MAX_LEN {
            format!("{}[..{}..]", &raw[..MAX_LEN], raw.len() - MAX_LEN)
        } else {
            raw
        };
        format!("<Type=\"{:?}\", Val=\"{}\">", self.value_type, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_infers_type() {
        assert_eq!(TypedValue::parse(serde_json::json!(null)).value_type, ValueType::Nil);
        assert_eq!(TypedValue::parse(serde_json::json!(true)).value_type, ValueType::Bool);
        assert_eq!(TypedValue::parse(serde_json::json!(1)).value_type, ValueType::Number);
        assert_eq!(TypedValue::parse(serde_json::json!("x")).value_type, ValueType::String);
        assert_eq!(TypedValue::parse(serde_json::json!([1, 2])).value_type, ValueType::List);
        assert_eq!(TypedValue::parse(serde_json::json!({"a": 1})).value_type, ValueType::Map);
    }

    #[test]
    fn expression_roundtrip() {
        let tv = TypedValue::expression("$.tasks.t1.output");
        assert!(tv.is_expression());
        assert_eq!(tv.expression_source(), Some("$.tasks.t1.output"));
    }

    #[test]
    fn short_truncates_long_values() {
        let long = "x".repeat(100);
        let tv = TypedValue::string(long);
        let short = tv.short();
        assert!(short.len() < 100);
        assert!(short.contains(".."));
    }
}
