//! Language-neutral value model for extracted claims
//!
//! Claims reach the policy evaluator as [`Value`]s. The conversion from the
//! decoded JSON payload goes through a [`ValueConverter`] so the embedding
//! service can substitute its own value model rules; [`JsonValueConverter`]
//! is the default.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Extracted claims, keyed by claim name
pub type Claims = HashMap<String, Value>;

/// Largest integer magnitude an `f64` represents exactly (2^53)
const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// Default nesting limit for [`JsonValueConverter`]
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// A generic structured value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// A decoded value that has no representation in [`Value`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedValue {
    #[error("number {0} cannot be represented exactly")]
    InexactNumber(String),

    #[error("value nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Converts decoded claim values into the generic value model
pub trait ValueConverter: Send + Sync {
    /// Convert one decoded value
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedValue`] when the value has no faithful representation.
    fn convert(&self, value: &serde_json::Value) -> Result<Value, UnsupportedValue>;
}

/// Default converter from `serde_json` values
///
/// Integers beyond ±2^53 are rejected rather than silently rounded, and
/// nesting is bounded so hostile payloads cannot exhaust the stack.
#[derive(Debug, Clone)]
pub struct JsonValueConverter {
    max_depth: usize,
}

impl Default for JsonValueConverter {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl JsonValueConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    fn convert_at(&self, value: &serde_json::Value, depth: usize) -> Result<Value, UnsupportedValue> {
        if depth > self.max_depth {
            return Err(UnsupportedValue::TooDeep(self.max_depth));
        }

        Ok(match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Number(n) => Value::Number(convert_number(n)?),
            serde_json::Value::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.convert_at(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.convert_at(v, depth + 1)?)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl ValueConverter for JsonValueConverter {
    fn convert(&self, value: &serde_json::Value) -> Result<Value, UnsupportedValue> {
        self.convert_at(value, 0)
    }
}

fn convert_number(n: &serde_json::Number) -> Result<f64, UnsupportedValue> {
    if let Some(u) = n.as_u64() {
        return if u <= MAX_EXACT_INTEGER {
            Ok(u as f64)
        } else {
            Err(UnsupportedValue::InexactNumber(n.to_string()))
        };
    }
    if let Some(i) = n.as_i64() {
        return if i.unsigned_abs() <= MAX_EXACT_INTEGER {
            Ok(i as f64)
        } else {
            Err(UnsupportedValue::InexactNumber(n.to_string()))
        };
    }
    n.as_f64()
        .ok_or_else(|| UnsupportedValue::InexactNumber(n.to_string()))
}
