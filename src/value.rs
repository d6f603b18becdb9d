//! The row/value data model (spec §3).
//!
//! A [`Row`] is an unordered mapping from column name to [`Value`]. It is
//! represented internally as a `BTreeMap` so that equal rows always iterate
//! in the same order — useful for deterministic fingerprinting and tests —
//! even though the spec does not require any particular column order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::IvmError;

/// Default maximum nesting depth for `Value::Json` payloads (Open Question
/// in §9, resolved in DESIGN.md).
pub const DEFAULT_MAX_JSON_DEPTH: usize = 32;
/// Default maximum serialized size (bytes) for `Value::Json` payloads.
pub const DEFAULT_MAX_JSON_BYTES: usize = 1024 * 1024;

/// A single column value.
///
/// Numbers are always finite — `Value::number` rejects `NaN` and infinite
/// values at construction, matching the spec's "finite number".
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// An opaque recursive JSON sub-document.
    Json(serde_json::Value),
}

impl Value {
    /// Construct a finite number, rejecting `NaN`/`±Infinity`.
    pub fn number(n: f64) -> Result<Self, IvmError> {
        if !n.is_finite() {
            return Err(IvmError::InternalError(format!(
                "non-finite number value: {n}"
            )));
        }
        Ok(Value::Number(n))
    }

    /// Construct a JSON sub-document, enforcing depth and size limits.
    pub fn json(
        value: serde_json::Value,
        max_depth: usize,
        max_bytes: usize,
    ) -> Result<Self, IvmError> {
        let depth = json_depth(&value);
        if depth > max_depth {
            return Err(IvmError::JsonLimitExceeded(format!(
                "depth {depth} exceeds limit {max_depth}"
            )));
        }
        let size = serde_json::to_vec(&value)
            .map_err(|e| IvmError::InternalError(e.to_string()))?
            .len();
        if size > max_bytes {
            return Err(IvmError::JsonLimitExceeded(format!(
                "size {size} bytes exceeds limit {max_bytes}"
            )));
        }
        Ok(Value::Json(value))
    }

    /// Construct a JSON sub-document using the default limits.
    pub fn json_default(value: serde_json::Value) -> Result<Self, IvmError> {
        Self::json(value, DEFAULT_MAX_JSON_DEPTH, DEFAULT_MAX_JSON_BYTES)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL-style equality: `null` is never equal to anything, including
    /// another `null` (spec §3, "Equality ... uses SQL-style semantics").
    pub fn sql_eq(&self, other: &Value) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self == other
    }

    /// `IS`/`IS NOT` comparison — unlike [`Value::sql_eq`], `null IS null`
    /// is true.
    pub fn is_same_as(&self, other: &Value) -> bool {
        self == other
    }
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        _ => 1,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

/// Partial order over values used for sort-key comparison. Comparing values
/// of different variants is a logic error in a well-typed schema; we order
/// by a stable discriminant so sorting never panics, matching how SQL
/// engines order mixed-affinity columns.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Number(_) => 2,
                Value::String(_) => 3,
                Value::Json(_) => 4,
            }
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

/// A row: an unordered mapping from column name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Row(BTreeMap::new())
    }

    pub fn from_iter(iter: impl IntoIterator<Item = (String, Value)>) -> Self {
        Row(iter.into_iter().collect())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Missing key and explicit null are distinct on *input*; ingress
    /// normalizes the JS-style `undefined` case to `Null` (spec §3). Once
    /// inside a `Row`, callers that want "value or null" should use this.
    pub fn get_or_null(&self, column: &str) -> Value {
        self.0.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Project this row down to a set of columns (used by `Source::connect`
    /// to enforce `requiredColumns ∪ primaryKey ∪ sortColumns`).
    pub fn project(&self, columns: &[&str]) -> Row {
        let mut out = Row::new();
        for &col in columns {
            if let Some(v) = self.0.get(col) {
                out.set(col, v.clone());
            }
        }
        out
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Row(iter.into_iter().collect())
    }
}

/// An ordered, non-empty tuple of column names identifying a row uniquely
/// within its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey(Vec<String>);

impl PrimaryKey {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let cols: Vec<String> = columns.into_iter().map(Into::into).collect();
        assert!(!cols.is_empty(), "primary key must be non-empty");
        PrimaryKey(cols)
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    /// Extract the PK value tuple from a row, in declared column order.
    pub fn extract(&self, row: &Row) -> Vec<Value> {
        self.0.iter().map(|c| row.get_or_null(c)).collect()
    }
}
