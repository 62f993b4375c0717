// ABOUTME: Scalar values and rows exchanged between the database adapters and the engine
// ABOUTME: Rows serialize to JSON, which is also the payload hashed by block checksums

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single column value as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Natural ordering used for non-text key columns.
    ///
    /// NULL sorts first (as the adapters' ORDER BY does). Integers and floats
    /// compare numerically; other mixed kinds fall back to a fixed kind order.
    pub fn natural_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (a, b) => a.kind_rank().cmp(&b.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    /// Text form used inside change keys and audit rows.
    pub fn to_key_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            other => write!(f, "{}", other.to_key_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A table row: column name to value. Equality is full-row value equality.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The subset of this row formed by the given key columns.
    pub fn key_subset(&self, key_columns: &[String]) -> Row {
        key_columns
            .iter()
            .filter_map(|c| self.0.get(c).map(|v| (c.clone(), v.clone())))
            .collect()
    }

    /// Values of the given columns in order (missing columns become NULL).
    pub fn values_for(&self, columns: &[String]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| self.0.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Serialized payload, used for content hashing and the block row cache.
    pub fn to_payload(&self) -> Vec<u8> {
        // A map of strings to plain enums cannot fail to serialize.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    pub fn from_payload(payload: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_cmp_mixed_numbers() {
        assert_eq!(
            Value::Integer(2).natural_cmp(&Value::Float(2.5)),
            Ordering::Less
        );
        assert_eq!(Value::Null.natural_cmp(&Value::Integer(-5)), Ordering::Less);
        assert_eq!(
            Value::Text("a".into()).natural_cmp(&Value::Integer(1)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_key_subset_keeps_only_key_columns() {
        let row = Row::new().with("id", 1).with("name", "Alice");
        let key = row.key_subset(&["id".to_string()]);
        assert_eq!(key.len(), 1);
        assert_eq!(key.get("id"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_payload_preserves_values() {
        let row = Row::new()
            .with("id", 7)
            .with("ratio", 0.1)
            .with("name", "Bob")
            .with("note", Value::Null)
            .with("data", Value::Blob(vec![0, 255]));
        let back = Row::from_payload(&row.to_payload()).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_key_string() {
        assert_eq!(Value::Integer(42).to_key_string(), "42");
        assert_eq!(Value::Blob(vec![0xde, 0xad]).to_key_string(), "dead");
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
