//! Execution-context data model: a time-stamped record of ordered rows.
//!
//! Records are plain owned data so they can be copied across the isolation
//! boundary by value. The one exception is [`Value::Handle`], which stands for
//! a host-only resource and is refused by the marshaling layer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a resource that only exists inside the host process
/// (an open cursor, a UI object, ...). It has no meaning on the other side of
/// the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHandle(pub u64);

/// A typed field value.
///
/// Serialized untagged so records read and write as ordinary JSON:
/// `{"foo": 1, "bar": 2.5, "name": "x", "flag": true, "gone": null}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    #[serde(skip)]
    Handle(HostHandle),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Handle(_) => "handle",
        }
    }

    /// `null` and `false` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    /// Why this value cannot be copied structurally, if it cannot.
    pub fn untransferable_reason(&self) -> Option<&'static str> {
        match self {
            Value::Handle(_) => Some("embeds a host-only handle"),
            Value::Float(f) if !f.is_finite() => Some("non-finite float has no portable encoding"),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Handle(h) => write!(f, "<handle {}>", h.0),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One row: a mapping from field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// The payload passed into user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

/// Location of the first value in a record that cannot cross the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Untransferable {
    pub row: usize,
    pub field: String,
    pub reason: &'static str,
}

impl fmt::Display for Untransferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows[{}].{} is not copyable: {}",
            self.row, self.field, self.reason
        )
    }
}

impl Record {
    pub fn new(time: DateTime<Utc>, rows: Vec<Row>) -> Self {
        Self { time, rows }
    }

    /// Find the first field whose value cannot be copied structurally.
    pub fn find_untransferable(&self) -> Option<Untransferable> {
        self.rows.iter().enumerate().find_map(|(row, fields)| {
            fields.iter().find_map(|(field, value)| {
                value.untransferable_reason().map(|reason| Untransferable {
                    row,
                    field: field.clone(),
                    reason,
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).expect("valid timestamp")
    }

    #[test]
    fn record_reads_plain_json() {
        let raw = r#"{"time":"2024-05-01T12:00:00Z","rows":[{"foo":1,"bar":2.5,"name":"x","on":true,"gone":null}]}"#;
        let record: Record = serde_json::from_str(raw).expect("parse record");
        let row = &record.rows[0];
        assert_eq!(row.get("foo"), Some(&Value::Int(1)));
        assert_eq!(row.get("bar"), Some(&Value::Float(2.5)));
        assert_eq!(row.get("name"), Some(&Value::Str("x".to_string())));
        assert_eq!(row.get("on"), Some(&Value::Bool(true)));
        assert_eq!(row.get("gone"), Some(&Value::Null));
    }

    #[test]
    fn whole_floats_keep_their_type_through_json() {
        let record = Record::new(at(0), vec![Row::new().with("x", 4.0)]);
        let json = serde_json::to_string(&record).expect("serialize");
        let back: Record = serde_json::from_str(&json).expect("parse");
        assert_eq!(back.rows[0].get("x"), Some(&Value::Float(4.0)));
    }

    #[test]
    fn handle_values_refuse_to_serialize() {
        let record = Record::new(at(0), vec![Row::new().with("foo", 1)]);
        let mut with_handle = record.clone();
        with_handle.rows[0].set("cursor", Value::Handle(HostHandle(7)));

        assert!(serde_json::to_string(&record).is_ok());
        assert!(serde_json::to_string(&with_handle).is_err());
    }

    #[test]
    fn find_untransferable_reports_first_offender() {
        let record = Record::new(
            at(0),
            vec![
                Row::new().with("ok", 1),
                Row::new()
                    .with("ratio", f64::NAN)
                    .with("zz", Value::Handle(HostHandle(1))),
            ],
        );
        let found = record.find_untransferable().expect("offender");
        assert_eq!(found.row, 1);
        assert_eq!(found.field, "ratio");
        assert!(found.to_string().contains("rows[1].ratio"));
    }

    #[test]
    fn truthiness_follows_null_and_false() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str(String::new()).is_truthy());
    }
}
