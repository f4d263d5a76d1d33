//! # Generic Input Values
//!
//! Callers hand the engine loosely typed data: form inputs rendered as strings, nested
//! records for messages and maps, lists for repeated fields. [`Value`] models that input
//! as a closed set of variants so the marshaler can match on it exhaustively.
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// A record of generic values keyed by field (or map key) name.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Record(Record),
}

impl Value {
    /// Whether this value stands for "no input" and the field must be left unset.
    ///
    /// The input layer wraps every scalar in a list so singular and repeated fields look
    /// alike, which means `[]`, `[null]` and `[""]` are all blank as well.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::List(items) => match items.as_slice() {
                [] => true,
                [Value::Null] => true,
                [Value::String(s)] => s.is_empty(),
                _ => false,
            },
            _ => false,
        }
    }

    /// A short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Record(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Value::Record(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// Converts a JSON object into a [`Record`], or `None` if the value is not an object.
pub fn record_from_json(value: serde_json::Value) -> Option<Record> {
    match Value::from(value) {
        Value::Record(record) => Some(record),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_values() {
        assert!(Value::Null.is_blank());
        assert!(Value::from("").is_blank());
        assert!(Value::List(vec![]).is_blank());
        assert!(Value::List(vec![Value::Null]).is_blank());
        assert!(Value::List(vec![Value::from("")]).is_blank());

        assert!(!Value::from("0").is_blank());
        assert!(!Value::Bool(false).is_blank());
        assert!(!Value::List(vec![Value::from(""), Value::from("")]).is_blank());
        assert!(!Value::Record(Record::new()).is_blank());
    }

    #[test]
    fn converts_nested_json() {
        let value = Value::from(json!({ "a": [1, "x", null], "b": { "c": true } }));

        let record = value.as_record().unwrap();
        let list = record["a"].as_list().unwrap();
        assert_eq!(list.len(), 3);
        assert!(matches!(list[0], Value::Number(_)));
        assert_eq!(list[1].as_str(), Some("x"));
        assert_eq!(list[2], Value::Null);
        assert_eq!(
            record["b"].as_record().unwrap()["c"],
            Value::Bool(true)
        );
    }

    #[test]
    fn deserializes_from_json_text() {
        let value: Value = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(value.as_record().unwrap()["text"].as_str(), Some("hi"));
    }
}
