//! Records streamed from a backing store and the keys extracted from them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// A single attribute value.
///
/// Totally ordered and hashable so values can key dedup indices and `In` sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::Date(d) => write!(f, "{}", d),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
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
        Value::Int(v as i64)
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

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A (possibly composite) key: one value per key attribute.
pub type Key = Vec<Value>;

/// One row of a class, attribute name -> value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(attribute.into(), value.into());
        self
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(attribute.into(), value.into());
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    /// Extract the key formed by `attributes`, in order.
    ///
    /// `class` is only used for the error message.
    pub fn key(&self, class: &str, attributes: &[String]) -> Result<Key> {
        attributes
            .iter()
            .map(|attr| {
                self.values
                    .get(attr)
                    .cloned()
                    .ok_or_else(|| LoadError::MissingAttribute {
                        class: class.to_string(),
                        attribute: attr.clone(),
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_shared(self) -> Arc<Record> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_follows_attribute_order() {
        let record = Record::new().with("acctId", 7).with("instrumentId", "IBM");
        let key = record
            .key("Contract", &["instrumentId".to_string(), "acctId".to_string()])
            .unwrap();
        assert_eq!(key, vec![Value::from("IBM"), Value::Int(7)]);
    }

    #[test]
    fn missing_attribute_is_reported() {
        let record = Record::new().with("acctId", 7);
        let err = record.key("Contract", &["instrumentId".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingAttribute { ref attribute, .. } if attribute == "instrumentId"
        ));
    }

    #[test]
    fn values_order_across_variants() {
        assert!(Value::Null < Value::Int(0));
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::from("a") < Value::from("b"));
    }
}
