//! Uniform result row.
//!
//! Some stores hand back dict-like rows, others positional tuples. Every
//! backend normalizes into [`Record`], which answers both `record["name"]`
//! and `record[0]`.

use serde::Serialize;
use serde_json::Value;
use std::ops::Index;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Record {
    keys: Vec<String>,
    values: Vec<Value>,
}

impl Record {
    /// Build a record from parallel column names and values.
    ///
    /// Extra values without a name are dropped; missing values read as null.
    pub fn new(keys: Vec<String>, mut values: Vec<Value>) -> Self {
        values.resize(keys.len(), Value::Null);
        Self { keys, values }
    }

    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        let (keys, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self { keys, values }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Value by column name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys
            .iter()
            .position(|k| k == key)
            .and_then(|i| self.values.get(i))
    }

    /// Value by column position.
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.keys.iter().map(String::as_str).zip(self.values.iter())
    }

    pub fn into_map(self) -> serde_json::Map<String, Value> {
        self.keys.into_iter().zip(self.values).collect()
    }
}

impl Index<&str> for Record {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&NULL)
    }
}

impl Index<usize> for Record {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        self.at(index).unwrap_or(&NULL)
    }
}
