//! Record model: a free-form JSON object keyed by `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::AppError;

/// Field holding the record's stable identifier.
pub const ID_FIELD: &str = "id";
/// Field stamped by the store on every write (wall-clock milliseconds).
pub const LAST_MODIFIED_FIELD: &str = "lastModified";

/// A single stored record.
///
/// Records are arbitrary JSON objects. The only structure the store relies on is a
/// non-empty string `id` and the `lastModified` stamp it writes itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Self(fields)
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.0
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// The id, or a validation error naming the offending table.
    pub fn require_id(&self, table: &str) -> Result<&str, AppError> {
        self.id().ok_or_else(|| {
            AppError::Validation(format!("Record for table {} has no string id", table))
        })
    }

    pub fn last_modified(&self) -> Option<i64> {
        self.0.get(LAST_MODIFIED_FIELD).and_then(Value::as_i64)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(Value::as_i64)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Copy of the record without the store-managed timestamp, for comparisons.
    pub fn without_last_modified(&self) -> Record {
        let mut copy = self.clone();
        copy.remove(LAST_MODIFIED_FIELD);
        copy
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl TryFrom<Value> for Record {
    type Error = AppError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Record(fields)),
            other => Err(AppError::Validation(format!(
                "Record must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Record(fields)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_accessors() {
        let record = Record::new("u1").with("name", "Mario").with(LAST_MODIFIED_FIELD, 42);
        assert_eq!(record.id(), Some("u1"));
        assert_eq!(record.get_str("name"), Some("Mario"));
        assert_eq!(record.last_modified(), Some(42));
        assert_eq!(record.without_last_modified().last_modified(), None);
    }

    #[test]
    fn test_empty_or_numeric_id_is_missing() {
        let record = Record::try_from(json!({ "id": "" })).unwrap();
        assert!(record.id().is_none());
        let record = Record::try_from(json!({ "id": 7 })).unwrap();
        assert!(record.require_id("users").is_err());
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(Record::try_from(json!([1, 2])).is_err());
        assert!(Record::try_from(json!("u1")).is_err());
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let record = Record::new("s1").with("theme", "dark");
        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text, r#"{"id":"s1","theme":"dark"}"#);
    }
}
