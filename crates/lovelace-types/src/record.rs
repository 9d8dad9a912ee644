//! Canonical normalized record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::SchemaError;

/// Field carrying the source-native identifier.
pub const ID_FIELD: &str = "id";
/// Field carrying the RFC 3339 ordering timestamp.
pub const SOURCE_TIMESTAMP_FIELD: &str = "source_timestamp";

/// Ordered field map with a guaranteed string `id` and an RFC 3339
/// `source_timestamp`. Immutable once built.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Record {
    fields: Map<String, Value>,
    source_timestamp: DateTime<Utc>,
}

impl Record {
    /// Validate and wrap an already normalized field map.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] naming `id` or `source_timestamp` when either
    /// is missing or malformed.
    pub fn try_new(fields: Map<String, Value>) -> Result<Self, SchemaError> {
        match fields.get(ID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(Value::String(_)) => return Err(SchemaError::new(ID_FIELD, "must not be empty")),
            Some(other) => {
                return Err(SchemaError::new(
                    ID_FIELD,
                    format!("expected string, got {}", json_type(other)),
                ))
            }
            None => return Err(SchemaError::missing(ID_FIELD)),
        }
        let source_timestamp = match fields.get(SOURCE_TIMESTAMP_FIELD) {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| SchemaError::new(SOURCE_TIMESTAMP_FIELD, e.to_string()))?,
            Some(other) => {
                return Err(SchemaError::new(
                    SOURCE_TIMESTAMP_FIELD,
                    format!("expected RFC 3339 string, got {}", json_type(other)),
                ))
            }
            None => return Err(SchemaError::missing(SOURCE_TIMESTAMP_FIELD)),
        };
        Ok(Self {
            fields,
            source_timestamp,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.fields
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn source_timestamp(&self) -> DateTime<Utc> {
        self.source_timestamp
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize as a JSON object value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl TryFrom<Map<String, Value>> for Record {
    type Error = SchemaError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        Self::try_new(fields)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// Render a timestamp the way records store it.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn valid_record_exposes_id_and_timestamp() {
        let rec = Record::try_new(map(json!({
            "id": "42",
            "source_timestamp": "2024-05-01T12:00:00Z",
            "content": "gg"
        })))
        .unwrap();
        assert_eq!(rec.id(), "42");
        assert_eq!(rec.source_timestamp().timestamp(), 1_714_564_800);
        assert_eq!(rec.get("content"), Some(&json!("gg")));
        assert_eq!(rec.len(), 3);
    }

    #[test]
    fn missing_id_names_field() {
        let err = Record::try_new(map(json!({"source_timestamp": "2024-05-01T12:00:00Z"})))
            .unwrap_err();
        assert_eq!(err.field, "id");
    }

    #[test]
    fn numeric_id_is_rejected() {
        let err = Record::try_new(map(json!({"id": 7, "source_timestamp": "2024-05-01T12:00:00Z"})))
            .unwrap_err();
        assert_eq!(err.field, "id");
        assert!(err.reason.contains("number"));
    }

    #[test]
    fn bad_timestamp_names_field() {
        let err =
            Record::try_new(map(json!({"id": "1", "source_timestamp": "yesterday"}))).unwrap_err();
        assert_eq!(err.field, "source_timestamp");
    }

    #[test]
    fn serializes_as_plain_object_in_order() {
        let rec = Record::try_new(map(json!({
            "id": "1",
            "source_timestamp": "2024-05-01T12:00:00Z",
            "b": 2,
            "a": 1
        })))
        .unwrap();
        let text = serde_json::to_string(&rec).unwrap();
        assert_eq!(
            text,
            r#"{"id":"1","source_timestamp":"2024-05-01T12:00:00Z","b":2,"a":1}"#
        );
    }

    #[test]
    fn deserialize_validates() {
        let ok: Record =
            serde_json::from_str(r#"{"id":"x","source_timestamp":"2024-05-01T12:00:00+02:00"}"#)
                .unwrap();
        assert_eq!(ok.source_timestamp().to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(serde_json::from_str::<Record>(r#"{"source_timestamp":"x"}"#).is_err());
    }

    #[test]
    fn format_timestamp_uses_micros_and_z() {
        let ts = DateTime::from_timestamp(0, 1_000).unwrap();
        assert_eq!(format_timestamp(&ts), "1970-01-01T00:00:00.000001Z");
    }
}
