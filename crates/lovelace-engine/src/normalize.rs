//! Record normalizer: raw payload -> canonical [`Record`].
//!
//! Steps, in order:
//! 1. declarative renames (`mapping`, dotted source paths),
//! 2. flattening of nested objects into `parent_child` keys (arrays are
//!    kept as values), or recursive key normalization when `flatten` is off,
//! 3. snake_case + lower-case of every key,
//! 4. `id` and `source_timestamp` derivation,
//! 5. context injection. Context fields always win over payload fields.
//!
//! `id_field` and `timestamp_field` name fields *after* steps 1-3.

use chrono::{DateTime, NaiveDateTime, Utc};
use lovelace_types::cursor::Cursor;
use lovelace_types::error::SchemaError;
use lovelace_types::record::{format_timestamp, Record, ID_FIELD, SOURCE_TIMESTAMP_FIELD};
use serde_json::{Map, Value};

use crate::config::types::NormalizeConfig;
use crate::source::RawRecord;

/// Context field carrying the source id.
pub const SOURCE_ID_FIELD: &str = "source_id";
/// Context field carrying the run identifier.
pub const INGESTION_RUN_ID_FIELD: &str = "ingestion_run_id";

/// Epoch values below this are seconds, at or above it milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Lower-case snake_case form of a field name.
///
/// Non-alphanumeric runs become one `_`; a boundary is inserted between a
/// lower-case letter or digit and an upper-case letter, and before the last
/// capital of an acronym followed by lower-case (`HTTPCode` -> `http_code`).
#[must_use]
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_numeric() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(char::is_lowercase),
                _ => false,
            };
            if boundary && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Parse an RFC 3339 string, a naive ISO-8601 string (taken as UTC), or an
/// epoch number (seconds below 1e11, milliseconds above).
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                        .iter()
                        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                        .map(|naive| naive.and_utc())
                })
                .or_else(|| s.parse::<i64>().ok().and_then(from_epoch))
        }
        Value::Number(n) => n.as_i64().and_then(from_epoch).or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .and_then(|f| {
                    #[allow(clippy::cast_possible_truncation)]
                    let millis = (f * 1000.0).round() as i64;
                    if f.abs() < 1e11 {
                        DateTime::from_timestamp_millis(millis)
                    } else {
                        None
                    }
                })
        }),
        _ => None,
    }
}

fn from_epoch(v: i64) -> Option<DateTime<Utc>> {
    if v.abs() < EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp(v, 0)
    } else {
        DateTime::from_timestamp_millis(v)
    }
}

/// Remove the value at a dotted path. An exact key match wins over a
/// nested lookup.
fn take_path(obj: &mut Map<String, Value>, path: &str) -> Option<Value> {
    if let Some(v) = obj.remove(path) {
        return Some(v);
    }
    let (head, rest) = path.split_once('.')?;
    match obj.get_mut(head)? {
        Value::Object(child) => take_path(child, rest),
        _ => None,
    }
}

fn insert_unique(out: &mut Map<String, Value>, key: String, value: Value) -> Result<(), SchemaError> {
    if key.is_empty() {
        return Err(SchemaError::new(key, "field name is empty after normalization"));
    }
    if out.contains_key(&key) {
        return Err(SchemaError::new(
            key,
            "collides with another field after normalization",
        ));
    }
    out.insert(key, value);
    Ok(())
}

fn flatten_into(
    out: &mut Map<String, Value>,
    prefix: &str,
    obj: Map<String, Value>,
) -> Result<(), SchemaError> {
    for (key, value) in obj {
        let name = snake_case(&key);
        let full = match (prefix.is_empty(), name.is_empty()) {
            (true, _) => name,
            (false, true) => prefix.to_string(),
            (false, false) => format!("{prefix}_{name}"),
        };
        match value {
            Value::Object(child) => flatten_into(out, &full, child)?,
            other => insert_unique(out, full, other)?,
        }
    }
    Ok(())
}

fn normalize_keys(obj: Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
    let mut out = Map::new();
    for (key, value) in obj {
        let value = match value {
            Value::Object(child) => Value::Object(normalize_keys(child)?),
            other => other,
        };
        insert_unique(&mut out, snake_case(&key), value)?;
    }
    Ok(out)
}

fn coerce_id(value: Option<&Value>, field: &str) -> Result<String, SchemaError> {
    match value {
        None | Some(Value::Null) => Err(SchemaError::missing(field)),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(SchemaError::new(field, "identifier is empty"))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(SchemaError::new(
            field,
            format!("identifier must be a string or number, got {other}"),
        )),
    }
}

/// Maps raw payloads onto [`Record`]s for one run.
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizeConfig,
    id_field: String,
    timestamp_field: String,
    context: Map<String, Value>,
}

impl Normalizer {
    /// Bind the declarative config to one run. `source_id` and
    /// `ingestion_run_id` join the configured context fields.
    #[must_use]
    pub fn new(config: NormalizeConfig, source_id: &str, ingestion_run_id: &str) -> Self {
        let mut context: Map<String, Value> = config
            .context
            .iter()
            .map(|(k, v)| (snake_case(k), v.clone()))
            .collect();
        context.insert(SOURCE_ID_FIELD.to_string(), Value::from(source_id));
        context.insert(INGESTION_RUN_ID_FIELD.to_string(), Value::from(ingestion_run_id));
        Self {
            id_field: snake_case(&config.id_field),
            timestamp_field: snake_case(&config.timestamp_field),
            config,
            context,
        }
    }

    /// Normalize one raw record.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] naming the offending field when the payload
    /// is not an object, two keys collide after normalization, or the id or
    /// timestamp is missing or malformed.
    pub fn normalize(&self, raw: &RawRecord) -> Result<Record, SchemaError> {
        let Value::Object(mut obj) = raw.payload.clone() else {
            return Err(SchemaError::new(
                "<payload>",
                format!("expected a JSON object, got {}", kind_name(&raw.payload)),
            ));
        };

        let mut mapped = Map::new();
        for (path, target) in &self.config.mapping {
            if let Some(value) = take_path(&mut obj, path) {
                mapped.insert(snake_case(target), value);
            }
        }

        let mut out = if self.config.flatten {
            let mut out = Map::new();
            flatten_into(&mut out, "", obj)?;
            out
        } else {
            normalize_keys(obj)?
        };
        for (key, value) in mapped {
            let value = match value {
                Value::Object(child) if !self.config.flatten => Value::Object(normalize_keys(child)?),
                other => other,
            };
            out.insert(key, value);
        }

        let id = coerce_id(out.get(&self.id_field), &self.id_field)?;
        out.insert(ID_FIELD.to_string(), Value::String(id));

        let ts = match out.get(&self.timestamp_field) {
            Some(v) if !v.is_null() => parse_timestamp(v).ok_or_else(|| {
                SchemaError::new(
                    self.timestamp_field.clone(),
                    format!("unparseable timestamp {v}"),
                )
            })?,
            _ => match &raw.cursor {
                Some(Cursor::Timestamp(ts)) => *ts,
                _ => raw.observed_at,
            },
        };
        out.insert(
            SOURCE_TIMESTAMP_FIELD.to_string(),
            Value::String(format_timestamp(&ts)),
        );

        for (key, value) in &self.context {
            out.insert(key.clone(), value.clone());
        }

        Record::try_new(out)
    }
}

fn kind_name(value: &Value) -> &'static str {
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
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn raw(payload: Value) -> RawRecord {
        RawRecord {
            payload,
            cursor: None,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            subunit: "c1".into(),
        }
    }

    fn normalizer(edit: impl FnOnce(&mut NormalizeConfig)) -> Normalizer {
        let mut config = NormalizeConfig::default();
        edit(&mut config);
        Normalizer::new(config, "guild-1", "run-1")
    }

    #[test]
    fn snake_case_rules() {
        assert_eq!(snake_case("topCriticScore"), "top_critic_score");
        assert_eq!(snake_case("HTTPResponseBody"), "http_response_body");
        assert_eq!(snake_case("Author ID"), "author_id");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("gameId"), "game_id");
        assert_eq!(snake_case("player2Rating"), "player2_rating");
        assert_eq!(snake_case("--x--y--"), "x_y");
        assert_eq!(snake_case("!!!"), "");
    }

    #[test]
    fn flattens_and_injects_context() {
        let n = normalizer(|c| {
            c.context = BTreeMap::from([("gameId".to_string(), json!("ravenswatch"))]);
            c.timestamp_field = "created_at".into();
        });
        let record = n
            .normalize(&raw(json!({
                "id": "42",
                "author": {"id": "7", "displayName": "Ada"},
                "createdAt": "2024-03-01T12:00:00+00:00",
                "reactions": [{"emoji": "🔥", "count": 2}],
            })))
            .unwrap();
        assert_eq!(record.id(), "42");
        assert_eq!(record.get("author_id"), Some(&json!("7")));
        assert_eq!(record.get("author_display_name"), Some(&json!("Ada")));
        assert_eq!(record.get("reactions"), Some(&json!([{"emoji": "🔥", "count": 2}])));
        assert_eq!(record.get("game_id"), Some(&json!("ravenswatch")));
        assert_eq!(record.get(SOURCE_ID_FIELD), Some(&json!("guild-1")));
        assert_eq!(record.get(INGESTION_RUN_ID_FIELD), Some(&json!("run-1")));
        assert_eq!(
            record.source_timestamp(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn mapping_renames_dotted_paths_and_wins() {
        let n = normalizer(|c| {
            c.mapping = BTreeMap::from([
                ("author.id".to_string(), "user_id".to_string()),
                ("msgId".to_string(), "id".to_string()),
            ]);
        });
        let record = n
            .normalize(&raw(json!({"msgId": 9, "author": {"id": "7", "name": "ada"}, "user_id": "x"})))
            .unwrap();
        assert_eq!(record.id(), "9");
        assert_eq!(record.get("user_id"), Some(&json!("7")));
        assert_eq!(record.get("author_name"), Some(&json!("ada")));
        assert!(record.get("author_id").is_none());
    }

    #[test]
    fn context_is_never_overwritten() {
        let n = normalizer(|c| {
            c.context = BTreeMap::from([("game_id".to_string(), json!("ravenswatch"))]);
        });
        let record = n
            .normalize(&raw(json!({"id": "1", "game_id": "spoofed", "source_id": "other"})))
            .unwrap();
        assert_eq!(record.get("game_id"), Some(&json!("ravenswatch")));
        assert_eq!(record.get("source_id"), Some(&json!("guild-1")));
    }

    #[test]
    fn without_flatten_nested_keys_are_normalized() {
        let n = normalizer(|c| c.flatten = false);
        let record = n
            .normalize(&raw(json!({"id": "1", "Author": {"displayName": "Ada"}})))
            .unwrap();
        assert_eq!(record.get("author"), Some(&json!({"display_name": "Ada"})));
    }

    #[test]
    fn missing_id_names_the_field() {
        let n = normalizer(|c| c.id_field = "messageId".into());
        let err = n.normalize(&raw(json!({"content": "hi"}))).unwrap_err();
        assert_eq!(err.field, "message_id");

        let err = normalizer(|_| {}).normalize(&raw(json!({"id": null}))).unwrap_err();
        assert_eq!(err.field, "id");

        let err = normalizer(|_| {}).normalize(&raw(json!({"id": {"nested": 1}}))).unwrap_err();
        assert_eq!(err.field, "id");
    }

    #[test]
    fn key_collisions_are_schema_errors() {
        let err = normalizer(|_| {})
            .normalize(&raw(json!({"id": "1", "userName": "a", "user_name": "b"})))
            .unwrap_err();
        assert_eq!(err.field, "user_name");
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = normalizer(|_| {}).normalize(&raw(json!([1, 2]))).unwrap_err();
        assert_eq!(err.field, "<payload>");
    }

    #[test]
    fn timestamp_fallbacks() {
        let n = normalizer(|_| {});
        let mut r = raw(json!({"id": "1"}));
        r.cursor = Some(Cursor::Timestamp(Utc.with_ymd_and_hms(2023, 5, 5, 5, 5, 5).unwrap()));
        assert_eq!(
            n.normalize(&r).unwrap().source_timestamp(),
            Utc.with_ymd_and_hms(2023, 5, 5, 5, 5, 5).unwrap()
        );

        r.cursor = Some(Cursor::Offset(3));
        assert_eq!(n.normalize(&r).unwrap().source_timestamp(), r.observed_at);

        let err = n
            .normalize(&raw(json!({"id": "1", "source_timestamp": "last tuesday"})))
            .unwrap_err();
        assert_eq!(err.field, "source_timestamp");
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for value in [
            json!("2024-03-01T12:00:00Z"),
            json!("2024-03-01T14:00:00+02:00"),
            json!("2024-03-01 12:00:00"),
            json!("2024-03-01T12:00:00.000"),
            json!(1_709_294_400),
            json!(1_709_294_400_000_i64),
            json!("1709294400"),
        ] {
            assert_eq!(parse_timestamp(&value), Some(expected), "{value}");
        }
        assert!(parse_timestamp(&json!(true)).is_none());
    }
}
