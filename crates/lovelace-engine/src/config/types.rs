//! Job YAML configuration types.
//!
//! Kind-specific `config` blocks stay as raw JSON here; each adapter and
//! destination deserializes its own typed settings from them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level job configuration parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub version: String,
    pub job: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    RestCursor,
    EventHistory,
    TieredScrape,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestCursor => "rest_cursor",
            Self::EventHistory => "event_history",
            Self::TieredScrape => "tiered_scrape",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    #[serde(default = "empty_object")]
    pub config: Value,
}

/// Declarative field mapping plus injected context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Dotted source path -> target field name.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub flatten: bool,
    /// Fixed fields injected into every record; never overwritten by payloads.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            mapping: BTreeMap::new(),
            flatten: true,
            context: BTreeMap::new(),
            id_field: default_id_field(),
            timestamp_field: default_timestamp_field(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Broker,
    Postgres,
    Clickhouse,
}

impl DestinationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Postgres => "postgres",
            Self::Clickhouse => "clickhouse",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    #[serde(default = "empty_object")]
    pub config: Value,
}

/// Batch flush policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_batch_records: default_max_batch_records(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// SQLite path or Postgres connection string.
    pub connection: Option<String>,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::default(),
            connection: None,
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl StateConfig {
    /// `~/.lovelace/state.db`, falling back to the working directory when
    /// `HOME` is unset.
    #[must_use]
    pub fn default_sqlite_path() -> PathBuf {
        std::env::var_os("HOME")
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join(".lovelace")
            .join("state.db")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaErrorPolicy {
    /// Route the record to the DLQ and continue.
    #[default]
    Skip,
    /// Abort the run.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_call_attempts")]
    pub max_call_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub on_schema_error: SchemaErrorPolicy,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            call_timeout_secs: default_call_timeout_secs(),
            max_call_attempts: default_max_call_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            on_schema_error: SchemaErrorPolicy::default(),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
fn default_true() -> bool {
    true
}
fn default_id_field() -> String {
    "id".to_string()
}
fn default_timestamp_field() -> String {
    "source_timestamp".to_string()
}
fn default_max_batch_records() -> usize {
    100
}
fn default_max_batch_wait_ms() -> u64 {
    5_000
}
fn default_max_delivery_attempts() -> u32 {
    5
}
fn default_lease_ttl_secs() -> u64 {
    3_600
}
fn default_parallelism() -> u32 {
    1
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_max_call_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_job() {
        let yaml = r#"
version: "1.0"
job: reviews
source:
  id: opencritic
  kind: rest_cursor
  config:
    url: https://example.com/reviews
destination:
  kind: clickhouse
  config:
    url: http://localhost:8123
    table: reviews
"#;
        let config: JobConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.job, "reviews");
        assert_eq!(config.source.kind, SourceKind::RestCursor);
        assert_eq!(config.destination.kind, DestinationKind::Clickhouse);
        // Defaults applied
        assert_eq!(config.sink.max_batch_records, 100);
        assert_eq!(config.sink.max_batch_wait_ms, 5_000);
        assert_eq!(config.sink.max_delivery_attempts, 5);
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(config.state.lease_ttl_secs, 3_600);
        assert!(config.state.connection.is_none());
        assert_eq!(config.resources.parallelism, 1);
        assert_eq!(config.resources.on_schema_error, SchemaErrorPolicy::Skip);
        assert!(config.normalize.flatten);
        assert_eq!(config.normalize.id_field, "id");
        assert_eq!(config.normalize.timestamp_field, "source_timestamp");
    }

    #[test]
    fn test_deserialize_full_job() {
        let yaml = r#"
version: "1.0"
job: discord_backfill
source:
  id: guild-1234
  kind: event_history
  config:
    guild_id: "1234"
    token: abc
normalize:
  mapping:
    author.id: author_id
  flatten: false
  context:
    game_id: ravenswatch
  id_field: message_id
  timestamp_field: created_at
destination:
  kind: broker
  config:
    url: http://localhost:8082
    topic: discord.messages
sink:
  max_batch_records: 2
  max_batch_wait_ms: 250
  max_delivery_attempts: 3
state:
  backend: postgres
  connection: postgres://localhost/state
  lease_ttl_secs: 60
resources:
  parallelism: 4
  call_timeout_secs: 10
  max_call_attempts: 5
  initial_backoff_ms: 100
  max_backoff_ms: 1000
  on_schema_error: fail
"#;
        let config: JobConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.normalize.mapping["author.id"], "author_id");
        assert!(!config.normalize.flatten);
        assert_eq!(config.normalize.context["game_id"], "ravenswatch");
        assert_eq!(config.sink.max_batch_records, 2);
        assert_eq!(config.state.backend, StateBackendKind::Postgres);
        assert_eq!(config.resources.parallelism, 4);
        assert_eq!(config.resources.on_schema_error, SchemaErrorPolicy::Fail);
    }

    #[test]
    fn test_unknown_source_kind_rejected() {
        let yaml = r#"
version: "1.0"
job: x
source:
  id: s
  kind: carrier_pigeon
destination:
  kind: broker
"#;
        assert!(serde_yaml::from_str::<JobConfig>(yaml).is_err());
    }

    #[test]
    fn test_default_sqlite_path_under_lovelace_dir() {
        let path = StateConfig::default_sqlite_path();
        assert!(path.ends_with(".lovelace/state.db"));
    }
}
