//! ClickHouse warehouse destination over the HTTP interface.

use async_trait::async_trait;
use lovelace_types::error::ConnectorError;
use lovelace_types::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::postgres::is_valid_identifier;
use super::Destination;
use crate::http;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickHouseConfig {
    #[serde(default = "default_url")]
    pub url: String,
    pub database: Option<String>,
    pub table: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

impl ClickHouseConfig {
    /// Typed view of a job's `destination.config` block.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or mistyped.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid clickhouse destination config: {e}"))
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.url.trim().is_empty() {
            errors.push("clickhouse: url must not be empty".to_string());
        }
        if !is_valid_identifier(&self.table) {
            errors.push(format!("clickhouse: invalid table identifier '{}'", self.table));
        }
        if let Some(db) = &self.database {
            if !is_valid_identifier(db) {
                errors.push(format!("clickhouse: invalid database identifier '{db}'"));
            }
        }
    }

    #[must_use]
    pub fn insert_query(&self) -> String {
        match &self.database {
            Some(db) => format!("INSERT INTO {db}.{} FORMAT JSONEachRow", self.table),
            None => format!("INSERT INTO {} FORMAT JSONEachRow", self.table),
        }
    }
}

/// One JSON object per line.
///
/// # Errors
///
/// Returns a `data` error if a record cannot be serialized.
pub fn to_json_each_row(batch: &[Record]) -> Result<String, ConnectorError> {
    let mut body = String::new();
    for record in batch {
        let line = serde_json::to_string(record)
            .map_err(|e| ConnectorError::data("SERIALIZE_FAILED", e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

pub struct ClickHouseWarehouse {
    http: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseWarehouse {
    #[must_use]
    pub fn new(http: reqwest::Client, config: ClickHouseConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Destination for ClickHouseWarehouse {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn deliver(&mut self, batch: &[Record]) -> Result<(), ConnectorError> {
        let body = to_json_each_row(batch)?;
        let request = self
            .http
            .post(self.config.url.trim_end_matches('/'))
            .query(&[("query", self.config.insert_query())])
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        http::send_text(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_query_and_defaults() {
        let config = ClickHouseConfig::from_value(&json!({"table": "csv_imports"})).unwrap();
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.user, "default");
        assert_eq!(config.insert_query(), "INSERT INTO csv_imports FORMAT JSONEachRow");

        let config = ClickHouseConfig::from_value(&json!({
            "table": "reviews", "database": "lovelace",
        }))
        .unwrap();
        assert_eq!(config.insert_query(), "INSERT INTO lovelace.reviews FORMAT JSONEachRow");
    }

    #[test]
    fn rows_are_newline_delimited() {
        let records: Vec<Record> = ["a", "b"]
            .iter()
            .map(|id| {
                Record::try_new(
                    json!({"id": id, "source_timestamp": "2024-01-01T00:00:00Z"})
                        .as_object()
                        .unwrap()
                        .clone(),
                )
                .unwrap()
            })
            .collect();
        let body = to_json_each_row(&records).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            serde_json::from_str::<Value>(lines[1]).unwrap()["id"],
            "b"
        );
    }

    #[test]
    fn validation_rejects_injection() {
        let config = ClickHouseConfig::from_value(&json!({
            "table": "t; DROP TABLE x",
            "database": "ok",
        }))
        .unwrap();
        let mut errors = Vec::new();
        config.validate(&mut errors);
        assert_eq!(errors.len(), 1);
    }
}
