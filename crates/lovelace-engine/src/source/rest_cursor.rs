//! Paginated REST listing adapter (review feeds and similar).
//!
//! Each configured partition is one sub-unit. Pages are fetched with the
//! resume cursor as a `since` filter and a continuation token until the
//! feed runs out, repeats a token, or (for newest-first feeds) reaches a
//! record at or below the resume cursor.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lovelace_types::cursor::{Cursor, CursorError};
use lovelace_types::error::{ConnectorError, SchemaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::driver::{SubUnit, UnitEmitter, UnitFetcher};
use crate::http;
use crate::retry::{call_with_retry, RetryPolicy};

/// How a record's cursor field is typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestCursorKind {
    /// Integer (or numeric string) offset / sequence number.
    Offset,
    /// RFC 3339 timestamp string.
    Timestamp,
    /// Integer seconds since the Unix epoch.
    EpochSeconds,
    /// Opaque, lexically ordered string.
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOrder {
    #[default]
    Ascending,
    /// Newest first; read back to the resume cursor, then emitted oldest first.
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestCursorConfig {
    /// Listing URL; `{partition}` is substituted per sub-unit.
    pub url: String,
    #[serde(default = "default_partitions")]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameter carrying the resume cursor.
    pub since_param: Option<String>,
    /// Query parameter carrying the continuation token.
    pub page_param: Option<String>,
    pub limit_param: Option<String>,
    pub page_size: Option<u32>,
    /// JSON pointer to the record array; empty means the body itself.
    #[serde(default)]
    pub records_path: String,
    /// JSON pointer to the next-page token.
    pub next_token_path: Option<String>,
    pub cursor_field: String,
    pub cursor_kind: RestCursorKind,
    #[serde(default)]
    pub order: FeedOrder,
}

fn default_partitions() -> Vec<String> {
    vec![String::new()]
}

impl RestCursorConfig {
    /// Typed view of a job's `source.config` block.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or mistyped.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid rest_cursor config: {e}"))
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.url.trim().is_empty() {
            errors.push("rest_cursor: url must not be empty".to_string());
        }
        if self.cursor_field.trim().is_empty() {
            errors.push("rest_cursor: cursor_field must not be empty".to_string());
        }
        if self.partitions.is_empty() {
            errors.push("rest_cursor: partitions must not be empty".to_string());
        }
        if self.partitions.len() > 1 && !self.url.contains("{partition}") {
            errors.push(
                "rest_cursor: multiple partitions require a '{partition}' placeholder in url"
                    .to_string(),
            );
        }
        if self.page_size == Some(0) {
            errors.push("rest_cursor: page_size must be at least 1".to_string());
        }
        for (name, pointer) in [
            ("records_path", Some(self.records_path.as_str())),
            ("next_token_path", self.next_token_path.as_deref()),
        ] {
            if let Some(p) = pointer {
                if !p.is_empty() && !p.starts_with('/') {
                    errors.push(format!("rest_cursor: {name} '{p}' must be a JSON pointer"));
                }
            }
        }
    }

    /// Read and type the cursor of one listing record.
    ///
    /// # Errors
    ///
    /// Returns a `data` error if the field is missing or has the wrong shape.
    pub fn cursor_of(&self, record: &Value) -> Result<Cursor, ConnectorError> {
        let raw = record
            .get(&self.cursor_field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                ConnectorError::data(
                    "MISSING_CURSOR",
                    format!("record has no '{}' field", self.cursor_field),
                )
            })?;
        let invalid = |reason: &str| {
            ConnectorError::data(
                "INVALID_CURSOR",
                format!("cursor field '{}' = {raw}: {reason}", self.cursor_field),
            )
        };
        match self.cursor_kind {
            RestCursorKind::Offset => match raw {
                Value::Number(n) => n.as_i64().map(Cursor::Offset).ok_or_else(|| invalid("not an integer")),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Cursor::Offset)
                    .map_err(|_| invalid("not an integer")),
                _ => Err(invalid("not an integer")),
            },
            RestCursorKind::Timestamp => raw
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| Cursor::Timestamp(dt.with_timezone(&Utc)))
                .ok_or_else(|| invalid("not an RFC 3339 timestamp")),
            RestCursorKind::EpochSeconds => {
                let secs = match raw {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                secs.and_then(|s| DateTime::from_timestamp(s, 0))
                    .map(Cursor::Timestamp)
                    .ok_or_else(|| invalid("not epoch seconds"))
            }
            RestCursorKind::Token => match raw {
                Value::String(s) => Ok(Cursor::Token(s.clone())),
                Value::Number(n) => Ok(Cursor::Token(n.to_string())),
                _ => Err(invalid("not a string")),
            },
        }
    }

    /// Render a cursor the way the upstream expects it in `since_param`.
    #[must_use]
    pub fn since_value(&self, cursor: &Cursor) -> String {
        match (self.cursor_kind, cursor) {
            (RestCursorKind::EpochSeconds, Cursor::Timestamp(ts)) => ts.timestamp().to_string(),
            _ => cursor.encode(),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    pub next_token: Option<String>,
}

/// Upstream collaborator: one paginated listing endpoint.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn fetch_page(
        &self,
        partition: &str,
        since: Option<&Cursor>,
        token: Option<&str>,
    ) -> Result<Page, ConnectorError>;
}

/// [`PageClient`] over plain HTTP GET + JSON.
pub struct HttpPageClient {
    http: reqwest::Client,
    config: RestCursorConfig,
}

impl HttpPageClient {
    #[must_use]
    pub fn new(http: reqwest::Client, config: RestCursorConfig) -> Self {
        Self { http, config }
    }

    fn page_url(&self, partition: &str) -> String {
        self.config.url.replace("{partition}", partition)
    }
}

#[async_trait]
impl PageClient for HttpPageClient {
    async fn fetch_page(
        &self,
        partition: &str,
        since: Option<&Cursor>,
        token: Option<&str>,
    ) -> Result<Page, ConnectorError> {
        let mut query: Vec<(String, String)> = Vec::new();
        if let (Some(param), Some(cursor)) = (&self.config.since_param, since) {
            query.push((param.clone(), self.config.since_value(cursor)));
        }
        if let (Some(param), Some(token)) = (&self.config.page_param, token) {
            query.push((param.clone(), token.to_string()));
        }
        if let (Some(param), Some(size)) = (&self.config.limit_param, self.config.page_size) {
            query.push((param.clone(), size.to_string()));
        }

        let mut request = self.http.get(self.page_url(partition)).query(&query);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        let body = http::send_json(request).await?;
        parse_page(&body, &self.config.records_path, self.config.next_token_path.as_deref())
    }
}

/// Split a listing body into records and the next-page token.
///
/// # Errors
///
/// Returns a `data` error if `records_path` does not point at an array.
pub fn parse_page(
    body: &Value,
    records_path: &str,
    next_token_path: Option<&str>,
) -> Result<Page, ConnectorError> {
    let records = match body.pointer(records_path) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None if !records_path.is_empty() => Vec::new(),
        _ => {
            return Err(ConnectorError::data(
                "UNEXPECTED_SHAPE",
                format!("'{records_path}' is not an array of records"),
            ))
        }
    };
    let next_token = next_token_path
        .and_then(|p| body.pointer(p))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    Ok(Page {
        records,
        next_token,
    })
}

/// Drives a [`PageClient`] per partition.
pub struct RestCursorFetcher {
    client: Arc<dyn PageClient>,
    config: RestCursorConfig,
    policy: RetryPolicy,
}

impl RestCursorFetcher {
    #[must_use]
    pub fn new(client: Arc<dyn PageClient>, config: RestCursorConfig, policy: RetryPolicy) -> Self {
        Self {
            client,
            config,
            policy,
        }
    }
}

fn kind_mismatch(err: &CursorError) -> ConnectorError {
    ConnectorError::config("CURSOR_KIND_MISMATCH", err.to_string())
}

#[async_trait]
impl UnitFetcher for RestCursorFetcher {
    async fn discover(&self, _resume_from: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
        Ok(self.config.partitions.clone())
    }

    async fn fetch_unit(
        &self,
        unit: &SubUnit,
        resume_from: Option<&Cursor>,
        emitter: &UnitEmitter,
    ) -> Result<(), ConnectorError> {
        let partition = unit.label.as_str();
        let mut token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();
        let mut pending: Vec<(Value, Cursor)> = Vec::new();
        let mut pages = 0u64;

        'pages: loop {
            let page = call_with_retry(&self.policy, "fetch_page", || {
                self.client.fetch_page(partition, resume_from, token.as_deref())
            })
            .await?;
            pages += 1;

            for payload in page.records {
                let cursor = match self.config.cursor_of(&payload) {
                    Ok(cursor) => cursor,
                    Err(err) => {
                        let error = SchemaError::new(&self.config.cursor_field, err.message);
                        emitter.reject(payload, error).await?;
                        continue;
                    }
                };
                let fresh = cursor.is_after(resume_from).map_err(|e| kind_mismatch(&e))?;
                match self.config.order {
                    FeedOrder::Ascending if fresh => emitter.emit(payload, Some(cursor)).await?,
                    FeedOrder::Ascending => {}
                    FeedOrder::Descending if fresh => pending.push((payload, cursor)),
                    FeedOrder::Descending => break 'pages,
                }
            }

            match page.next_token {
                Some(next) if seen_tokens.insert(next.clone()) => token = Some(next),
                Some(repeated) => {
                    tracing::warn!(partition, token = repeated, "Continuation token repeated, ending partition");
                    break;
                }
                None => break,
            }
        }

        if !pending.is_empty() {
            pending.sort_by(|(_, a), (_, b)| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));
            for (payload, cursor) in pending {
                emitter.emit(payload, Some(cursor)).await?;
            }
        }

        tracing::debug!(partition, pages, "Partition exhausted");
        Ok(())
    }
}
