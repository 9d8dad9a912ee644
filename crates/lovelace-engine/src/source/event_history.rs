//! Time-bounded event history adapter (chat servers).
//!
//! `mode: messages` treats every readable text channel as a sub-unit and
//! pages its history oldest-first inside `[max(resume, start), end)`.
//! `mode: channels` is a single sub-unit listing channel metadata, with no
//! cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lovelace_types::cursor::Cursor;
use lovelace_types::error::{ConnectorError, SchemaError};
use lovelace_types::record::format_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::driver::{SubUnit, UnitEmitter, UnitFetcher};
use crate::http;
use crate::retry::{call_with_retry, RetryPolicy};

/// First millisecond of 2015, the origin of Discord snowflakes.
pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;
/// Upper bound the messages endpoint accepts for `limit`.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Guild text and announcement channels.
const READABLE_CHANNEL_TYPES: [u8; 2] = [0, 5];
const CHANNELS_UNIT: &str = "channels";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    #[default]
    Messages,
    Channels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventHistoryConfig {
    /// Bot token, without the `Bot ` prefix.
    pub token: String,
    pub guild_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub mode: HistoryMode,
    /// Restrict to these channel ids; empty means every readable channel.
    #[serde(default)]
    pub channels: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

impl EventHistoryConfig {
    /// Typed view of a job's `source.config` block.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or mistyped.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid event_history config: {e}"))
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.token.trim().is_empty() {
            errors.push("event_history: token must not be empty".to_string());
        }
        if self.guild_id.trim().is_empty() {
            errors.push("event_history: guild_id must not be empty".to_string());
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            errors.push(format!(
                "event_history: page_size must be between 1 and {MAX_PAGE_SIZE}"
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                errors.push("event_history: start must be before end".to_string());
            }
        }
    }
}

/// Channel as listed by the guild channels endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub topic: Option<String>,
}

impl Channel {
    fn is_readable(&self) -> bool {
        READABLE_CHANNEL_TYPES.contains(&self.kind)
    }
}

/// Upstream collaborator: guild channel listing and per-channel history.
#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>, ConnectorError>;

    /// Up to `limit` raw messages with snowflake id greater than `after`,
    /// in any order.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        after: u64,
        limit: u32,
    ) -> Result<Vec<Value>, ConnectorError>;
}

/// [`HistoryClient`] over the Discord REST API with a bot token.
pub struct DiscordHistoryClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    guild_id: String,
}

impl DiscordHistoryClient {
    #[must_use]
    pub fn new(http: reqwest::Client, config: &EventHistoryConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            guild_id: config.guild_id.clone(),
        }
    }

    fn authorized(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
    }
}

#[async_trait]
impl HistoryClient for DiscordHistoryClient {
    async fn list_channels(&self) -> Result<Vec<Channel>, ConnectorError> {
        let url = format!("{}/guilds/{}/channels", self.api_base, self.guild_id);
        let body = http::send_json(self.authorized(url)).await?;
        serde_json::from_value(body).map_err(|e| {
            ConnectorError::data("UNEXPECTED_SHAPE", format!("channel listing: {e}"))
        })
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        after: u64,
        limit: u32,
    ) -> Result<Vec<Value>, ConnectorError> {
        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let request = self
            .authorized(url)
            .query(&[("after", after.to_string()), ("limit", limit.to_string())]);
        match http::send_json(request).await? {
            Value::Array(messages) => Ok(messages),
            other => Err(ConnectorError::data(
                "UNEXPECTED_SHAPE",
                format!("message page is not an array: {other}"),
            )),
        }
    }
}

/// Smallest snowflake strictly before any message created at or after `ts`.
#[must_use]
pub fn snowflake_after(ts: DateTime<Utc>) -> u64 {
    let ms = ts.timestamp_millis() - DISCORD_EPOCH_MS;
    if ms <= 0 {
        0
    } else {
        u64::try_from(ms).map_or(0, |ms| ms << 22)
    }
}

fn snowflake_of(message: &Value) -> Option<u64> {
    message.get("id")?.as_str()?.parse().ok()
}

fn field_or_null(value: &Value, key: &str) -> Value {
    value
        .get(key)
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null)
}

/// Reshape a raw Discord message into the backfill payload.
///
/// # Errors
///
/// Returns a `data` error if the message has no parseable `timestamp`.
pub fn serialize_message(
    message: &Value,
    channel: &Channel,
    guild_id: &str,
) -> Result<(Value, DateTime<Utc>), ConnectorError> {
    let created_at = message
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            ConnectorError::data(
                "INVALID_MESSAGE",
                format!("message {} has no valid timestamp", field_or_null(message, "id")),
            )
        })?;
    let edited_at = message
        .get("edited_timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| Value::String(format_timestamp(&dt.with_timezone(&Utc))))
        .unwrap_or(Value::Null);

    let author = message.get("author").cloned().unwrap_or(Value::Null);
    let username = field_or_null(&author, "username");
    let display_name = author
        .get("global_name")
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| username.clone());

    let attachments: Vec<Value> = message
        .get("attachments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|a| {
                    json!({
                        "id": field_or_null(a, "id"),
                        "url": field_or_null(a, "url"),
                        "filename": field_or_null(a, "filename"),
                        "content_type": field_or_null(a, "content_type"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let reactions: Vec<Value> = message
        .get("reactions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|r| {
                    let emoji = r.get("emoji").cloned().unwrap_or(Value::Null);
                    let label = match (emoji.get("name").and_then(Value::as_str), emoji.get("id").and_then(Value::as_str)) {
                        (Some(name), Some(id)) => format!("<:{name}:{id}>"),
                        (Some(name), None) => name.to_string(),
                        _ => String::new(),
                    };
                    json!({"emoji": label, "count": field_or_null(r, "count")})
                })
                .collect()
        })
        .unwrap_or_default();
    let mentions: Vec<Value> = message
        .get("mentions")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|u| field_or_null(u, "id")).collect())
        .unwrap_or_default();

    let payload = json!({
        "id": field_or_null(message, "id"),
        "channel_id": channel.id,
        "channel_name": channel.name.clone().unwrap_or_else(|| "unknown".to_string()),
        "guild_id": guild_id,
        "author": {
            "id": field_or_null(&author, "id"),
            "name": username,
            "discriminator": field_or_null(&author, "discriminator"),
            "bot": author.get("bot").and_then(Value::as_bool).unwrap_or(false),
            "display_name": display_name,
        },
        "content": field_or_null(message, "content"),
        "created_at": format_timestamp(&created_at),
        "edited_at": edited_at,
        "attachments": attachments,
        "embeds": message.get("embeds").cloned().unwrap_or_else(|| json!([])),
        "reactions": reactions,
        "mentions": mentions,
        "source": "backfill",
    });
    Ok((payload, created_at))
}

fn channel_payload(channel: &Channel, guild_id: &str) -> Value {
    json!({
        "id": channel.id,
        "name": channel.name,
        "type": channel.kind,
        "parent_id": channel.parent_id,
        "position": channel.position,
        "nsfw": channel.nsfw,
        "topic": channel.topic,
        "guild_id": guild_id,
    })
}

/// Drives a [`HistoryClient`] across the guild's channels.
pub struct EventHistoryFetcher {
    client: Arc<dyn HistoryClient>,
    config: EventHistoryConfig,
    policy: RetryPolicy,
    /// Exclusive upper bound of the history window.
    end: DateTime<Utc>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl EventHistoryFetcher {
    /// `end` defaults to the moment the fetcher is built, i.e. run start.
    #[must_use]
    pub fn new(client: Arc<dyn HistoryClient>, config: EventHistoryConfig, policy: RetryPolicy) -> Self {
        let end = config.end.unwrap_or_else(Utc::now);
        Self {
            client,
            config,
            policy,
            end,
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, ConnectorError> {
        call_with_retry(&self.policy, "list_channels", || self.client.list_channels()).await
    }

    fn channel(&self, id: &str) -> Result<Channel, ConnectorError> {
        let channels = self
            .channels
            .lock()
            .map_err(|_| ConnectorError::internal("LOCK_POISONED", "channel cache lock poisoned"))?;
        channels
            .get(id)
            .cloned()
            .ok_or_else(|| ConnectorError::internal("UNKNOWN_CHANNEL", format!("channel {id} was not discovered")))
    }

    async fn emit_channels(&self, emitter: &UnitEmitter) -> Result<(), ConnectorError> {
        let channels = self.list_channels().await?;
        for channel in &channels {
            emitter
                .emit(channel_payload(channel, &self.config.guild_id), None)
                .await?;
        }
        tracing::info!(guild = self.config.guild_id, channels = channels.len(), "Listed channels");
        Ok(())
    }

    async fn emit_history(
        &self,
        channel: &Channel,
        resume_from: Option<&Cursor>,
        emitter: &UnitEmitter,
    ) -> Result<(), ConnectorError> {
        let resume_ts = match resume_from {
            None => None,
            Some(Cursor::Timestamp(ts)) => Some(*ts),
            Some(other) => {
                return Err(ConnectorError::config(
                    "CURSOR_KIND_MISMATCH",
                    format!("event history resumes from timestamps, got {other}"),
                ))
            }
        };
        let lower = match (resume_ts, self.config.start) {
            (Some(r), Some(s)) => Some(r.max(s)),
            (r, s) => r.or(s),
        };
        let mut after = lower.map_or(0, snowflake_after);
        let page_size = self.config.page_size.clamp(1, MAX_PAGE_SIZE);
        let mut count = 0u64;

        loop {
            let mut page = call_with_retry(&self.policy, "fetch_messages", || {
                self.client.fetch_messages(&channel.id, after, page_size)
            })
            .await?;
            if page.is_empty() {
                break;
            }
            page.sort_by_key(|m| snowflake_of(m).unwrap_or(0));
            let full_page = page.len() >= page_size as usize;
            let mut reached_end = false;

            for message in &page {
                let (payload, created_at) =
                    match serialize_message(message, channel, &self.config.guild_id) {
                        Ok(serialized) => serialized,
                        Err(err) => {
                            let error = SchemaError::new("timestamp", err.message);
                            emitter.reject(message.clone(), error).await?;
                            continue;
                        }
                    };
                if created_at >= self.end {
                    reached_end = true;
                    break;
                }
                if self.config.start.is_some_and(|s| created_at < s) {
                    continue;
                }
                if resume_ts.is_some_and(|r| created_at <= r) {
                    continue;
                }
                emitter.emit(payload, Some(Cursor::Timestamp(created_at))).await?;
                count += 1;
            }

            let last = page.last().and_then(snowflake_of).unwrap_or(after);
            if reached_end || !full_page || last <= after {
                break;
            }
            after = last;
        }

        tracing::info!(
            channel = channel.name.as_deref().unwrap_or("unknown"),
            channel_id = channel.id,
            messages = count,
            "Channel history read"
        );
        Ok(())
    }
}

#[async_trait]
impl UnitFetcher for EventHistoryFetcher {
    async fn discover(&self, _resume_from: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
        if self.config.mode == HistoryMode::Channels {
            return Ok(vec![CHANNELS_UNIT.to_string()]);
        }
        let listed = self.list_channels().await?;
        let wanted: Vec<Channel> = listed
            .into_iter()
            .filter(Channel::is_readable)
            .filter(|c| self.config.channels.is_empty() || self.config.channels.contains(&c.id))
            .collect();
        let labels = wanted.iter().map(|c| c.id.clone()).collect();
        let mut cache = self
            .channels
            .lock()
            .map_err(|_| ConnectorError::internal("LOCK_POISONED", "channel cache lock poisoned"))?;
        cache.clear();
        cache.extend(wanted.into_iter().map(|c| (c.id.clone(), c)));
        Ok(labels)
    }

    async fn fetch_unit(
        &self,
        unit: &SubUnit,
        resume_from: Option<&Cursor>,
        emitter: &UnitEmitter,
    ) -> Result<(), ConnectorError> {
        match self.config.mode {
            HistoryMode::Channels => self.emit_channels(emitter).await,
            HistoryMode::Messages => {
                let channel = self.channel(&unit.label)?;
                self.emit_history(&channel, resume_from, emitter).await
            }
        }
    }
}
