//! Zyte extract API scrape strategy.
//!
//! `api` and `static` tiers fetch the raw response body (`httpResponseBody`,
//! base64 on the wire); the `browser` tier asks for rendered HTML with
//! JavaScript enabled and gets a longer deadline.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lovelace_types::error::ConnectorError;
use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::tiered_scrape::{FieldMap, ScrapeStrategy};
use crate::http;

const BROWSER_TIMEOUT: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZyteTier {
    /// Structured endpoint, JSON body.
    Api,
    /// Static HTML fetch.
    Static,
    /// Full browser render.
    Browser,
}

/// Field name -> extraction rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractRules {
    /// JSON pointers into a JSON body.
    #[serde(default)]
    pub json: BTreeMap<String, String>,
    /// Patterns whose first capture group is the value.
    #[serde(default)]
    pub regex: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZyteStrategyConfig {
    pub name: String,
    pub tier: ZyteTier,
    /// Page to fetch; `{target}` is substituted.
    pub url: String,
    #[serde(default)]
    pub extract: ExtractRules,
    /// Values the site uses to mean "no value" (e.g. `-1`).
    #[serde(default)]
    pub null_values: Vec<Value>,
    pub geolocation: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ZyteStrategyConfig {
    pub fn validate(&self, context: &str, errors: &mut Vec<String>) {
        if self.name.trim().is_empty() {
            errors.push(format!("{context}: name must not be empty"));
        }
        if !self.url.contains("{target}") {
            errors.push(format!("{context}: url must contain a '{{target}}' placeholder"));
        }
        if self.extract.json.is_empty() && self.extract.regex.is_empty() {
            errors.push(format!("{context}: no extract rules"));
        }
        for (field, pointer) in &self.extract.json {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                errors.push(format!("{context}: '{field}' pointer '{pointer}' must start with '/'"));
            }
        }
        for (field, pattern) in &self.extract.regex {
            match Regex::new(pattern) {
                Ok(re) if re.captures_len() < 2 => {
                    errors.push(format!("{context}: '{field}' pattern has no capture group"));
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("{context}: '{field}' pattern is invalid: {e}")),
            }
        }
        if self.timeout_secs == Some(0) {
            errors.push(format!("{context}: timeout_secs must be > 0"));
        }
    }
}

/// One configured tier against the Zyte extract endpoint.
pub struct ZyteStrategy {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    config: ZyteStrategyConfig,
    patterns: Vec<(String, Regex)>,
}

impl ZyteStrategy {
    /// # Errors
    ///
    /// Returns an error if an extract pattern does not compile.
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        config: ZyteStrategyConfig,
    ) -> anyhow::Result<Self> {
        let patterns = config
            .extract
            .regex
            .iter()
            .map(|(field, pattern)| {
                Regex::new(pattern)
                    .map(|re| (field.clone(), re))
                    .map_err(|e| anyhow::anyhow!("strategy '{}': bad pattern for '{field}': {e}", config.name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            config,
            patterns,
        })
    }

    fn request_body(&self, target: &str) -> Value {
        let url = self.config.url.replace("{target}", target);
        let mut body = match self.config.tier {
            ZyteTier::Api | ZyteTier::Static => json!({"url": url, "httpResponseBody": true}),
            ZyteTier::Browser => json!({"url": url, "browserHtml": true, "javascript": true}),
        };
        if let Some(geo) = &self.config.geolocation {
            body["geolocation"] = Value::String(geo.clone());
        }
        body
    }
}

#[async_trait]
impl ScrapeStrategy for ZyteStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn call_timeout(&self) -> Option<Duration> {
        Some(self.config.timeout_secs.map_or_else(
            || match self.config.tier {
                ZyteTier::Browser => BROWSER_TIMEOUT,
                ZyteTier::Api | ZyteTier::Static => FETCH_TIMEOUT,
            },
            Duration::from_secs,
        ))
    }

    async fn attempt(&self, target: &str) -> Result<FieldMap, ConnectorError> {
        let request = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.api_key, Some(""))
            .json(&self.request_body(target));
        let response = http::send_json(request).await?;
        let text = page_text(self.config.tier, &response)?;
        Ok(extract_fields(
            &self.config.extract.json,
            &self.patterns,
            &self.config.null_values,
            &text,
        ))
    }
}

/// Pull the page out of an extract response, surfacing the target site's
/// own error status.
///
/// # Errors
///
/// Returns a classified error for target-side HTTP failures, and a `data`
/// error when the expected body is absent or undecodable.
pub fn page_text(tier: ZyteTier, response: &Value) -> Result<String, ConnectorError> {
    if let Some(code) = response.get("statusCode").and_then(Value::as_u64) {
        let status = u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok());
        if let Some(status) = status.filter(|s| !s.is_success()) {
            return Err(http::classify_status(status, &HeaderMap::new(), "target site error"));
        }
    }
    match tier {
        ZyteTier::Browser => response
            .get("browserHtml")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::data("MISSING_BODY", "response has no browserHtml")),
        ZyteTier::Api | ZyteTier::Static => {
            let encoded = response
                .get("httpResponseBody")
                .and_then(Value::as_str)
                .ok_or_else(|| ConnectorError::data("MISSING_BODY", "response has no httpResponseBody"))?;
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| ConnectorError::data("INVALID_BODY", format!("body is not base64: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|e| ConnectorError::data("INVALID_BODY", format!("body is not UTF-8: {e}")))
        }
    }
}

/// Apply extract rules to a page. Unmatched rules yield nothing; values
/// listed in `null_values` become null.
#[must_use]
pub fn extract_fields(
    pointers: &BTreeMap<String, String>,
    patterns: &[(String, Regex)],
    null_values: &[Value],
    text: &str,
) -> FieldMap {
    let mut fields = FieldMap::new();
    let nullify = |v: Value| if null_values.contains(&v) { Value::Null } else { v };

    if !pointers.is_empty() {
        if let Ok(doc) = serde_json::from_str::<Value>(text) {
            for (field, pointer) in pointers {
                if let Some(v) = doc.pointer(pointer) {
                    fields.insert(field.clone(), nullify(v.clone()));
                }
            }
        }
    }

    for (field, re) in patterns {
        let captured = re
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        if let Some(raw) = captured {
            fields.insert(field.clone(), nullify(typed_capture(&raw)));
        }
    }
    fields
}

/// Numeric captures become numbers (thousands separators dropped).
fn typed_capture(raw: &str) -> Value {
    let compact = raw.replace(',', "");
    if let Ok(i) = compact.parse::<i64>() {
        return Value::from(i);
    }
    if let Some(n) = compact.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}
