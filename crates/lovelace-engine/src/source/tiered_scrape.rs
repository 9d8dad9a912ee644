//! Tiered-escalation scraping.
//!
//! A [`TieredScraper`] tries an ordered list of strategies of increasing
//! cost for one target and stops at the first point where every required
//! field is known. Fields merge first-writer-wins over non-null values.
//! Strategy failures are recorded in the outcome and never abort the
//! scrape: an exhausted chain still returns the partial record together
//! with the fields it could not find.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lovelace_types::cursor::Cursor;
use lovelace_types::error::ConnectorError;
use lovelace_types::record::{format_timestamp, ID_FIELD, SOURCE_TIMESTAMP_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::driver::{SubUnit, UnitEmitter, UnitFetcher};
use super::zyte::ZyteStrategyConfig;
use crate::retry::{call_with_retry, RetryPolicy};

/// Field added to incomplete scrape records.
pub const MISSING_FIELDS_FIELD: &str = "missing_fields";

pub type FieldMap = Map<String, Value>;

/// One extraction strategy for a single target.
#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Per-call deadline when the strategy needs more than the job default.
    fn call_timeout(&self) -> Option<Duration> {
        None
    }

    /// Whatever fields this strategy could find. Null values count as
    /// not found.
    async fn attempt(&self, target: &str) -> Result<FieldMap, ConnectorError>;
}

/// What one strategy contributed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    /// Fields this attempt was first to supply.
    pub fields_found: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectorError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeOutcome {
    pub target: String,
    pub fields: FieldMap,
    pub missing_fields: Vec<String>,
    pub attempted: Vec<StrategyAttempt>,
}

impl ScrapeOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_fields.is_empty()
    }

    /// The run-scoped error (bad credentials, bad config) when every
    /// attempt failed with one.
    #[must_use]
    pub fn run_scoped_failure(&self) -> Option<&ConnectorError> {
        if self.attempted.is_empty() || !self.fields.is_empty() {
            return None;
        }
        let all_run_scoped = self.attempted.iter().all(|a| {
            a.error
                .as_ref()
                .is_some_and(|e| e.category.is_run_scoped())
        });
        if all_run_scoped {
            self.attempted[0].error.as_ref()
        } else {
            None
        }
    }

    /// The outcome as a raw record payload: scraped fields, `id` = target,
    /// scrape time as `source_timestamp`, nulls plus `missing_fields` for
    /// anything not found.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut payload = self.fields.clone();
        for field in &self.missing_fields {
            payload.entry(field.clone()).or_insert(Value::Null);
        }
        if !self.missing_fields.is_empty() {
            payload.insert(
                MISSING_FIELDS_FIELD.to_string(),
                Value::from(self.missing_fields.clone()),
            );
        }
        payload.insert(ID_FIELD.to_string(), Value::String(self.target.clone()));
        payload.insert(
            SOURCE_TIMESTAMP_FIELD.to_string(),
            Value::String(format_timestamp(&Utc::now())),
        );
        Value::Object(payload)
    }
}

/// Ordered fallback chain over [`ScrapeStrategy`] implementations.
pub struct TieredScraper {
    strategies: Vec<Arc<dyn ScrapeStrategy>>,
    required_fields: Vec<String>,
    policy: RetryPolicy,
}

impl TieredScraper {
    #[must_use]
    pub fn new(
        strategies: Vec<Arc<dyn ScrapeStrategy>>,
        required_fields: Vec<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            strategies,
            required_fields,
            policy,
        }
    }

    fn missing(&self, fields: &FieldMap) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|f| fields.get(f.as_str()).map_or(true, Value::is_null))
            .cloned()
            .collect()
    }

    pub async fn scrape(&self, target: &str) -> ScrapeOutcome {
        let mut fields = FieldMap::new();
        let mut attempted: Vec<StrategyAttempt> = Vec::new();

        for strategy in &self.strategies {
            let policy = RetryPolicy {
                call_timeout: strategy.call_timeout().unwrap_or(self.policy.call_timeout),
                ..self.policy
            };
            match call_with_retry(&policy, strategy.name(), || strategy.attempt(target)).await {
                Ok(found) => {
                    let mut fields_found = Vec::new();
                    for (name, value) in found {
                        if value.is_null() || fields.get(&name).is_some_and(|v| !v.is_null()) {
                            continue;
                        }
                        fields.insert(name.clone(), value);
                        fields_found.push(name);
                    }
                    tracing::debug!(
                        scrape_target = target,
                        strategy = strategy.name(),
                        found = fields_found.len(),
                        "Strategy finished"
                    );
                    attempted.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        fields_found,
                        error: None,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        scrape_target = target,
                        strategy = strategy.name(),
                        error = %err,
                        "Strategy failed, escalating"
                    );
                    attempted.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        fields_found: Vec::new(),
                        error: Some(err),
                    });
                }
            }
            let succeeded = attempted.last().is_some_and(|a| a.error.is_none());
            if succeeded && self.missing(&fields).is_empty() {
                break;
            }
        }

        let missing_fields = self.missing(&fields);
        if !missing_fields.is_empty() {
            tracing::warn!(
                scrape_target = target,
                missing = ?missing_fields,
                "Strategies exhausted with fields missing"
            );
        }
        ScrapeOutcome {
            target: target.to_string(),
            fields,
            missing_fields,
            attempted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TieredScrapeConfig {
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    pub strategies: Vec<ZyteStrategyConfig>,
}

fn default_endpoint() -> String {
    "https://api.zyte.com/v1/extract".to_string()
}

impl TieredScrapeConfig {
    /// Typed view of a job's `source.config` block.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or mistyped.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid tiered_scrape config: {e}"))
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.api_key.trim().is_empty() {
            errors.push("tiered_scrape: api_key must not be empty".to_string());
        }
        if self.strategies.is_empty() {
            errors.push("tiered_scrape: at least one strategy is required".to_string());
        }
        if self.targets.iter().any(|t| t.trim().is_empty()) {
            errors.push("tiered_scrape: targets must not be empty strings".to_string());
        }
        for (i, strategy) in self.strategies.iter().enumerate() {
            strategy.validate(&format!("tiered_scrape.strategies[{i}]"), errors);
        }
    }
}

/// Source adapter face of a [`TieredScraper`]: one sub-unit and one
/// cursor-less record per target.
pub struct TieredScrapeFetcher {
    scraper: Arc<TieredScraper>,
    targets: Vec<String>,
}

impl TieredScrapeFetcher {
    #[must_use]
    pub fn new(scraper: Arc<TieredScraper>, targets: Vec<String>) -> Self {
        Self { scraper, targets }
    }
}

#[async_trait]
impl UnitFetcher for TieredScrapeFetcher {
    async fn discover(&self, _resume_from: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
        Ok(self.targets.clone())
    }

    async fn fetch_unit(
        &self,
        unit: &SubUnit,
        _resume_from: Option<&Cursor>,
        emitter: &UnitEmitter,
    ) -> Result<(), ConnectorError> {
        let outcome = self.scraper.scrape(&unit.label).await;
        if let Some(err) = outcome.run_scoped_failure() {
            return Err(err.clone());
        }
        emitter.emit(outcome.to_payload(), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedStrategy {
        name: &'static str,
        result: Result<FieldMap, ConnectorError>,
        calls: AtomicU32,
    }

    impl FixedStrategy {
        fn ok(name: &'static str, fields: Value) -> Arc<Self> {
            let Value::Object(map) = fields else { panic!("object expected") };
            Arc::new(Self {
                name,
                result: Ok(map),
                calls: AtomicU32::new(0),
            })
        }

        fn failing(name: &'static str, err: ConnectorError) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Err(err),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScrapeStrategy for FixedStrategy {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt(&self, _target: &str) -> Result<FieldMap, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            call_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    fn scraper(strategies: Vec<Arc<FixedStrategy>>, required: &[&str]) -> TieredScraper {
        TieredScraper::new(
            strategies.into_iter().map(|s| s as Arc<dyn ScrapeStrategy>).collect(),
            required.iter().map(|s| (*s).to_string()).collect(),
            policy(),
        )
    }

    #[tokio::test]
    async fn complete_first_tier_short_circuits() {
        let api = FixedStrategy::ok("api", serde_json::json!({"critic": 84, "player": 71}));
        let page = FixedStrategy::ok("static", serde_json::json!({"player": 1}));
        let browser = FixedStrategy::ok("browser", serde_json::json!({"player": 2}));
        let s = scraper(vec![api.clone(), page.clone(), browser.clone()], &["critic", "player"]);

        let outcome = s.scrape("463").await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.fields["player"], 71);
        assert_eq!(api.calls(), 1);
        assert_eq!(page.calls(), 0);
        assert_eq!(browser.calls(), 0);
    }

    #[tokio::test]
    async fn escalates_until_complete_first_writer_wins() {
        let api = FixedStrategy::ok("api", serde_json::json!({"critic": 84, "player": null}));
        let page = FixedStrategy::failing("static", ConnectorError::transient_network("HTTP_520", "ban"));
        let browser = FixedStrategy::ok("browser", serde_json::json!({"critic": 1, "player": 71}));
        let s = scraper(vec![api.clone(), page.clone(), browser.clone()], &["critic", "player"]);

        let outcome = s.scrape("463").await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.fields["critic"], 84);
        assert_eq!(outcome.fields["player"], 71);
        assert_eq!(outcome.attempted.len(), 3);
        assert!(outcome.attempted[1].error.is_some());
        assert_eq!(outcome.attempted[2].fields_found, vec!["player".to_string()]);
    }

    #[tokio::test]
    async fn exhausted_chain_keeps_partial_record() {
        let api = FixedStrategy::ok("api", serde_json::json!({"name": "Ravenswatch", "critic": 80}));
        let page = FixedStrategy::ok("static", serde_json::json!({}));
        let s = scraper(vec![api, page], &["critic", "player"]);

        let outcome = s.scrape("463").await;
        assert_eq!(outcome.missing_fields, vec!["player".to_string()]);
        let payload = outcome.to_payload();
        assert_eq!(payload["id"], "463");
        assert_eq!(payload["name"], "Ravenswatch");
        assert_eq!(payload["player"], Value::Null);
        assert_eq!(payload[MISSING_FIELDS_FIELD], serde_json::json!(["player"]));
        assert!(payload[SOURCE_TIMESTAMP_FIELD].is_string());
    }

    #[tokio::test]
    async fn all_auth_failures_are_run_scoped() {
        let s = scraper(
            vec![
                FixedStrategy::failing("api", ConnectorError::auth("HTTP_401", "bad key")),
                FixedStrategy::failing("static", ConnectorError::auth("HTTP_401", "bad key")),
            ],
            &["critic"],
        );
        let outcome = s.scrape("1").await;
        assert_eq!(outcome.run_scoped_failure().unwrap().code, "HTTP_401");

        let mixed = scraper(
            vec![
                FixedStrategy::failing("api", ConnectorError::auth("HTTP_401", "bad key")),
                FixedStrategy::failing("static", ConnectorError::timeout("T", "slow")),
            ],
            &["critic"],
        );
        assert!(mixed.scrape("1").await.run_scoped_failure().is_none());
    }

    #[tokio::test]
    async fn no_required_fields_runs_only_first_strategy() {
        let api = FixedStrategy::ok("api", serde_json::json!({"a": 1}));
        let page = FixedStrategy::ok("static", serde_json::json!({"b": 2}));
        let s = scraper(vec![api, page.clone()], &[]);
        let outcome = s.scrape("x").await;
        assert!(outcome.is_complete());
        assert_eq!(page.calls(), 0);
    }

    #[tokio::test]
    async fn no_required_fields_escalates_past_a_failed_first_strategy() {
        let api = FixedStrategy::failing("api", ConnectorError::timeout("CALL_TIMEOUT", "hung"));
        let page = FixedStrategy::ok("static", serde_json::json!({"b": 2}));
        let browser = FixedStrategy::ok("browser", serde_json::json!({"c": 3}));
        let s = scraper(vec![api, page.clone(), browser.clone()], &[]);

        let outcome = s.scrape("x").await;
        assert_eq!(page.calls(), 1);
        assert_eq!(browser.calls(), 0);
        assert_eq!(outcome.fields["b"], 2);
        assert_eq!(outcome.attempted.len(), 2);
        assert!(outcome.attempted[0].error.is_some());
    }
}
