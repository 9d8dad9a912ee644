//! Semantic validation for parsed job configuration values.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::types::{DestinationKind, JobConfig, SourceKind, StateBackendKind};
use crate::normalize::snake_case;
use crate::sink::{BrokerConfig, ClickHouseConfig, PostgresSinkConfig};
use crate::source::event_history::EventHistoryConfig;
use crate::source::rest_cursor::RestCursorConfig;
use crate::source::tiered_scrape::TieredScrapeConfig;

/// Deserialize a kind-specific block and run its own checks, recording a
/// parse failure as one more validation error.
fn validate_block<T>(
    value: &Value,
    parse: fn(&Value) -> Result<T>,
    check: fn(&T, &mut Vec<String>),
    errors: &mut Vec<String>,
) {
    match parse(value) {
        Ok(block) => check(&block, errors),
        Err(e) => errors.push(e.to_string()),
    }
}

fn validate_source(config: &JobConfig, errors: &mut Vec<String>) {
    let value = &config.source.config;
    match config.source.kind {
        SourceKind::RestCursor => validate_block(
            value,
            RestCursorConfig::from_value,
            RestCursorConfig::validate,
            errors,
        ),
        SourceKind::EventHistory => validate_block(
            value,
            EventHistoryConfig::from_value,
            EventHistoryConfig::validate,
            errors,
        ),
        SourceKind::TieredScrape => match TieredScrapeConfig::from_value(value) {
            Ok(block) => {
                block.validate(errors);
                if block.targets.is_empty() {
                    errors.push(
                        "tiered_scrape: a scrape job needs at least one target".to_string(),
                    );
                }
            }
            Err(e) => errors.push(e.to_string()),
        },
    }
}

fn validate_destination(config: &JobConfig, errors: &mut Vec<String>) {
    let value = &config.destination.config;
    match config.destination.kind {
        DestinationKind::Broker => {
            validate_block(value, BrokerConfig::from_value, BrokerConfig::validate, errors);
        }
        DestinationKind::Postgres => validate_block(
            value,
            PostgresSinkConfig::from_value,
            PostgresSinkConfig::validate,
            errors,
        ),
        DestinationKind::Clickhouse => validate_block(
            value,
            ClickHouseConfig::from_value,
            ClickHouseConfig::validate,
            errors,
        ),
    }
}

/// Validate a parsed job configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the job config.
pub fn validate_job(config: &JobConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported job version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.job.trim().is_empty() {
        errors.push("Job name must not be empty".to_string());
    }

    if config.source.id.trim().is_empty() {
        errors.push("Source id must not be empty".to_string());
    }

    let normalize = &config.normalize;
    for (field, label) in [
        (&normalize.id_field, "id_field"),
        (&normalize.timestamp_field, "timestamp_field"),
    ] {
        if snake_case(field).is_empty() {
            errors.push(format!("normalize.{label} must name a field"));
        }
    }
    for key in normalize.context.keys() {
        let key = snake_case(key);
        if key.is_empty() {
            errors.push("normalize.context keys must not be empty".to_string());
        } else if key == snake_case(&normalize.id_field)
            || key == snake_case(&normalize.timestamp_field)
        {
            errors.push(format!(
                "normalize.context field '{key}' collides with the record id or timestamp field"
            ));
        }
    }
    for (path, target) in &normalize.mapping {
        if path.trim().is_empty() || snake_case(target).is_empty() {
            errors.push(format!(
                "normalize.mapping entry '{path}' -> '{target}' must name both fields"
            ));
        }
    }

    if config.sink.max_batch_records == 0 {
        errors.push("sink.max_batch_records must be at least 1".to_string());
    }
    if config.sink.max_delivery_attempts == 0 {
        errors.push("sink.max_delivery_attempts must be at least 1".to_string());
    }

    if config.resources.parallelism == 0 {
        errors.push("resources.parallelism must be at least 1".to_string());
    }
    if config.resources.call_timeout_secs == 0 {
        errors.push("resources.call_timeout_secs must be > 0".to_string());
    }
    if config.resources.max_call_attempts == 0 {
        errors.push("resources.max_call_attempts must be at least 1".to_string());
    }
    if config.resources.initial_backoff_ms > config.resources.max_backoff_ms {
        errors.push("resources.initial_backoff_ms must not exceed max_backoff_ms".to_string());
    }

    if config.state.lease_ttl_secs == 0 {
        errors.push("state.lease_ttl_secs must be > 0".to_string());
    }
    if config.state.backend == StateBackendKind::Postgres
        && config.state.connection.as_deref().map_or(true, |c| c.trim().is_empty())
    {
        errors.push("state.connection is required for the postgres backend".to_string());
    }

    validate_source(config, &mut errors);
    validate_destination(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Job validation failed:\n  - {}", errors.join("\n  - "));
    }
}
