use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use lovelace_engine::config::types::SourceKind;
use lovelace_engine::http::build_client;
use lovelace_engine::resolve::build_scraper;
use lovelace_engine::retry::RetryPolicy;
use lovelace_engine::source::tiered_scrape::TieredScrapeConfig;

/// Execute the `scrape` command: run the tiered strategies of a job against
/// one target and print the outcome as JSON.
pub async fn execute(job_path: &Path, target: &str) -> Result<()> {
    let config = super::load_job(job_path)?;
    if config.source.kind != SourceKind::TieredScrape {
        anyhow::bail!(
            "Job '{}' has source kind '{}', scrape needs 'tiered_scrape'",
            config.job,
            config.source.kind.as_str()
        );
    }

    let block = TieredScrapeConfig::from_value(&config.source.config)?;
    let http = build_client(Duration::from_secs(config.resources.call_timeout_secs))?;
    let scraper = build_scraper(&block, &http, RetryPolicy::from_resources(&config.resources))
        .context("Failed to build scrape strategies")?;

    let outcome = scraper.scrape(target).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let Some(err) = outcome.run_scoped_failure() {
        anyhow::bail!("Scrape of '{target}' failed: {err}");
    }
    if !outcome.is_complete() {
        tracing::warn!(
            scrape_target = target,
            missing = ?outcome.missing_fields,
            "Scrape incomplete"
        );
    }
    Ok(())
}
