//! Component construction from a validated [`JobConfig`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lovelace_state::{CheckpointStore, PostgresCheckpointStore, SqliteCheckpointStore};

use crate::config::types::{
    DestinationConfig, DestinationKind, JobConfig, SourceKind, StateBackendKind, StateConfig,
};
use crate::retry::RetryPolicy;
use crate::sink::{
    BrokerConfig, BrokerDestination, ClickHouseConfig, ClickHouseWarehouse, Destination,
    PostgresSinkConfig, PostgresWarehouse, RestProxyProducer,
};
use crate::source::event_history::{DiscordHistoryClient, EventHistoryConfig, EventHistoryFetcher};
use crate::source::rest_cursor::{HttpPageClient, RestCursorConfig, RestCursorFetcher};
use crate::source::tiered_scrape::{
    ScrapeStrategy, TieredScrapeConfig, TieredScrapeFetcher, TieredScraper,
};
use crate::source::zyte::ZyteStrategy;
use crate::source::{DrivenSource, DriverSettings, SourceAdapter, UnitFetcher};

/// Open the configured checkpoint store.
///
/// Blocking; call through `spawn_blocking` from async code (the Postgres
/// backend drives its own runtime).
///
/// # Errors
///
/// Returns an error if the store cannot be opened or its schema created.
pub fn create_checkpoint_store(config: &StateConfig) -> Result<Arc<dyn CheckpointStore>> {
    match config.backend {
        StateBackendKind::Sqlite => {
            let store = if let Some(path) = &config.connection {
                SqliteCheckpointStore::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                SqliteCheckpointStore::open(&StateConfig::default_sqlite_path())
                    .context("Failed to open default state DB")?
            };
            Ok(Arc::new(store) as Arc<dyn CheckpointStore>)
        }
        StateBackendKind::Postgres => {
            let connstr = config
                .connection
                .as_deref()
                .unwrap_or("host=localhost dbname=lovelace_state");
            let store = PostgresCheckpointStore::open(connstr)
                .map_err(|e| anyhow::anyhow!("failed to open Postgres checkpoint store: {e}"))?;
            Ok(Arc::new(store) as Arc<dyn CheckpointStore>)
        }
    }
}

/// Build the tiered scraper described by a `tiered_scrape` block.
///
/// # Errors
///
/// Returns an error if a strategy's extract patterns do not compile.
pub fn build_scraper(
    config: &TieredScrapeConfig,
    http: &reqwest::Client,
    policy: RetryPolicy,
) -> Result<TieredScraper> {
    let strategies = config
        .strategies
        .iter()
        .map(|s| {
            ZyteStrategy::new(http.clone(), &config.endpoint, &config.api_key, s.clone())
                .map(|z| Arc::new(z) as Arc<dyn ScrapeStrategy>)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TieredScraper::new(
        strategies,
        config.required_fields.clone(),
        policy,
    ))
}

/// Build the job's source adapter.
///
/// # Errors
///
/// Returns an error if the kind-specific config block is invalid.
pub fn build_source(config: &JobConfig, http: &reqwest::Client) -> Result<Arc<dyn SourceAdapter>> {
    let policy = RetryPolicy::from_resources(&config.resources);
    let raw = &config.source.config;
    let fetcher: Arc<dyn UnitFetcher> = match config.source.kind {
        SourceKind::RestCursor => {
            let block = RestCursorConfig::from_value(raw)?;
            let client = Arc::new(HttpPageClient::new(http.clone(), block.clone()));
            Arc::new(RestCursorFetcher::new(client, block, policy))
        }
        SourceKind::EventHistory => {
            let block = EventHistoryConfig::from_value(raw)?;
            let client = Arc::new(DiscordHistoryClient::new(http.clone(), &block));
            Arc::new(EventHistoryFetcher::new(client, block, policy))
        }
        SourceKind::TieredScrape => {
            let block = TieredScrapeConfig::from_value(raw)?;
            let scraper = Arc::new(build_scraper(&block, http, policy)?);
            Arc::new(TieredScrapeFetcher::new(scraper, block.targets))
        }
    };
    let label = format!("{}:{}", config.source.kind.as_str(), config.source.id);
    let parallelism = usize::try_from(config.resources.parallelism).unwrap_or(usize::MAX);
    Ok(Arc::new(DrivenSource::new(
        fetcher,
        DriverSettings::new(label, parallelism),
    )))
}

/// Build the job's destination.
///
/// # Errors
///
/// Returns an error if the kind-specific config block is invalid.
pub fn build_destination(
    config: &DestinationConfig,
    http: &reqwest::Client,
) -> Result<Box<dyn Destination>> {
    let raw = &config.config;
    let destination: Box<dyn Destination> = match config.kind {
        DestinationKind::Broker => {
            let block = BrokerConfig::from_value(raw)?;
            let producer = Arc::new(RestProxyProducer::new(http.clone(), &block));
            Box::new(BrokerDestination::new(producer, block.topic, block.envelope))
        }
        DestinationKind::Postgres => {
            Box::new(PostgresWarehouse::new(PostgresSinkConfig::from_value(raw)?))
        }
        DestinationKind::Clickhouse => Box::new(ClickHouseWarehouse::new(
            http.clone(),
            ClickHouseConfig::from_value(raw)?,
        )),
    };
    Ok(destination)
}
