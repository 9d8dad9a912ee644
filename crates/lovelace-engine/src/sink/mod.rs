//! Batch sink: bounded buffering in front of a [`Destination`].
//!
//! The buffer is cleared only after the destination acknowledges the whole
//! batch. Retryable delivery failures are retried with backoff up to the
//! configured attempt budget; anything else surfaces as
//! [`PipelineError::Delivery`].

pub mod broker;
pub mod clickhouse;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use lovelace_types::error::ConnectorError;
use lovelace_types::record::Record;
use tokio::time::Instant;

use crate::config::types::SinkConfig;
use crate::errors::PipelineError;
use crate::retry::{with_timeout, RetryPolicy};

pub use broker::{BrokerConfig, BrokerDestination, MessageProducer, RestProxyProducer};
pub use clickhouse::{ClickHouseConfig, ClickHouseWarehouse};
pub use postgres::{PostgresSinkConfig, PostgresWarehouse};

/// Downstream system receiving whole batches.
#[async_trait]
pub trait Destination: Send {
    fn name(&self) -> &str;

    /// Deliver one batch. Success means every record was acknowledged.
    async fn deliver(&mut self, batch: &[Record]) -> Result<(), ConnectorError>;

    /// Release connections. Called once, after the final flush.
    async fn shutdown(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Flush policy resolved from [`SinkConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSettings {
    pub max_batch_records: usize,
    pub max_batch_wait: Duration,
    pub delivery: RetryPolicy,
}

impl SinkSettings {
    /// Delivery reuses the run's timeout and backoff with the sink's own
    /// attempt budget.
    #[must_use]
    pub fn new(config: &SinkConfig, policy: RetryPolicy) -> Self {
        Self {
            max_batch_records: config.max_batch_records.max(1),
            max_batch_wait: Duration::from_millis(config.max_batch_wait_ms),
            delivery: policy.with_attempts(config.max_delivery_attempts),
        }
    }
}

/// Counters kept across the sink's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub records_delivered: u64,
    pub batches_delivered: u64,
    pub delivery_attempts: u64,
}

pub struct BatchSink {
    destination: Box<dyn Destination>,
    settings: SinkSettings,
    buffer: Vec<Record>,
    opened_at: Option<Instant>,
    stats: SinkStats,
    closed: bool,
}

impl BatchSink {
    #[must_use]
    pub fn new(destination: Box<dyn Destination>, settings: SinkSettings) -> Self {
        Self {
            destination,
            buffer: Vec::with_capacity(settings.max_batch_records),
            settings,
            opened_at: None,
            stats: SinkStats::default(),
            closed: false,
        }
    }

    /// Buffer one record, flushing when the batch is full.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Delivery`] if the triggered flush fails.
    pub async fn accept(&mut self, record: Record) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                "record accepted after sink '{}' was closed",
                self.destination.name()
            )));
        }
        if self.buffer.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.buffer.push(record);
        if self.buffer.len() >= self.settings.max_batch_records {
            self.flush().await?;
        }
        Ok(())
    }

    /// When the current batch must be flushed by, if one is open.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.settings.max_batch_wait)
    }

    /// Flush if the open batch has waited `max_batch_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Delivery`] if the flush fails.
    pub async fn flush_if_due(&mut self) -> Result<(), PipelineError> {
        match self.deadline() {
            Some(deadline) if deadline <= Instant::now() => self.flush().await,
            _ => Ok(()),
        }
    }

    /// Deliver the buffered batch. A no-op when the buffer is empty.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Delivery`] once the attempt budget is spent
    /// or on the first non-retryable failure. The buffer is left intact.
    pub async fn flush(&mut self) -> Result<(), PipelineError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let policy = self.settings.delivery;
        let records = self.buffer.len();
        let mut attempt = 1u32;
        loop {
            self.stats.delivery_attempts += 1;
            let result = with_timeout(
                policy.call_timeout,
                "deliver",
                self.destination.deliver(&self.buffer),
            )
            .await;
            match result {
                Ok(()) => {
                    tracing::info!(
                        destination = self.destination.name(),
                        records,
                        attempt,
                        "Batch flushed"
                    );
                    self.stats.records_delivered += records as u64;
                    self.stats.batches_delivered += 1;
                    self.buffer.clear();
                    self.opened_at = None;
                    return Ok(());
                }
                Err(err) if err.retryable && attempt < policy.max_attempts => {
                    let delay = policy.backoff_for(&err, attempt);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    tracing::warn!(
                        destination = self.destination.name(),
                        records,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms,
                        category = %err.category,
                        code = %err.code,
                        "Batch delivery failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        destination = self.destination.name(),
                        records,
                        attempt,
                        error = %err,
                        "Batch delivery failed"
                    );
                    return Err(PipelineError::Delivery {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    /// Final unconditional flush, then release the destination.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Delivery`] if the final flush fails, in which
    /// case the destination is still shut down.
    pub async fn close(&mut self) -> Result<SinkStats, PipelineError> {
        if self.closed {
            return Ok(self.stats);
        }
        let flushed = self.flush().await;
        self.closed = true;
        self.shutdown_destination().await;
        flushed.map(|()| self.stats)
    }

    /// Drop buffered records without delivering them and release the
    /// destination. Used after a delivery failure.
    pub async fn abandon(&mut self) -> SinkStats {
        if !self.buffer.is_empty() {
            tracing::warn!(
                destination = self.destination.name(),
                records = self.buffer.len(),
                "Abandoning undelivered batch"
            );
        }
        self.buffer.clear();
        self.opened_at = None;
        if !self.closed {
            self.closed = true;
            self.shutdown_destination().await;
        }
        self.stats
    }

    async fn shutdown_destination(&mut self) {
        if let Err(err) = self.destination.shutdown().await {
            tracing::warn!(
                destination = self.destination.name(),
                error = %err,
                "Destination shutdown failed"
            );
        }
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn stats(&self) -> SinkStats {
        self.stats
    }
}
