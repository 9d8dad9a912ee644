//! Source adapters and the pull interface the orchestrator consumes.
//!
//! Every adapter hands back a [`RecordStream`]: a bounded queue fed by the
//! adapter's own worker pool. The orchestrator only ever awaits
//! [`RecordStream::next`] and never sees how sub-units are scheduled.

pub mod driver;
pub mod event_history;
pub mod rest_cursor;
pub mod tiered_scrape;
pub mod zyte;

use chrono::{DateTime, Utc};
use lovelace_types::cursor::Cursor;
use lovelace_types::error::{ConnectorError, ErrorCategory, SchemaError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;

pub use driver::{DrivenSource, DriverSettings, SubUnit, UnitEmitter, UnitFetcher};

/// A payload as the upstream produced it, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub payload: Value,
    /// Extraction position; `None` for sources that do not checkpoint.
    pub cursor: Option<Cursor>,
    pub observed_at: DateTime<Utc>,
    /// Label of the sub-unit that produced it.
    pub subunit: String,
}

/// A sub-unit abandoned after its failure was isolated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSubUnit {
    pub label: String,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl SkippedSubUnit {
    #[must_use]
    pub fn new(label: impl Into<String>, err: &ConnectorError) -> Self {
        Self {
            label: label.into(),
            category: err.category,
            code: err.code.clone(),
            message: err.message.clone(),
        }
    }
}

/// One item pulled from a [`RecordStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Record(RawRecord),
    /// A payload the adapter could not read a cursor or field from. The
    /// orchestrator applies the schema-error policy to it.
    RecordRejected { raw: RawRecord, error: SchemaError },
    SubUnitSkipped(SkippedSubUnit),
    /// Clean end of sequence. Sent exactly once, last.
    End,
}

pub(crate) type EventSender = mpsc::Sender<Result<SourceEvent, PipelineError>>;

/// Blocking pull interface over an adapter's output.
///
/// Dropping the stream aborts the adapter's worker tasks.
pub struct RecordStream {
    rx: mpsc::Receiver<Result<SourceEvent, PipelineError>>,
    driver: Option<JoinHandle<()>>,
    ended: bool,
}

impl RecordStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<SourceEvent, PipelineError>>,
        driver: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            driver: Some(driver),
            ended: false,
        }
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// Returns the adapter's run-scoped failure, or `FatalSource` if the
    /// adapter went away without signalling the end of the sequence.
    pub async fn next(&mut self) -> Result<SourceEvent, PipelineError> {
        if self.ended {
            return Ok(SourceEvent::End);
        }
        match self.rx.recv().await {
            Some(Ok(SourceEvent::End)) => {
                self.ended = true;
                Ok(SourceEvent::End)
            }
            Some(event) => event,
            None => Err(PipelineError::FatalSource(ConnectorError::internal(
                "SOURCE_CLOSED",
                "source stream closed without an end-of-sequence signal",
            ))),
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

/// Capability every source variant provides.
pub trait SourceAdapter: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Start extracting records strictly after `resume_from`.
    ///
    /// Must be called from within a Tokio runtime.
    fn extract(&self, resume_from: Option<Cursor>, cancel: CancellationToken) -> RecordStream;
}
