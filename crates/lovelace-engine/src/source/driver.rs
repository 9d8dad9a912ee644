//! Shared sub-unit driver behind every bundled source adapter.
//!
//! An adapter supplies a [`UnitFetcher`]; the driver discovers its
//! sub-units, runs them on a bounded worker pool, forwards their records
//! through one queue, and applies the isolation policy:
//!
//! * `auth` / `config` failures are fatal in any sub-unit,
//! * any other failure in sub-unit #0 is fatal,
//! * any other failure in a later sub-unit marks it skipped.
//!
//! Sub-unit #0 runs alone to completion before the pool opens up. Once the
//! cancellation token fires no new sub-unit is started; in-flight ones run
//! to completion and the stream still ends with `End`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lovelace_types::cursor::Cursor;
use lovelace_types::error::{ConnectorError, SchemaError};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{EventSender, RawRecord, RecordStream, SkippedSubUnit, SourceAdapter, SourceEvent};
use crate::errors::PipelineError;

/// One independently failing slice of an extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubUnit {
    /// Position in discovery order; #0 is the canary.
    pub index: usize,
    pub label: String,
}

/// Per-unit handle for pushing records into the run's queue.
pub struct UnitEmitter {
    tx: EventSender,
    subunit: String,
}

impl UnitEmitter {
    /// Queue one raw payload. Waits while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns an `internal` error once the consumer has gone away, which
    /// ends the fetch loop of the calling unit.
    pub async fn emit(&self, payload: Value, cursor: Option<Cursor>) -> Result<(), ConnectorError> {
        let record = self.raw(payload, cursor);
        self.send(SourceEvent::Record(record)).await
    }

    /// Queue a payload the unit could not interpret. It carries no cursor,
    /// so it never moves the checkpoint, and the unit keeps going.
    ///
    /// # Errors
    ///
    /// Same as [`UnitEmitter::emit`].
    pub async fn reject(&self, payload: Value, error: SchemaError) -> Result<(), ConnectorError> {
        tracing::debug!(sub_unit = self.subunit, field = error.field, "Payload rejected by source");
        let raw = self.raw(payload, None);
        self.send(SourceEvent::RecordRejected { raw, error }).await
    }

    fn raw(&self, payload: Value, cursor: Option<Cursor>) -> RawRecord {
        RawRecord {
            payload,
            cursor,
            observed_at: Utc::now(),
            subunit: self.subunit.clone(),
        }
    }

    async fn send(&self, event: SourceEvent) -> Result<(), ConnectorError> {
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| ConnectorError::internal("STREAM_CLOSED", "record consumer went away"))
    }

    #[must_use]
    pub fn subunit(&self) -> &str {
        &self.subunit
    }
}

/// Adapter-specific discovery and per-unit fetching.
///
/// Implementations retry their own upstream calls (see
/// [`crate::retry::call_with_retry`]); an error returned from
/// [`UnitFetcher::fetch_unit`] is final for that unit.
#[async_trait]
pub trait UnitFetcher: Send + Sync + 'static {
    /// Sub-unit labels in the order they should be fetched.
    async fn discover(&self, resume_from: Option<&Cursor>) -> Result<Vec<String>, ConnectorError>;

    /// Fetch every record of `unit` strictly after `resume_from`, in
    /// non-decreasing cursor order.
    async fn fetch_unit(
        &self,
        unit: &SubUnit,
        resume_from: Option<&Cursor>,
        emitter: &UnitEmitter,
    ) -> Result<(), ConnectorError>;
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub source_label: String,
    /// Worker pool size.
    pub parallelism: usize,
    /// Records buffered between the workers and the orchestrator.
    pub queue_capacity: usize,
}

impl DriverSettings {
    #[must_use]
    pub fn new(source_label: impl Into<String>, parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            source_label: source_label.into(),
            parallelism,
            queue_capacity: 256 * parallelism,
        }
    }
}

/// [`SourceAdapter`] built from a [`UnitFetcher`].
pub struct DrivenSource {
    fetcher: Arc<dyn UnitFetcher>,
    settings: DriverSettings,
}

impl DrivenSource {
    #[must_use]
    pub fn new(fetcher: Arc<dyn UnitFetcher>, settings: DriverSettings) -> Self {
        Self { fetcher, settings }
    }
}

impl SourceAdapter for DrivenSource {
    fn name(&self) -> &str {
        &self.settings.source_label
    }

    fn extract(&self, resume_from: Option<Cursor>, cancel: CancellationToken) -> RecordStream {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let driver = tokio::spawn(drive(
            Arc::clone(&self.fetcher),
            self.settings.clone(),
            resume_from,
            cancel,
            tx,
        ));
        RecordStream::new(rx, driver)
    }
}

async fn drive(
    fetcher: Arc<dyn UnitFetcher>,
    settings: DriverSettings,
    resume_from: Option<Cursor>,
    cancel: CancellationToken,
    tx: EventSender,
) {
    let labels = match fetcher.discover(resume_from.as_ref()).await {
        Ok(labels) => labels,
        Err(err) => {
            tracing::error!(source = settings.source_label, error = %err, "Sub-unit discovery failed");
            let _ = tx.send(Err(PipelineError::FatalSource(err))).await;
            return;
        }
    };

    tracing::info!(
        source = settings.source_label,
        sub_units = labels.len(),
        parallelism = settings.parallelism,
        "Discovered sub-units"
    );

    let resume_from = Arc::new(resume_from);
    let semaphore = Arc::new(Semaphore::new(settings.parallelism));
    let mut join_set: JoinSet<(SubUnit, Result<(), ConnectorError>)> = JoinSet::new();
    let mut fatal = false;

    'units: for (index, label) in labels.into_iter().enumerate() {
        let permit = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break None,
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    if settle(&settings, &tx, joined).await {
                        fatal = true;
                        break None;
                    }
                }
                acquired = Arc::clone(&semaphore).acquire_owned() => break acquired.ok(),
            }
        };
        let Some(permit) = permit else {
            break 'units;
        };

        if cancel.is_cancelled() {
            tracing::info!(
                source = settings.source_label,
                next_sub_unit = label,
                "Cancellation requested, not starting further sub-units"
            );
            break;
        }

        let unit = SubUnit { index, label };
        let emitter = UnitEmitter {
            tx: tx.clone(),
            subunit: unit.label.clone(),
        };
        let fetcher = Arc::clone(&fetcher);
        let resume_from = Arc::clone(&resume_from);
        tracing::debug!(source = settings.source_label, sub_unit = unit.label, "Starting sub-unit");
        join_set.spawn(async move {
            let _permit = permit;
            let result = fetcher
                .fetch_unit(&unit, resume_from.as_ref().as_ref(), &emitter)
                .await;
            (unit, result)
        });

        if index == 0 {
            if let Some(joined) = join_set.join_next().await {
                if settle(&settings, &tx, joined).await {
                    fatal = true;
                    break;
                }
            }
        }
    }

    if fatal {
        join_set.abort_all();
        return;
    }

    while let Some(joined) = join_set.join_next().await {
        if settle(&settings, &tx, joined).await {
            join_set.abort_all();
            return;
        }
    }

    let _ = tx.send(Ok(SourceEvent::End)).await;
}

/// Apply the isolation policy to one finished unit. Returns `true` when
/// the failure is run-scoped and has been forwarded as fatal.
async fn settle(
    settings: &DriverSettings,
    tx: &EventSender,
    joined: Result<(SubUnit, Result<(), ConnectorError>), JoinError>,
) -> bool {
    match joined {
        Ok((unit, Ok(()))) => {
            tracing::debug!(source = settings.source_label, sub_unit = unit.label, "Sub-unit complete");
            false
        }
        Ok((unit, Err(err))) if err.category.is_run_scoped() || unit.index == 0 => {
            tracing::error!(
                source = settings.source_label,
                sub_unit = unit.label,
                index = unit.index,
                error = %err,
                "Sub-unit failure is run-scoped, aborting extraction"
            );
            let _ = tx.send(Err(PipelineError::FatalSource(err))).await;
            true
        }
        Ok((unit, Err(err))) => {
            tracing::warn!(
                source = settings.source_label,
                sub_unit = unit.label,
                error = %err,
                "Skipping sub-unit after isolated failure"
            );
            let skipped = SkippedSubUnit::new(unit.label, &err);
            let _ = tx.send(Ok(SourceEvent::SubUnitSkipped(skipped))).await;
            false
        }
        Err(join_err) => {
            let _ = tx
                .send(Err(PipelineError::task_panicked("Sub-unit", &join_err)))
                .await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Units yield offsets `base+1..=base+n`; listed units fail.
    struct FakeFetcher {
        units: Vec<(String, i64, i64)>,
        failures: HashMap<String, ConnectorError>,
        started: Mutex<Vec<String>>,
        discover_error: Option<ConnectorError>,
    }

    impl FakeFetcher {
        fn new(units: &[(&str, i64, i64)]) -> Self {
            Self {
                units: units
                    .iter()
                    .map(|(l, b, n)| ((*l).to_string(), *b, *n))
                    .collect(),
                failures: HashMap::new(),
                started: Mutex::new(Vec::new()),
                discover_error: None,
            }
        }

        fn failing(mut self, label: &str, err: ConnectorError) -> Self {
            self.failures.insert(label.to_string(), err);
            self
        }
    }

    #[async_trait]
    impl UnitFetcher for FakeFetcher {
        async fn discover(&self, _: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
            if let Some(err) = &self.discover_error {
                return Err(err.clone());
            }
            Ok(self.units.iter().map(|(l, _, _)| l.clone()).collect())
        }

        async fn fetch_unit(
            &self,
            unit: &SubUnit,
            resume_from: Option<&Cursor>,
            emitter: &UnitEmitter,
        ) -> Result<(), ConnectorError> {
            self.started.lock().unwrap().push(unit.label.clone());
            if let Some(err) = self.failures.get(&unit.label) {
                return Err(err.clone());
            }
            let (_, base, n) = self.units[unit.index];
            for offset in base + 1..=base + n {
                let cursor = Cursor::Offset(offset);
                if cursor.is_after(resume_from).unwrap() {
                    emitter
                        .emit(serde_json::json!({"id": offset}), Some(cursor))
                        .await?;
                }
            }
            Ok(())
        }
    }

    async fn collect(
        source: &DrivenSource,
        resume: Option<Cursor>,
    ) -> (Vec<RawRecord>, Vec<SkippedSubUnit>, Option<PipelineError>) {
        let mut stream = source.extract(resume, CancellationToken::new());
        let mut records = Vec::new();
        let mut skipped = Vec::new();
        loop {
            match stream.next().await {
                Ok(SourceEvent::Record(r)) => records.push(r),
                Ok(SourceEvent::RecordRejected { raw, error }) => {
                    panic!("unexpected rejection of {raw:?}: {error}")
                }
                Ok(SourceEvent::SubUnitSkipped(s)) => skipped.push(s),
                Ok(SourceEvent::End) => return (records, skipped, None),
                Err(e) => return (records, skipped, Some(e)),
            }
        }
    }

    fn driven(fetcher: FakeFetcher, parallelism: usize) -> (DrivenSource, Arc<FakeFetcher>) {
        let fetcher = Arc::new(fetcher);
        let source = DrivenSource::new(
            Arc::clone(&fetcher) as Arc<dyn UnitFetcher>,
            DriverSettings::new("fake", parallelism),
        );
        (source, fetcher)
    }

    #[tokio::test]
    async fn sequential_units_preserve_order() {
        let (source, _) = driven(FakeFetcher::new(&[("a", 0, 2), ("b", 10, 2)]), 1);
        let (records, skipped, err) = collect(&source, None).await;
        assert!(err.is_none());
        assert!(skipped.is_empty());
        let offsets: Vec<_> = records.iter().map(|r| r.payload["id"].clone()).collect();
        assert_eq!(offsets, vec![1, 2, 11, 12]);
        assert_eq!(records[2].subunit, "b");
    }

    #[tokio::test]
    async fn later_unit_failure_is_isolated() {
        let fetcher = FakeFetcher::new(&[("c1", 0, 2), ("c2", 10, 2), ("c3", 20, 2)])
            .failing("c2", ConnectorError::rate_limit("HTTP_429", "slow down", None));
        let (source, _) = driven(fetcher, 1);
        let (records, skipped, err) = collect(&source, None).await;
        assert!(err.is_none());
        assert_eq!(records.len(), 4);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].label, "c2");
        assert_eq!(skipped[0].code, "HTTP_429");
    }

    #[tokio::test]
    async fn first_unit_failure_is_fatal_and_stops_the_rest() {
        let fetcher = FakeFetcher::new(&[("c1", 0, 2), ("c2", 10, 2)])
            .failing("c1", ConnectorError::timeout("CALL_TIMEOUT", "hung"));
        let (source, fetcher) = driven(fetcher, 1);
        let (records, _, err) = collect(&source, None).await;
        assert!(records.is_empty());
        assert!(matches!(err, Some(PipelineError::FatalSource(_))));
        assert_eq!(*fetcher.started.lock().unwrap(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_anywhere() {
        let fetcher = FakeFetcher::new(&[("c1", 0, 1), ("c2", 10, 1), ("c3", 20, 1)])
            .failing("c2", ConnectorError::auth("HTTP_401", "revoked"));
        let (source, _) = driven(fetcher, 1);
        let (_, skipped, err) = collect(&source, None).await;
        assert!(skipped.is_empty());
        assert!(matches!(err, Some(PipelineError::FatalSource(ref e)) if e.code == "HTTP_401"));
    }

    #[tokio::test]
    async fn discovery_failure_is_fatal() {
        let mut fetcher = FakeFetcher::new(&[]);
        fetcher.discover_error = Some(ConnectorError::transient_network("X", "down"));
        let (source, _) = driven(fetcher, 1);
        let (_, _, err) = collect(&source, None).await;
        assert!(matches!(err, Some(PipelineError::FatalSource(_))));
    }

    #[tokio::test]
    async fn resume_filters_every_unit() {
        let (source, _) = driven(FakeFetcher::new(&[("a", 0, 5)]), 1);
        let (records, _, _) = collect(&source, Some(Cursor::Offset(3))).await;
        let cursors: Vec<_> = records.into_iter().filter_map(|r| r.cursor).collect();
        assert_eq!(cursors, vec![Cursor::Offset(4), Cursor::Offset(5)]);
    }

    #[tokio::test]
    async fn parallel_units_deliver_everything() {
        let units: Vec<(String, i64, i64)> =
            (0..8).map(|i| (format!("u{i}"), i * 100, 25)).collect();
        let refs: Vec<(&str, i64, i64)> =
            units.iter().map(|(l, b, n)| (l.as_str(), *b, *n)).collect();
        let (source, _) = driven(FakeFetcher::new(&refs), 4);
        let (records, _, err) = collect(&source, None).await;
        assert!(err.is_none());
        assert_eq!(records.len(), 200);
        // Per-unit order is preserved even when units interleave.
        for (label, _, _) in &units {
            let offsets: Vec<i64> = records
                .iter()
                .filter(|r| &r.subunit == label)
                .map(|r| r.payload["id"].as_i64().unwrap())
                .collect();
            assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn cancellation_stops_new_units() {
        let fetcher = Arc::new(FakeFetcher::new(&[("a", 0, 1), ("b", 10, 1)]));
        let source = DrivenSource::new(
            Arc::clone(&fetcher) as Arc<dyn UnitFetcher>,
            DriverSettings::new("fake", 1),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = source.extract(None, cancel);
        assert_eq!(stream.next().await.unwrap(), SourceEvent::End);
        assert!(fetcher.started.lock().unwrap().is_empty());
    }

    #[test]
    fn settings_floor_parallelism() {
        let settings = DriverSettings::new("s", 0);
        assert_eq!(settings.parallelism, 1);
        assert_eq!(settings.queue_capacity, 256);
    }
}
