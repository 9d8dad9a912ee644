//! Pipeline orchestrator: one resumable run from checkpoint load to commit.
//!
//! `INIT -> EXTRACTING -> DRAINING -> COMMITTED`, or `FAILED` from any
//! state. The checkpoint is written only after the sink's final flush
//! succeeded, so a failed run always resumes at or before the last
//! committed position.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use lovelace_state::CheckpointStore;
use lovelace_types::checkpoint::CommitOutcome;
use lovelace_types::cursor::{Cursor, CursorError};
use lovelace_types::dlq::DlqRecord;
use lovelace_types::error::{ConnectorError, SchemaError};
use lovelace_types::state::{JobId, RunStats, RunStatus, SourceId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointHandle;
use crate::config::types::{JobConfig, SchemaErrorPolicy};
use crate::config::validator::validate_job;
use crate::dlq;
use crate::errors::PipelineError;
use crate::http::build_client;
use crate::normalize::Normalizer;
use crate::resolve::{build_destination, build_source, create_checkpoint_store};
use crate::result::{CheckResult, RunCounts, RunReport, RunState};
use crate::retry::RetryPolicy;
use crate::sink::{BatchSink, Destination, SinkSettings};
use crate::source::{RawRecord, RecordStream, SkippedSubUnit, SourceAdapter, SourceEvent};

fn cursor_mismatch(err: &CursorError) -> PipelineError {
    PipelineError::FatalSource(ConnectorError::config(
        "CURSOR_KIND_MISMATCH",
        err.to_string(),
    ))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Mutable bookkeeping for one run.
struct RunTracker {
    job: String,
    source: String,
    state: RunState,
    resumed_from: Option<Cursor>,
    highest: Option<Cursor>,
    committed_cursor: Option<Cursor>,
    counts: RunCounts,
    skipped: Vec<SkippedSubUnit>,
    dlq: Vec<DlqRecord>,
}

impl RunTracker {
    fn new(config: &JobConfig) -> Self {
        Self {
            job: config.job.clone(),
            source: config.source.id.clone(),
            state: RunState::Init,
            resumed_from: None,
            highest: None,
            committed_cursor: None,
            counts: RunCounts::default(),
            skipped: Vec::new(),
            dlq: Vec::new(),
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(
            job = self.job,
            source = self.source,
            from = %self.state,
            to = %next,
            "Run state changed"
        );
        self.state = next;
    }

    /// Track the highest cursor seen so far.
    fn observe(&mut self, cursor: &Cursor) -> Result<(), PipelineError> {
        let advance = match &self.highest {
            None => true,
            Some(highest) => {
                cursor.compare(highest).map_err(|e| cursor_mismatch(&e))? == Ordering::Greater
            }
        };
        if advance {
            self.highest = Some(cursor.clone());
        }
        Ok(())
    }

    fn stats(&self, error: Option<&PipelineError>) -> RunStats {
        RunStats {
            records_extracted: self.counts.extracted,
            records_delivered: self.counts.delivered,
            records_rejected: self.counts.rejected,
            subunits_skipped: self.skipped.len() as u64,
            error_kind: error.map(|e| e.kind().as_str().to_string()),
            error_message: error.map(ToString::to_string),
        }
    }
}

/// Per-run wiring shared by the extraction loop.
struct RunContext<'a> {
    config: &'a JobConfig,
    handle: &'a CheckpointHandle,
    cancel: &'a CancellationToken,
    lease_ttl: Duration,
}

/// One Source Adapter, the Normalizer, one Batch Sink and the checkpoint
/// store, wired for a single run.
pub struct Pipeline {
    config: JobConfig,
    source: Arc<dyn SourceAdapter>,
    destination: Box<dyn Destination>,
    store: Arc<dyn CheckpointStore>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: JobConfig,
        source: Arc<dyn SourceAdapter>,
        destination: Box<dyn Destination>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            store,
        }
    }

    /// Execute one run. Failures are reported in the returned
    /// [`RunReport`], never as a panic or a missing report.
    pub async fn run(self, cancel: CancellationToken) -> RunReport {
        let started = std::time::Instant::now();
        let Self {
            config,
            source,
            destination,
            store,
        } = self;
        let run_uuid = uuid::Uuid::new_v4().to_string();
        let policy = RetryPolicy::from_resources(&config.resources);
        let handle = CheckpointHandle::new(
            Arc::clone(&store),
            JobId::new(config.job.clone()),
            SourceId::new(config.source.id.clone()),
            run_uuid.clone(),
        )
        .with_call_timeout(policy.call_timeout);
        let ctx = RunContext {
            config: &config,
            handle: &handle,
            cancel: &cancel,
            lease_ttl: Duration::from_secs(config.state.lease_ttl_secs.max(1)),
        };

        tracing::info!(
            job = config.job,
            source = config.source.id,
            run = %run_uuid,
            source_kind = config.source.kind.as_str(),
            destination = config.destination.kind.as_str(),
            "Starting pipeline run"
        );

        let mut sink = BatchSink::new(destination, SinkSettings::new(&config.sink, policy));
        let mut tracker = RunTracker::new(&config);
        let mut run_id = 0i64;
        let mut leased = false;

        let result = async {
            if !handle.acquire_lease(ctx.lease_ttl).await? {
                return Err(PipelineError::LeaseUnavailable {
                    job: config.job.clone(),
                    source_id: config.source.id.clone(),
                });
            }
            leased = true;
            run_id = handle.start_run().await?;
            execute(&ctx, source.as_ref(), &mut sink, &mut tracker, &run_uuid).await
        }
        .await;

        // No-op when the run closed the sink itself.
        let sink_stats = sink.abandon().await;
        tracker.counts.delivered = sink_stats.records_delivered;
        tracker.counts.batches = sink_stats.batches_delivered;

        let error = result.err();
        tracker.transition(if error.is_none() {
            RunState::Committed
        } else {
            RunState::Failed
        });

        if run_id != 0 {
            let status = if error.is_none() {
                RunStatus::Committed
            } else {
                RunStatus::Failed
            };
            if let Err(e) = handle
                .complete_run(run_id, status, tracker.stats(error.as_ref()))
                .await
            {
                tracing::error!(
                    job = config.job,
                    run_id,
                    error = %e,
                    "Failed to record run completion"
                );
            }
            handle.persist_dlq(run_id, std::mem::take(&mut tracker.dlq)).await;
        }
        if leased {
            handle.release_lease().await;
        }

        let duration_secs = started.elapsed().as_secs_f64();
        match &error {
            None => tracing::info!(
                job = config.job,
                source = config.source.id,
                extracted = tracker.counts.extracted,
                delivered = tracker.counts.delivered,
                rejected = tracker.counts.rejected,
                duplicates = tracker.counts.duplicates,
                skipped = tracker.skipped.len(),
                duration_secs,
                "Pipeline run committed"
            ),
            Some(err) => tracing::error!(
                job = config.job,
                source = config.source.id,
                error_kind = %err.kind(),
                error = %err,
                delivered = tracker.counts.delivered,
                duration_secs,
                "Pipeline run failed"
            ),
        }

        // The Postgres store owns a runtime, which must not be dropped on
        // an async worker thread.
        drop(ctx);
        let _ = tokio::task::spawn_blocking(move || drop((handle, store))).await;

        RunReport {
            job_id: tracker.job,
            source_id: tracker.source,
            run_id,
            state: tracker.state,
            resumed_from: tracker.resumed_from,
            committed_cursor: tracker.committed_cursor,
            counts: tracker.counts,
            skipped: tracker.skipped,
            error_kind: error.as_ref().map(PipelineError::kind),
            error_message: error.as_ref().map(ToString::to_string),
            duration_secs,
        }
    }
}

async fn execute(
    ctx: &RunContext<'_>,
    source: &dyn SourceAdapter,
    sink: &mut BatchSink,
    tracker: &mut RunTracker,
    run_uuid: &str,
) -> Result<(), PipelineError> {
    let resume_from = ctx.handle.load().await?.map(|cp| cp.cursor);
    tracing::info!(
        job = tracker.job,
        source = tracker.source,
        resume_from = resume_from.as_ref().map(ToString::to_string),
        "Checkpoint loaded"
    );
    tracker.resumed_from.clone_from(&resume_from);

    let normalizer = Normalizer::new(
        ctx.config.normalize.clone(),
        &ctx.config.source.id,
        run_uuid,
    );
    let mut stream = source.extract(resume_from.clone(), ctx.cancel.child_token());
    tracker.transition(RunState::Extracting);

    let extracted = extract(
        ctx,
        &mut stream,
        &normalizer,
        sink,
        tracker,
        resume_from.as_ref(),
    )
    .await;
    drop(stream);

    if let Err(err) = extracted {
        if matches!(err, PipelineError::Delivery { .. }) {
            sink.abandon().await;
        } else if let Err(close_err) = sink.close().await {
            // Buffered records are flushed for at-least-once; the run still
            // fails with the original error.
            tracing::warn!(
                job = tracker.job,
                error = %close_err,
                "Final flush after failure did not succeed"
            );
        }
        return Err(err);
    }

    tracker.transition(RunState::Draining);
    sink.close().await?;

    if ctx.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    tracker.committed_cursor = match tracker.highest.clone() {
        Some(cursor) => match ctx.handle.commit(cursor.clone()).await? {
            CommitOutcome::Advanced | CommitOutcome::Unchanged => Some(cursor),
            CommitOutcome::Regressed => ctx.handle.load().await?.map(|cp| cp.cursor),
        },
        None => {
            tracing::info!(
                job = tracker.job,
                source = tracker.source,
                "No cursor observed, checkpoint left unchanged"
            );
            resume_from
        }
    };
    Ok(())
}

async fn extract(
    ctx: &RunContext<'_>,
    stream: &mut RecordStream,
    normalizer: &Normalizer,
    sink: &mut BatchSink,
    tracker: &mut RunTracker,
    resume_from: Option<&Cursor>,
) -> Result<(), PipelineError> {
    let renew_every = ctx.lease_ttl / 3;
    let mut renew_at = Instant::now() + renew_every;
    loop {
        let flush_at = sink.deadline();
        // Deadlines are polled ahead of the stream so a busy queue cannot
        // starve them.
        tokio::select! {
            biased;
            () = tokio::time::sleep_until(renew_at) => {
                if !ctx.handle.renew_lease(ctx.lease_ttl).await? {
                    return Err(PipelineError::LeaseUnavailable {
                        job: tracker.job.clone(),
                        source_id: tracker.source.clone(),
                    });
                }
                tracing::debug!(job = tracker.job, source = tracker.source, "Lease renewed");
                renew_at = Instant::now() + renew_every;
            }
            () = sleep_until_opt(flush_at) => sink.flush().await?,
            event = stream.next() => match event? {
                SourceEvent::Record(raw) => {
                    accept_record(ctx, normalizer, sink, tracker, resume_from, raw).await?;
                }
                SourceEvent::RecordRejected { raw, error } => {
                    tracker.counts.extracted += 1;
                    apply_schema_policy(ctx, tracker, &raw, error)?;
                }
                SourceEvent::SubUnitSkipped(skipped) => {
                    tracker.dlq.push(dlq::skipped_subunit(&skipped));
                    tracker.skipped.push(skipped);
                }
                SourceEvent::End => return Ok(()),
            },
        }
    }
}

async fn accept_record(
    ctx: &RunContext<'_>,
    normalizer: &Normalizer,
    sink: &mut BatchSink,
    tracker: &mut RunTracker,
    resume_from: Option<&Cursor>,
    raw: RawRecord,
) -> Result<(), PipelineError> {
    tracker.counts.extracted += 1;
    if let Some(cursor) = &raw.cursor {
        if !cursor.is_after(resume_from).map_err(|e| cursor_mismatch(&e))? {
            tracker.counts.duplicates += 1;
            tracing::debug!(
                job = tracker.job,
                cursor = %cursor,
                "Dropping record at or before the resume cursor"
            );
            return Ok(());
        }
        // Rejected records count as processed: they are in the DLQ.
        tracker.observe(cursor)?;
    }

    match normalizer.normalize(&raw) {
        Ok(record) => {
            sink.accept(record).await?;
            sink.flush_if_due().await
        }
        Err(err) => apply_schema_policy(ctx, tracker, &raw, err),
    }
}

/// Drop `raw` into the DLQ or fail the run, per `on_schema_error`.
fn apply_schema_policy(
    ctx: &RunContext<'_>,
    tracker: &mut RunTracker,
    raw: &RawRecord,
    err: SchemaError,
) -> Result<(), PipelineError> {
    match ctx.config.resources.on_schema_error {
        SchemaErrorPolicy::Skip => {
            tracing::warn!(
                job = tracker.job,
                sub_unit = raw.subunit,
                field = err.field,
                reason = err.reason,
                "Rejected record"
            );
            tracker.counts.rejected += 1;
            tracker.dlq.push(dlq::rejected_record(raw, &err));
            Ok(())
        }
        SchemaErrorPolicy::Fail => Err(PipelineError::Schema(err)),
    }
}

/// Build every component from `config` and execute one run.
///
/// # Errors
///
/// Returns an error if a component cannot be constructed; failures during
/// the run are reported in the [`RunReport`] instead.
pub async fn run_job(config: &JobConfig, cancel: CancellationToken) -> anyhow::Result<RunReport> {
    let state = config.state.clone();
    let store = tokio::task::spawn_blocking(move || create_checkpoint_store(&state))
        .await
        .map_err(|e| anyhow::anyhow!("checkpoint store task panicked: {e}"))??;
    let http = build_client(Duration::from_secs(config.resources.call_timeout_secs))?;
    let source = build_source(config, &http)?;
    let destination = build_destination(&config.destination, &http)?;
    Ok(Pipeline::new(config.clone(), source, destination, store)
        .run(cancel)
        .await)
}

/// Validate `config` and try to construct every component without
/// extracting or delivering anything.
pub async fn check_job(config: &JobConfig) -> CheckResult {
    tracing::info!(job = config.job, "Checking job configuration");
    let mut result = CheckResult::default();

    match validate_job(config) {
        Ok(()) => result.config_ok = true,
        Err(e) => result.problems.push(e.to_string()),
    }

    let state = config.state.clone();
    let opened = tokio::task::spawn_blocking(move || create_checkpoint_store(&state).map(drop))
        .await
        .map_err(|e| anyhow::anyhow!("checkpoint store task panicked: {e}"))
        .and_then(|r| r);
    match opened {
        Ok(()) => {
            tracing::info!("Checkpoint store: OK");
            result.state_ok = true;
        }
        Err(e) => {
            tracing::error!(error = %e, "Checkpoint store: FAILED");
            result.problems.push(format!("checkpoint store: {e:#}"));
        }
    }

    match build_client(Duration::from_secs(config.resources.call_timeout_secs.max(1))) {
        Ok(http) => {
            match build_source(config, &http) {
                Ok(_) => result.source_ok = true,
                Err(e) => result.problems.push(format!("source: {e:#}")),
            }
            match build_destination(&config.destination, &http) {
                Ok(_) => result.destination_ok = true,
                Err(e) => result.problems.push(format!("destination: {e:#}")),
            }
        }
        Err(e) => result.problems.push(format!("{e:#}")),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingDestination;
    use crate::source::{DrivenSource, DriverSettings, SubUnit, UnitEmitter, UnitFetcher};
    use async_trait::async_trait;
    use crate::source::rest_cursor::{Page, PageClient, RestCursorConfig, RestCursorFetcher};
    use lovelace_state::SqliteCheckpointStore;
    use lovelace_types::dlq::DlqKind;
    use lovelace_types::record::Record;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// One unit yielding `(id, offset)` pairs.
    struct ListFetcher {
        rows: Vec<(&'static str, i64)>,
    }

    #[async_trait]
    impl UnitFetcher for ListFetcher {
        async fn discover(&self, _: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["all".into()])
        }

        async fn fetch_unit(
            &self,
            _: &SubUnit,
            resume_from: Option<&Cursor>,
            emitter: &UnitEmitter,
        ) -> Result<(), ConnectorError> {
            for (id, offset) in &self.rows {
                let cursor = Cursor::Offset(*offset);
                if cursor.is_after(resume_from).unwrap_or(true) {
                    emitter
                        .emit(json!({"id": id, "offset": offset}), Some(cursor))
                        .await?;
                }
            }
            Ok(())
        }
    }

    fn config() -> JobConfig {
        crate::config::parser::parse_job_str(
            r#"
version: "1.0"
job: unit
source:
  id: feed
  kind: rest_cursor
destination:
  kind: broker
sink:
  max_batch_records: 2
"#,
        )
        .unwrap()
    }

    fn source(rows: Vec<(&'static str, i64)>) -> Arc<dyn SourceAdapter> {
        Arc::new(DrivenSource::new(
            Arc::new(ListFetcher { rows }),
            DriverSettings::new("list", 1),
        ))
    }

    #[tokio::test]
    async fn commits_highest_cursor_after_final_flush() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let (dest, log) = RecordingDestination::new();
        let report = Pipeline::new(
            config(),
            source(vec![("a", 10), ("b", 20), ("c", 30)]),
            Box::new(dest),
            Arc::clone(&store),
        )
        .run(CancellationToken::new())
        .await;

        assert_eq!(report.state, RunState::Committed, "{report:?}");
        assert_eq!(report.committed_cursor, Some(Cursor::Offset(30)));
        assert_eq!(report.counts.delivered, 3);
        assert_eq!(report.counts.batches, 2);
        assert_eq!(log.lock().unwrap().batches, vec![vec!["a", "b"], vec!["c"]]);

        let run = store.get_run(report.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Committed);
        assert_eq!(run.stats.records_delivered, 3);
    }

    #[tokio::test]
    async fn held_lease_fails_without_running() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        store
            .acquire_lease(
                &JobId::new("unit"),
                &SourceId::new("feed"),
                "someone-else",
                Duration::from_secs(600),
            )
            .unwrap();
        let (dest, log) = RecordingDestination::new();
        let report = Pipeline::new(config(), source(vec![("a", 1)]), Box::new(dest), store)
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.error_kind, Some(crate::errors::ErrorKind::Lease));
        assert_eq!(report.run_id, 0);
        assert!(log.lock().unwrap().batches.is_empty());
    }

    #[tokio::test]
    async fn schema_fail_policy_aborts_without_commit() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let mut config = config();
        config.resources.on_schema_error = SchemaErrorPolicy::Fail;
        config.normalize.id_field = "missing".into();
        let (dest, _log) = RecordingDestination::new();
        let report = Pipeline::new(config, source(vec![("a", 1)]), Box::new(dest), Arc::clone(&store))
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.error_kind, Some(crate::errors::ErrorKind::Schema));
        assert!(store
            .load(&JobId::new("unit"), &SourceId::new("feed"))
            .unwrap()
            .is_none());
    }

    /// Emits `a`, `b`, `c` with a pause between each.
    struct SlowFetcher {
        pause: Duration,
    }

    #[async_trait]
    impl UnitFetcher for SlowFetcher {
        async fn discover(&self, _: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["all".into()])
        }

        async fn fetch_unit(
            &self,
            _: &SubUnit,
            _: Option<&Cursor>,
            emitter: &UnitEmitter,
        ) -> Result<(), ConnectorError> {
            for (offset, id) in ["a", "b", "c"].into_iter().enumerate() {
                if offset > 0 {
                    tokio::time::sleep(self.pause).await;
                }
                emitter
                    .emit(json!({"id": id}), Some(Cursor::Offset(offset as i64)))
                    .await?;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_is_flushed_on_max_wait() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let mut config = config();
        config.sink.max_batch_records = 100;
        config.sink.max_batch_wait_ms = 1_000;
        config.resources.call_timeout_secs = 600;
        let source: Arc<dyn SourceAdapter> = Arc::new(DrivenSource::new(
            Arc::new(SlowFetcher {
                pause: Duration::from_secs(5),
            }),
            DriverSettings::new("slow", 1),
        ));
        let (dest, log) = RecordingDestination::new();
        let report = Pipeline::new(config, source, Box::new(dest), store)
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Committed, "{report:?}");
        // The batch size is never reached, so only the deadline can split them.
        assert_eq!(
            log.lock().unwrap().batches,
            vec![vec!["a"], vec!["b"], vec!["c"]]
        );
        assert_eq!(report.committed_cursor, Some(Cursor::Offset(2)));
    }

    /// Keeps the record queue full until `busy_for` has passed, then tries
    /// to take the run's lease as another holder.
    struct BusyFetcher {
        store: Arc<dyn CheckpointStore>,
        busy_for: Duration,
        takeover: Arc<Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl UnitFetcher for BusyFetcher {
        async fn discover(&self, _: Option<&Cursor>) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["all".into()])
        }

        async fn fetch_unit(
            &self,
            _: &SubUnit,
            _: Option<&Cursor>,
            emitter: &UnitEmitter,
        ) -> Result<(), ConnectorError> {
            let started = std::time::Instant::now();
            let mut offset = 0i64;
            while started.elapsed() < self.busy_for {
                offset += 1;
                emitter
                    .emit(json!({"id": format!("r{offset}")}), Some(Cursor::Offset(offset)))
                    .await?;
            }
            let taken = self
                .store
                .acquire_lease(
                    &JobId::new("unit"),
                    &SourceId::new("feed"),
                    "other-run",
                    Duration::from_secs(60),
                )
                .map_err(|e| ConnectorError::internal("STORE", e.to_string()))?;
            *self.takeover.lock().unwrap() = Some(taken);
            Ok(())
        }
    }

    /// Takes a couple of milliseconds per batch so the consumer lags.
    struct SlowDestination;

    #[async_trait]
    impl Destination for SlowDestination {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&mut self, _: &[Record]) -> Result<(), ConnectorError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn lease_is_renewed_while_the_queue_stays_busy() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let mut config = config();
        config.state.lease_ttl_secs = 1;
        let takeover = Arc::new(Mutex::new(None));
        let source: Arc<dyn SourceAdapter> = Arc::new(DrivenSource::new(
            Arc::new(BusyFetcher {
                store: Arc::clone(&store),
                busy_for: Duration::from_millis(1_600),
                takeover: Arc::clone(&takeover),
            }),
            DriverSettings::new("busy", 1),
        ));
        let report = Pipeline::new(config, source, Box::new(SlowDestination), Arc::clone(&store))
            .run(CancellationToken::new())
            .await;

        assert_eq!(*takeover.lock().unwrap(), Some(false));
        assert_eq!(report.state, RunState::Committed, "{report:?}");
        assert!(report.counts.delivered > 0);
    }

    /// One page per partition, no continuation.
    struct OnePage(Vec<Value>);

    #[async_trait]
    impl PageClient for OnePage {
        async fn fetch_page(
            &self,
            _: &str,
            _: Option<&Cursor>,
            _: Option<&str>,
        ) -> Result<Page, ConnectorError> {
            Ok(Page {
                records: self.0.clone(),
                next_token: None,
            })
        }
    }

    fn paged_source(records: Vec<Value>) -> Arc<dyn SourceAdapter> {
        let cursor = RestCursorConfig::from_value(&json!({
            "url": "https://reviews.example.com/{partition}",
            "partitions": ["p1"],
            "cursor_field": "seq",
            "cursor_kind": "offset",
        }))
        .unwrap();
        let fetcher = RestCursorFetcher::new(
            Arc::new(OnePage(records)),
            cursor,
            RetryPolicy::from_resources(&crate::config::types::ResourcesConfig::default()),
        );
        Arc::new(DrivenSource::new(Arc::new(fetcher), DriverSettings::new("reviews", 1)))
    }

    #[tokio::test]
    async fn record_without_cursor_is_dead_lettered_under_skip() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let (dest, log) = RecordingDestination::new();
        let source = paged_source(vec![
            json!({"id": "a", "seq": 1}),
            json!({"id": "b"}),
            json!({"id": "c", "seq": 3}),
        ]);
        let report = Pipeline::new(config(), source, Box::new(dest), Arc::clone(&store))
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Committed, "{report:?}");
        assert_eq!(report.counts.extracted, 3);
        assert_eq!(report.counts.rejected, 1);
        assert_eq!(report.committed_cursor, Some(Cursor::Offset(3)));
        assert_eq!(log.lock().unwrap().batches, vec![vec!["a", "c"]]);

        let dlq = store
            .list_dlq_records(&JobId::new("unit"), report.run_id)
            .unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].kind, DlqKind::RejectedRecord);
        assert_eq!(dlq[0].subject, "b");
        assert!(dlq[0].error_message.contains("seq"));
    }

    #[tokio::test]
    async fn record_without_cursor_fails_the_run_under_fail() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let mut config = config();
        config.resources.on_schema_error = SchemaErrorPolicy::Fail;
        let (dest, _log) = RecordingDestination::new();
        let source = paged_source(vec![json!({"id": "a", "seq": 1}), json!({"id": "b"})]);
        let report = Pipeline::new(config, source, Box::new(dest), Arc::clone(&store))
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.error_kind, Some(crate::errors::ErrorKind::Schema));
        assert!(store
            .load(&JobId::new("unit"), &SourceId::new("feed"))
            .unwrap()
            .is_none());
    }
}
