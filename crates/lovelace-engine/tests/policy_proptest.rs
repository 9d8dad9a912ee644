use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lovelace_engine::config::types::{ResourcesConfig, SinkConfig};
use lovelace_engine::normalize::snake_case;
use lovelace_engine::retry::RetryPolicy;
use lovelace_engine::sink::{BatchSink, Destination, SinkSettings};
use lovelace_state::{CheckpointStore, SqliteCheckpointStore};
use lovelace_types::checkpoint::CommitOutcome;
use lovelace_types::cursor::Cursor;
use lovelace_types::error::ConnectorError;
use lovelace_types::record::{format_timestamp, Record, ID_FIELD, SOURCE_TIMESTAMP_FIELD};
use lovelace_types::state::{JobId, SourceId};
use proptest::prelude::*;
use serde_json::{Map, Value};

struct SizeLog(Arc<Mutex<Vec<usize>>>);

#[async_trait]
impl Destination for SizeLog {
    fn name(&self) -> &str {
        "sizes"
    }

    async fn deliver(&mut self, batch: &[Record]) -> Result<(), ConnectorError> {
        self.0.lock().unwrap().push(batch.len());
        Ok(())
    }
}

fn record(i: usize) -> Record {
    let mut fields = Map::new();
    fields.insert(ID_FIELD.to_string(), Value::String(i.to_string()));
    fields.insert(
        SOURCE_TIMESTAMP_FIELD.to_string(),
        Value::String(format_timestamp(&chrono::Utc::now())),
    );
    Record::try_new(fields).unwrap()
}

fn flushed_sizes(records: usize, max_batch: usize) -> Vec<usize> {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let settings = SinkSettings::new(
        &SinkConfig {
            max_batch_records: max_batch,
            max_batch_wait_ms: 3_600_000,
            max_delivery_attempts: 1,
        },
        RetryPolicy::from_resources(&ResourcesConfig::default()),
    );
    let mut sink = BatchSink::new(Box::new(SizeLog(Arc::clone(&sizes))), settings);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    rt.block_on(async {
        for i in 0..records {
            sink.accept(record(i)).await.unwrap();
        }
        sink.close().await.unwrap();
    });
    let sizes = sizes.lock().unwrap().clone();
    sizes
}

proptest! {
    #[test]
    fn batches_are_full_except_the_last(records in 0_usize..60, max_batch in 1_usize..12) {
        let sizes = flushed_sizes(records, max_batch);

        prop_assert_eq!(sizes.iter().sum::<usize>(), records);
        prop_assert!(sizes.iter().all(|&s| s > 0 && s <= max_batch));
        if let Some((_, full)) = sizes.split_last() {
            prop_assert!(full.iter().all(|&s| s == max_batch));
        }
        prop_assert_eq!(sizes.len(), records.div_ceil(max_batch));
    }

    #[test]
    fn committed_checkpoint_never_moves_backwards(offsets in proptest::collection::vec(0_i64..1_000, 1..20)) {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let job = JobId::new("prop_job");
        let source = SourceId::new("prop_source");
        prop_assert!(store
            .acquire_lease(&job, &source, "holder", Duration::from_secs(60))
            .unwrap());

        let mut highest: Option<i64> = None;
        for offset in offsets {
            let outcome = store
                .commit(&job, &source, &Cursor::Offset(offset), "holder")
                .unwrap();
            let expected = match highest {
                None => CommitOutcome::Advanced,
                Some(h) if offset > h => CommitOutcome::Advanced,
                Some(h) if offset == h => CommitOutcome::Unchanged,
                Some(_) => CommitOutcome::Regressed,
            };
            prop_assert_eq!(outcome, expected);
            highest = Some(highest.map_or(offset, |h| h.max(offset)));

            let stored = store.load(&job, &source).unwrap().unwrap().cursor;
            prop_assert_eq!(stored, Cursor::Offset(highest.unwrap()));
        }
    }

    #[test]
    fn snake_case_is_idempotent(name in "[A-Za-z0-9 _.\\-]{0,24}") {
        let once = snake_case(&name);
        prop_assert_eq!(snake_case(&once), once.clone());
        prop_assert!(once
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        prop_assert!(!once.starts_with('_') && !once.ends_with('_'));
        prop_assert!(!once.contains("__"));
    }
}
