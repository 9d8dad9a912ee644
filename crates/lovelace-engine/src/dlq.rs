//! Dead-letter entries for rejected records and skipped sub-units.

use chrono::Utc;
use lovelace_state::CheckpointStore;
use lovelace_types::dlq::{DlqKind, DlqRecord};
use lovelace_types::error::SchemaError;
use lovelace_types::state::JobId;
use serde_json::Value;

use crate::errors::ErrorKind;
use crate::source::{RawRecord, SkippedSubUnit};

/// A raw record the normalizer rejected.
#[must_use]
pub fn rejected_record(raw: &RawRecord, err: &SchemaError) -> DlqRecord {
    let subject = match raw.payload.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => raw.subunit.clone(),
    };
    DlqRecord {
        kind: DlqKind::RejectedRecord,
        subject,
        payload_json: raw.payload.to_string(),
        error_kind: ErrorKind::Schema.as_str().to_string(),
        error_message: err.to_string(),
        failed_at: Utc::now(),
    }
}

/// A sub-unit abandoned after isolation. The error kind is the connector
/// error category.
#[must_use]
pub fn skipped_subunit(skipped: &SkippedSubUnit) -> DlqRecord {
    DlqRecord {
        kind: DlqKind::SkippedSubUnit,
        subject: skipped.label.clone(),
        payload_json: String::new(),
        error_kind: skipped.category.to_string(),
        error_message: format!("{}: {}", skipped.code, skipped.message),
        failed_at: Utc::now(),
    }
}

/// Persist collected DLQ records to the checkpoint store.
pub(crate) fn persist_dlq_records(
    store: &dyn CheckpointStore,
    job: &JobId,
    run_id: i64,
    records: &[DlqRecord],
) {
    if records.is_empty() {
        return;
    }

    let dlq_count = records.len();

    match store.insert_dlq_records(job, run_id, records) {
        Ok(inserted) => {
            tracing::info!(
                job = job.as_str(),
                dlq_records = inserted,
                "Persisted DLQ records to checkpoint store"
            );
        }
        Err(e) => {
            tracing::error!(
                job = job.as_str(),
                dlq_count,
                error = %e,
                "Failed to persist DLQ records"
            );
        }
    }
}
