//! Pipeline error model and retry backoff policy helpers.

use std::time::Duration;

use lovelace_state::StateError;
use lovelace_types::error::{BackoffClass, ConnectorError, SchemaError};

// ---------------------------------------------------------------------------
// PipelineError: run-level failure taxonomy
// ---------------------------------------------------------------------------

/// Categorized pipeline error.
///
/// Every terminal failure of a run maps onto one of these variants, and
/// [`PipelineError::kind`] gives it a stable name for reports and run history.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Upstream failure scoped to one sub-unit; isolated and skipped.
    #[error("transient source error: {0}")]
    TransientSource(ConnectorError),

    /// Upstream failure that aborts the run (auth, config, first sub-unit).
    #[error("fatal source error: {0}")]
    FatalSource(ConnectorError),

    /// Raw payload could not be normalized and the job policy is `fail`.
    #[error(transparent)]
    Schema(SchemaError),

    /// The destination rejected a batch on every attempt.
    #[error("delivery failed after {attempts} attempt(s): {source}")]
    Delivery {
        attempts: u32,
        source: ConnectorError,
    },

    /// Checkpoint store read or write failed.
    #[error("checkpoint store error: {0}")]
    Persistence(#[from] StateError),

    /// Cooperative cancellation was requested.
    #[error("run cancelled")]
    Cancelled,

    /// Another run holds (or took over) the key's lease.
    #[error("lease for {job}/{source_id} is held by another run")]
    LeaseUnavailable { job: String, source_id: String },

    /// Host-side failure (task panic, component construction, etc.).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

/// Stable, snake_case failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientSource,
    FatalSource,
    Schema,
    Delivery,
    Persistence,
    Lease,
    Cancelled,
    Infrastructure,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientSource => "transient_source",
            Self::FatalSource => "fatal_source",
            Self::Schema => "schema",
            Self::Delivery => "delivery",
            Self::Persistence => "persistence",
            Self::Lease => "lease",
            Self::Cancelled => "cancelled",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientSource(_) => ErrorKind::TransientSource,
            Self::FatalSource(_) => ErrorKind::FatalSource,
            Self::Schema(_) => ErrorKind::Schema,
            Self::Delivery { .. } => ErrorKind::Delivery,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::LeaseUnavailable { .. } => ErrorKind::Lease,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }

    /// Returns `true` if this wraps a connector error marked retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.as_connector_error().is_some_and(|e| e.retryable)
    }

    /// Returns the typed connector error, if any.
    #[must_use]
    pub fn as_connector_error(&self) -> Option<&ConnectorError> {
        match self {
            Self::TransientSource(e) | Self::FatalSource(e) => Some(e),
            Self::Delivery { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Wrap a panicked or cancelled blocking task.
    pub(crate) fn task_panicked(task: &str, err: &tokio::task::JoinError) -> Self {
        Self::Infrastructure(anyhow::anyhow!("{task} task panicked: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Compute retry delay from error hints and attempt number (1-based).
///
/// `retry_after_ms` wins when present. Otherwise the delay is
/// `initial * 2^(attempt-1)` scaled by backoff class (fast x0.1, normal x1,
/// slow x5) and capped at `max`.
#[must_use]
pub fn compute_backoff(
    err: &ConnectorError,
    attempt: u32,
    initial: Duration,
    max: Duration,
) -> Duration {
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms);
    }

    #[allow(clippy::cast_possible_truncation)]
    let initial_ms = initial.as_millis().min(u128::from(u64::MAX)) as u64;
    let base_ms = match err.backoff_class {
        BackoffClass::Fast => initial_ms / 10,
        BackoffClass::Normal => initial_ms,
        BackoffClass::Slow => initial_ms.saturating_mul(5),
    };
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = Duration::from_millis(base_ms.saturating_mul(factor));
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lovelace_types::error::ErrorCategory;

    const INITIAL: Duration = Duration::from_millis(1_000);
    const MAX: Duration = Duration::from_millis(60_000);

    #[test]
    fn kind_names_are_stable() {
        let cases = [
            (PipelineError::Cancelled, "cancelled"),
            (
                PipelineError::FatalSource(ConnectorError::auth("HTTP_401", "bad token")),
                "fatal_source",
            ),
            (PipelineError::Schema(SchemaError::missing("id")), "schema"),
            (
                PipelineError::Delivery {
                    attempts: 3,
                    source: ConnectorError::transient_network("X", "y"),
                },
                "delivery",
            ),
            (
                PipelineError::LeaseUnavailable {
                    job: "j".into(),
                    source_id: "s".into(),
                },
                "lease",
            ),
            (PipelineError::Persistence(StateError::LockPoisoned), "persistence"),
            (PipelineError::Infrastructure(anyhow::anyhow!("boom")), "infrastructure"),
        ];
        for (err, name) in cases {
            assert_eq!(err.kind().as_str(), name);
        }
    }

    #[test]
    fn connector_errors_expose_retryability() {
        let err = PipelineError::TransientSource(ConnectorError::transient_network(
            "CONN_RESET",
            "connection reset by peer",
        ));
        assert!(err.is_retryable());
        let ce = err.as_connector_error().unwrap();
        assert_eq!(ce.category, ErrorCategory::TransientNetwork);

        let err = PipelineError::Infrastructure(anyhow::anyhow!("spawn failed"));
        assert!(!err.is_retryable());
        assert!(err.as_connector_error().is_none());
    }

    #[test]
    fn delivery_display_includes_attempts() {
        let err = PipelineError::Delivery {
            attempts: 5,
            source: ConnectorError::transient_network("HTTP_503", "unavailable"),
        };
        let msg = err.to_string();
        assert!(msg.contains("5 attempt(s)"));
        assert!(msg.contains("HTTP_503"));
    }

    #[test]
    fn from_anyhow_is_infrastructure() {
        let pe: PipelineError = anyhow::anyhow!("something went wrong").into();
        assert_eq!(pe.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn backoff_fast() {
        let err = ConnectorError::transient_network("X", "y").with_backoff(BackoffClass::Fast);
        assert_eq!(compute_backoff(&err, 1, INITIAL, MAX), Duration::from_millis(100));
        assert_eq!(compute_backoff(&err, 2, INITIAL, MAX), Duration::from_millis(200));
        assert_eq!(compute_backoff(&err, 3, INITIAL, MAX), Duration::from_millis(400));
    }

    #[test]
    fn backoff_normal() {
        let err = ConnectorError::transient_network("X", "y");
        assert_eq!(compute_backoff(&err, 1, INITIAL, MAX), Duration::from_millis(1000));
        assert_eq!(compute_backoff(&err, 2, INITIAL, MAX), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_slow() {
        let err = ConnectorError::rate_limit("X", "y", None);
        assert_eq!(compute_backoff(&err, 1, INITIAL, MAX), Duration::from_millis(5000));
        assert_eq!(compute_backoff(&err, 2, INITIAL, MAX), Duration::from_millis(10000));
    }

    #[test]
    fn backoff_respects_retry_after() {
        let err = ConnectorError::rate_limit("X", "y", Some(7500));
        assert_eq!(compute_backoff(&err, 1, INITIAL, MAX), Duration::from_millis(7500));
        assert_eq!(compute_backoff(&err, 5, INITIAL, MAX), Duration::from_millis(7500));
    }

    #[test]
    fn backoff_capped() {
        let err = ConnectorError::transient_db("X", "y");
        assert_eq!(compute_backoff(&err, 20, INITIAL, MAX), MAX);
        assert_eq!(compute_backoff(&err, 200, INITIAL, MAX), MAX);
    }

    #[test]
    fn backoff_scales_with_initial() {
        let err = ConnectorError::timeout("X", "y");
        let initial = Duration::from_millis(10);
        assert_eq!(compute_backoff(&err, 3, initial, MAX), Duration::from_millis(40));
    }
}
