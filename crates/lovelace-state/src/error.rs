//! Checkpoint store error types.

use lovelace_types::cursor::{CursorError, CursorKind};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by [`CheckpointStore`](crate::CheckpointStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying database failure, optionally tagged with the operation.
    #[error("{}backend error: {source}", context_prefix(.context))]
    Backend {
        context: Option<&'static str>,
        #[source]
        source: BoxError,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("checkpoint store lock poisoned")]
    LockPoisoned,

    /// The writer does not hold the lease for this key.
    #[error("lease for {job}/{source_id} is not held by '{holder}'")]
    LeaseNotHeld {
        job: String,
        source_id: String,
        holder: String,
    },

    /// Stored and offered cursors are of different kinds.
    #[error("cursor kind mismatch: stored {stored}, offered {offered}")]
    CursorKindMismatch {
        stored: CursorKind,
        offered: CursorKind,
    },

    /// A stored cursor could not be decoded.
    #[error("stored cursor is corrupt: {0}")]
    CorruptCursor(#[from] CursorError),
}

impl StateError {
    /// Wrap a backend driver error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            context: None,
            source: Box::new(err),
        }
    }

    /// Wrap a backend driver error with the failing operation's name.
    pub fn backend_context<E>(context: &'static str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            context: Some(context),
            source: Box::new(err),
        }
    }
}

fn context_prefix(context: &Option<&'static str>) -> String {
    context.map(|c| format!("{c}: ")).unwrap_or_default()
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::backend_context("commit: select", inner);
        let msg = err.to_string();
        assert!(msg.starts_with("commit: select: backend error"), "got: {msg}");
    }

    #[test]
    fn backend_without_context() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = StateError::backend(inner);
        assert_eq!(err.to_string(), "backend error: boom");
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = StateError::LockPoisoned;
        assert_eq!(err.to_string(), "checkpoint store lock poisoned");
    }

    #[test]
    fn lease_not_held_names_key() {
        let err = StateError::LeaseNotHeld {
            job: "j".into(),
            source_id: "s".into(),
            holder: "run-1".into(),
        };
        assert_eq!(err.to_string(), "lease for j/s is not held by 'run-1'");
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StateError::Io(inner);
        assert!(err.to_string().contains("i/o"));
    }
}
