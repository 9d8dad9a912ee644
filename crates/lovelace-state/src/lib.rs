//! Checkpoint persistence for lovelace ingestion jobs.
//!
//! Provides the [`CheckpointStore`] trait with `SQLite` and `PostgreSQL`
//! implementations for cursor checkpoints, run leases, run history and
//! dead-letter queue storage.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod postgres;
pub mod sqlite;

pub use backend::CheckpointStore;
pub use error::StateError;
pub use postgres::PostgresCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
