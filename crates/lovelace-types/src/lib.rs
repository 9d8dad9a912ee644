//! Shared lovelace ingestion model types.
//!
//! Pure data: records, cursors, checkpoints, run bookkeeping and the
//! classified connector error. No I/O lives here so every other crate
//! (state backends, engine, CLI) can depend on it freely.

pub mod checkpoint;
pub mod cursor;
pub mod dlq;
pub mod error;
pub mod record;
pub mod state;
