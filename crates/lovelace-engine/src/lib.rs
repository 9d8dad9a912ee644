//! Resumable ingestion runtime for lovelace jobs: source adapters,
//! normalization, batched delivery and checkpointing.

pub mod checkpoint;
pub mod config;
pub mod dlq;
pub mod errors;
pub mod http;
pub mod normalize;
pub mod orchestrator;
pub mod resolve;
pub mod result;
pub mod retry;
pub mod sink;
pub mod source;

// Re-export public API for convenience
pub use errors::{ErrorKind, PipelineError};
pub use orchestrator::{check_job, run_job, Pipeline};
pub use result::{CheckResult, RunCounts, RunReport, RunState};
