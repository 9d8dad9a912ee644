pub mod check;
pub mod run;
pub mod scrape;

use std::path::Path;

use anyhow::{Context, Result};
use lovelace_engine::config::parser;
use lovelace_engine::config::types::JobConfig;
use lovelace_engine::config::validator;

/// Parse and validate a job file.
pub(crate) fn load_job(job_path: &Path) -> Result<JobConfig> {
    let config = parser::parse_job(job_path)
        .with_context(|| format!("Failed to parse job: {}", job_path.display()))?;
    validator::validate_job(&config)?;
    Ok(config)
}
