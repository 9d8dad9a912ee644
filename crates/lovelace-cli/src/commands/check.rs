use std::path::Path;

use anyhow::{Context, Result};
use lovelace_engine::config::parser;
use lovelace_engine::orchestrator;

/// Execute the `check` command: validate job config and build every component.
pub async fn execute(job_path: &Path) -> Result<()> {
    let config = parser::parse_job(job_path)
        .with_context(|| format!("Failed to parse job: {}", job_path.display()))?;

    let result = orchestrator::check_job(&config).await;

    print_status("Job config:", result.config_ok);
    print_status("Checkpoint store:", result.state_ok);
    print_status("Source:", result.source_ok);
    print_status("Destination:", result.destination_ok);
    for problem in &result.problems {
        println!("  {problem}");
    }

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, ok: bool) {
    println!("{label:18} {}", if ok { "OK" } else { "FAILED" });
}
