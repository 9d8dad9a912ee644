use std::path::Path;

use anyhow::Result;
use lovelace_engine::{orchestrator, RunReport};
use tokio_util::sync::CancellationToken;

/// Execute the `run` command: parse, validate, and run a job once.
pub async fn execute(job_path: &Path) -> Result<()> {
    let config = super::load_job(job_path)?;

    tracing::info!(
        job = config.job,
        source = config.source.id,
        source_kind = config.source.kind.as_str(),
        destination = config.destination.kind.as_str(),
        "Job validated"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let report = orchestrator::run_job(&config, cancel).await;
    watcher.abort();
    let report = report?;

    print_summary(&report);
    println!("{}", serde_json::to_string(&report)?);

    if report.is_committed() {
        Ok(())
    } else {
        anyhow::bail!(
            "Job '{}' failed ({}): {}",
            report.job_id,
            report
                .error_kind
                .map_or("unknown", |kind| kind.as_str()),
            report.error_message.as_deref().unwrap_or("no error message")
        )
    }
}

fn format_cursor(cursor: Option<&impl std::fmt::Display>) -> String {
    cursor.map_or_else(|| "-".to_string(), ToString::to_string)
}

#[allow(clippy::cast_precision_loss)]
fn print_summary(report: &RunReport) {
    println!(
        "Job '{}' source '{}': {}",
        report.job_id, report.source_id, report.state
    );
    println!("  Resumed from:    {}", format_cursor(report.resumed_from.as_ref()));
    println!("  Committed:       {}", format_cursor(report.committed_cursor.as_ref()));
    println!("  Extracted:       {}", report.counts.extracted);
    println!(
        "  Delivered:       {} ({} batches)",
        report.counts.delivered, report.counts.batches
    );
    if report.counts.rejected > 0 {
        println!("  Rejected:        {}", report.counts.rejected);
    }
    if report.counts.duplicates > 0 {
        println!("  Duplicates:      {}", report.counts.duplicates);
    }
    if !report.skipped.is_empty() {
        println!("  Skipped units:   {}", report.skipped.len());
        for skipped in &report.skipped {
            println!(
                "    {} [{}] {}: {}",
                skipped.label, skipped.category, skipped.code, skipped.message
            );
        }
    }
    println!("  Duration:        {:.2}s", report.duration_secs);
    if report.duration_secs > 0.0 && report.counts.delivered > 0 {
        println!(
            "  Throughput:      {:.0} records/sec",
            report.counts.delivered as f64 / report.duration_secs
        );
    }
}
