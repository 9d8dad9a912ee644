mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "lovelace",
    version,
    about = "Resumable ingestion jobs from community, store and review sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ingestion job once, resuming from its checkpoint
    Run {
        /// Path to job YAML file
        job: PathBuf,
    },
    /// Validate job configuration and build every component
    Check {
        /// Path to job YAML file
        job: PathBuf,
    },
    /// Scrape a single target with a tiered_scrape job and print the result
    Scrape {
        /// Path to job YAML file
        job: PathBuf,
        /// Target identifier substituted into the strategy URLs
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run { job } => commands::run::execute(&job).await,
        Commands::Check { job } => commands::check::execute(&job).await,
        Commands::Scrape { job, target } => commands::scrape::execute(&job, &target).await,
    }
}
