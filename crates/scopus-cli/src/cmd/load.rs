//! Load subcommand - extract Scopus XML into DuckDB

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use scopus_core::{SharedProgress, fmt_num};

use super::print_summary;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Scopus XML files or directories, zips or tars thereof
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Number of concurrent extraction workers
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Records per database commit
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// DuckDB database file
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Skip documents already present in the database
    #[arg(long)]
    pub skip_existing: bool,
}

pub fn run(
    args: LoadArgs,
    config: &Config,
    max_retries: Option<u32>,
    progress: &SharedProgress,
) -> Result<()> {
    let mut retry = config.retry.policy();
    if let Some(n) = max_retries {
        retry.max_retries = n;
    }

    let load_config = scopus_ingest::Config {
        inputs: args.paths,
        database: args.database.unwrap_or_else(|| config.database.path.clone()),
        workers: config.workers.resolve(args.jobs),
        batch_size: args.batch_size.unwrap_or(config.batch.size),
        retry,
        skip_existing: args.skip_existing,
    };

    log::info!("Loading Scopus XML");
    log::info!("  Inputs: {:?}", load_config.inputs);
    log::info!("  Database: {}", load_config.database.display());

    let store = scopus_ingest::open_store(&load_config)?;
    let summary = scopus_ingest::load(&load_config, &store, progress)?;

    if progress.is_tty() {
        progress.report(&summary.format_table());
    } else {
        summary.log();
    }

    let counts = store
        .table_counts()
        .context("Failed to count database rows")?;
    let rows: Vec<(&str, String)> = counts
        .into_iter()
        .map(|(table, n)| (table, fmt_num(n.max(0) as usize)))
        .collect();
    print_summary(progress, "Database rows", &rows);

    if summary.has_losses() {
        log::warn!("Some records were not loaded; see the error log above");
    }
    Ok(())
}
