//! Count subcommand - pair XML files without loading anything

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use scopus_core::{SharedProgress, fmt_num};

use super::print_summary;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct CountArgs {
    /// Scopus XML files or directories, zips or tars thereof
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

pub fn run(
    args: CountArgs,
    config: &Config,
    max_retries: Option<u32>,
    progress: &SharedProgress,
) -> Result<()> {
    let mut retry = config.retry.policy();
    if let Some(n) = max_retries {
        retry.max_retries = n;
    }

    let report = scopus_ingest::count_pairs(&args.paths, &retry, progress)?;

    print_summary(
        progress,
        "Count",
        &[
            ("Pairs (documents)", fmt_num(report.pairs)),
            ("Unpaired files", fmt_num(report.unpaired.len())),
            ("Duplicates", fmt_num(report.duplicates)),
            ("Malformed pairs", fmt_num(report.malformed)),
        ],
    );
    Ok(())
}
