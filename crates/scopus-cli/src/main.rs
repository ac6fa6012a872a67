//! scopus-load - bulk loader for Scopus XML snapshots
//!
//! Walks directories, tar and zip archives of Scopus document/citedby XML
//! pairs and loads them into a DuckDB database.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "scopus-load")]
#[command(about = "Extract a Scopus XML snapshot into a database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./scopus-load.toml or ~/.config/scopus-load/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Maximum retry attempts for transient I/O and database failures
    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Extract XML pairs and load them into the database
    Load(cmd::load::LoadArgs),
    /// Count XML pairs without loading
    Count(cmd::count::CountArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let progress = Arc::new(scopus_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug: progress bars show activity
    //   non-TTY: info unless --debug: logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    scopus_core::init_logging(quiet, cli.debug, multi);

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Load(args) => cmd::load::run(args, &config, cli.max_retries, &progress),
        Command::Count(args) => cmd::count::run(args, &config, cli.max_retries, &progress),
        Command::Config => {
            let retry = config.retry.policy();
            cmd::print_summary(
                &progress,
                "Setting",
                &[
                    ("Database", config.database.path.display().to_string()),
                    (
                        "Workers",
                        format!("{} (max: {})", config.workers.default, config.workers.max),
                    ),
                    ("Batch size", config.batch.size.to_string()),
                    (
                        "Retries",
                        format!(
                            "{} (base {}s, x{})",
                            cli.max_retries.unwrap_or(retry.max_retries),
                            retry.base_delay.as_secs(),
                            retry.multiplier
                        ),
                    ),
                ],
            );
            Ok(())
        }
    }
}
