//! Runtime configuration for a load

use std::path::PathBuf;

use scopus_core::RetryPolicy;

use crate::loader::DEFAULT_BATCH_SIZE;

/// Pipeline configuration, already merged from file and flags
#[derive(Debug, Clone)]
pub struct Config {
    /// Directories, tar or zip archives, or single XML files, in order
    pub inputs: Vec<PathBuf>,
    /// DuckDB database file
    pub database: PathBuf,
    /// Extraction worker threads
    pub workers: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Skip documents whose eid is already stored
    pub skip_existing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            database: PathBuf::from("scopus.duckdb"),
            workers: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            skip_existing: false,
        }
    }
}

impl Config {
    /// Check values that would make the run meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.inputs.is_empty(), "No input paths given");
        anyhow::ensure!(self.workers > 0, "Worker count must be at least 1");
        anyhow::ensure!(self.batch_size > 0, "Batch size must be at least 1");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.batch_size, 5000);
        assert_eq!(c.retry.max_retries, 4);
        assert!(!c.skip_existing);
    }

    #[test]
    fn validate_requires_inputs() {
        assert!(Config::default().validate().is_err());
        let c = Config {
            inputs: vec![PathBuf::from("in")],
            ..Default::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let c = Config {
            inputs: vec![PathBuf::from("in")],
            workers: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
