//! Scopus Ingest - XML extraction and DuckDB loading
//!
//! Turns paired Scopus document/citation XML into relational records and
//! commits them in batches. The pipeline driver lives in [`runner`].

pub mod aggregate;
pub mod config;
pub mod extract;
pub mod loader;
pub mod runner;
pub mod schema;
pub mod sql;
pub mod stats;
pub mod store;
pub mod xml;

// Re-exports
pub use aggregate::aggregate;
pub use config::Config;
pub use extract::{
    ExtractError, ExtractedRecord, extract_citations, extract_document, extract_pair,
};
pub use loader::{BatchLoader, LoadStats, NothingProcessed};
pub use runner::{count_pairs, load, open_store};
pub use schema::RecordGroup;
pub use stats::Summary;
pub use store::{DuckStore, Store, StoreError};
