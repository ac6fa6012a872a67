//! Scopus Core - Common infrastructure for the Scopus XML loader
//!
//! This crate provides the input side of the pipeline (walking directories
//! and archives, pairing document and citation XML) together with the
//! retry, logging and progress plumbing shared by the other crates.

pub mod error;
pub mod logging;
pub mod pairing;
pub mod progress;
pub mod retry;
pub mod walker;

// Re-exports for convenience
pub use error::IngestError;
pub use logging::{IndicatifLogger, LogEvent, emit, init_logging};
#[cfg(any(test, feature = "test-util"))]
pub use logging::{CaptureGuard, capture};
pub use pairing::{PairMatcher, PairingReport, XmlPair, container_id};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use retry::{RetryPolicy, Retryable};
pub use walker::{ContainerKind, Member, WalkStats, walk};
