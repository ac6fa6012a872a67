//! Batched commits with per-group fallback
//!
//! Groups accumulate until the batch is full. A flush resolves each
//! group's source, tries one transaction for the whole batch and, if that
//! still fails after retries, commits group by group so one bad record
//! costs only itself.

use scopus_core::{RetryPolicy, emit};
use serde_json::json;

use crate::schema::RecordGroup;
use crate::store::Store;

/// Default number of groups per commit
pub const DEFAULT_BATCH_SIZE: usize = 5000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    /// Results seen, including failed extractions
    pub processed: usize,
    /// Results that arrived empty
    pub extraction_failures: usize,
    /// Documents committed
    pub committed: usize,
    /// Groups dropped at load time
    pub failed_groups: usize,
    pub batches: usize,
    /// Batches that fell back to per-group commits
    pub fallbacks: usize,
    pub sources_created: usize,
    pub sources_reused: usize,
}

/// The run produced no results at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NothingProcessed;

impl std::fmt::Display for NothingProcessed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "processed 0 records")
    }
}

impl std::error::Error for NothingProcessed {}

pub struct BatchLoader<'s, S: Store + ?Sized> {
    store: &'s S,
    batch_size: usize,
    policy: RetryPolicy,
    pending: Vec<RecordGroup>,
    stats: LoadStats,
}

impl<'s, S: Store + ?Sized> BatchLoader<'s, S> {
    pub fn new(store: &'s S, batch_size: usize, policy: RetryPolicy) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            policy,
            pending: Vec::with_capacity(batch_size),
            stats: LoadStats::default(),
        }
    }

    /// Accept one worker result; `None` is a record that failed upstream.
    pub fn push(&mut self, group: Option<RecordGroup>) {
        self.stats.processed += 1;
        match group {
            Some(group) => self.pending.push(group),
            None => self.stats.extraction_failures += 1,
        }
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Commit everything pending.
    pub fn flush(&mut self) {
        let mut groups = std::mem::take(&mut self.pending);
        self.pending.reserve(self.batch_size);
        if groups.is_empty() {
            return;
        }
        log::info!("Saving after {} records", self.stats.processed);
        self.stats.batches += 1;

        groups.retain_mut(|group| self.resolve_source(group));

        match self.policy.run("bulk insert", || self.store.bulk_insert(&groups)) {
            Ok(()) => self.stats.committed += groups.len(),
            Err(e) => {
                self.stats.fallbacks += 1;
                emit(
                    log::Level::Debug,
                    "falling back to one-by-one",
                    json!({"groups": groups.len(), "error": e.to_string()}),
                );
                for group in &groups {
                    match self.policy.run("insert group", || self.store.insert_group(group)) {
                        Ok(()) => self.stats.committed += 1,
                        Err(e) => {
                            self.stats.failed_groups += 1;
                            emit(
                                log::Level::Error,
                                "loading to database failed",
                                json!({"context": {"eid": group.eid()}, "error": e.to_string()}),
                            );
                        }
                    }
                }
            }
        }
        self.store.release_buffers();
    }

    /// Fill in the group's source id; false drops the group.
    fn resolve_source(&mut self, group: &mut RecordGroup) -> bool {
        let Some(source) = &group.source else {
            return true;
        };
        match self
            .policy
            .run("get or create source", || self.store.get_or_create_source(source))
        {
            Ok((id, created)) => {
                if created {
                    self.stats.sources_created += 1;
                } else {
                    self.stats.sources_reused += 1;
                }
                group.document.source_id = Some(id);
                true
            }
            Err(e) => {
                self.stats.failed_groups += 1;
                emit(
                    log::Level::Error,
                    "loading to database failed",
                    json!({
                        "context": {
                            "eid": group.eid(),
                            "source": {
                                "scopus_source_id": source.scopus_source_id,
                                "issn_print": source.issn_print,
                                "issn_electronic": source.issn_electronic,
                            },
                        },
                        "error": e.to_string(),
                    }),
                );
                false
            }
        }
    }

    /// Flush the remainder; a run that saw no results is an error.
    pub fn finish(mut self) -> Result<LoadStats, NothingProcessed> {
        if self.stats.processed == 0 {
            emit(log::Level::Error, "processed 0 records", serde_json::Value::Null);
            return Err(NothingProcessed);
        }
        self.flush();
        log::info!("Done");
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Citation, Document, SourceDraft};
    use crate::store::{DuckStore, StoreError};
    use scopus_core::capture;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn group(eid: i64, source_id: Option<i64>) -> RecordGroup {
        RecordGroup {
            document: Document {
                eid,
                doi: None,
                pub_year: 2000,
                group_id: None,
                title: format!("T{eid}"),
                title_language: "und".to_string(),
                citation_type: String::new(),
                citation_count: 0,
                source_id: None,
            },
            source: source_id.map(|id| SourceDraft {
                scopus_source_id: id,
                source_type: "j".to_string(),
                source_title: "J".to_string(),
                source_abbrev: String::new(),
                issn_print: None,
                issn_electronic: None,
            }),
            item_ids: Vec::new(),
            authorships: Vec::new(),
            citations: vec![Citation {
                cite_from: 5,
                cite_to: eid,
            }],
            abstract_text: None,
        }
    }

    fn transient() -> StoreError {
        StoreError::Db(duckdb::Error::DuckDBFailure(
            duckdb::ffi::Error::new(duckdb::ffi::DuckDBError),
            Some("IO Error: Could not set lock on file".to_string()),
        ))
    }

    /// In-memory store whose bulk path and source lookup can be made to fail.
    #[derive(Default)]
    struct MemStore {
        fail_bulk: bool,
        /// Bulk attempts that fail transiently before one succeeds
        busy_bulk: AtomicUsize,
        bulk_calls: AtomicUsize,
        fail_source: bool,
        docs: Mutex<Vec<i64>>,
        source_calls: AtomicUsize,
        releases: AtomicUsize,
    }

    impl Store for MemStore {
        fn get_or_create_source(&self, source: &SourceDraft) -> Result<(i64, bool), StoreError> {
            self.source_calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_source {
                return Err(StoreError::Poisoned);
            }
            Ok((source.scopus_source_id * 10, true))
        }

        fn document_exists(&self, eid: i64) -> Result<bool, StoreError> {
            Ok(self.docs.lock().unwrap().contains(&eid))
        }

        fn bulk_insert(&self, groups: &[RecordGroup]) -> Result<(), StoreError> {
            self.bulk_calls.fetch_add(1, Ordering::Relaxed);
            let busy = self.busy_bulk.load(Ordering::Relaxed);
            if busy > 0 {
                self.busy_bulk.store(busy - 1, Ordering::Relaxed);
                return Err(transient());
            }
            if self.fail_bulk {
                return Err(StoreError::Poisoned);
            }
            let mut docs = self.docs.lock().unwrap();
            docs.extend(groups.iter().map(RecordGroup::eid));
            Ok(())
        }

        fn insert_group(&self, group: &RecordGroup) -> Result<(), StoreError> {
            self.docs.lock().unwrap().push(group.eid());
            Ok(())
        }

        fn release_buffers(&self) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn flushes_at_batch_size() {
        let store = MemStore::default();
        let mut loader = BatchLoader::new(&store, 2, RetryPolicy::none());
        loader.push(Some(group(1, None)));
        assert_eq!(loader.stats().batches, 0);
        loader.push(Some(group(2, None)));
        assert_eq!(loader.stats().batches, 1);
        loader.push(None);
        let stats = loader.finish().unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.committed, 2);
        assert_eq!(stats.batches, 1);
        assert_eq!(store.releases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_processed_is_error() {
        let store = MemStore::default();
        let loader = BatchLoader::new(&store, 10, RetryPolicy::none());
        assert_eq!(loader.finish(), Err(NothingProcessed));
    }

    #[test]
    fn only_failed_results_is_not_an_error() {
        let store = MemStore::default();
        let mut loader = BatchLoader::new(&store, 10, RetryPolicy::none());
        loader.push(None);
        let stats = loader.finish().unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.extraction_failures, 1);
        assert_eq!(stats.committed, 0);
    }

    #[test]
    fn source_id_filled_in() {
        let store = DuckStore::open_in_memory().unwrap();
        let mut loader = BatchLoader::new(&store, 10, RetryPolicy::none());
        loader.push(Some(group(11, Some(3))));
        loader.push(Some(group(12, Some(3))));
        let stats = loader.finish().unwrap();

        assert_eq!(stats.sources_created, 1);
        assert_eq!(stats.sources_reused, 1);
        let a = store.document(11).unwrap().unwrap().source_id;
        let b = store.document(12).unwrap().unwrap().source_id;
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn bulk_failure_falls_back_per_group() {
        let store = MemStore {
            fail_bulk: true,
            ..Default::default()
        };
        let mut loader = BatchLoader::new(&store, 10, RetryPolicy::none());
        for eid in 20..23 {
            loader.push(Some(group(eid, None)));
        }
        let stats = loader.finish().unwrap();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.committed, 3);
        assert_eq!(*store.docs.lock().unwrap(), [20, 21, 22]);
    }

    #[test]
    fn transient_bulk_failure_is_retried() {
        let store = MemStore {
            busy_bulk: AtomicUsize::new(1),
            ..Default::default()
        };
        let mut loader = BatchLoader::new(&store, 10, RetryPolicy::immediate(2));
        for eid in 50..53 {
            loader.push(Some(group(eid, None)));
        }
        let stats = loader.finish().unwrap();

        assert!(transient().is_retryable());
        assert_eq!(store.bulk_calls.load(Ordering::Relaxed), 2);
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(stats.committed, 3);
        assert_eq!(*store.docs.lock().unwrap(), [50, 51, 52]);
    }

    #[test]
    fn flush_with_nothing_pending_is_a_no_op() {
        let store = MemStore::default();
        let mut loader = BatchLoader::new(&store, 2, RetryPolicy::none());
        loader.push(Some(group(60, None)));
        loader.push(Some(group(61, None)));
        // the batch already went out at the size threshold
        loader.flush();
        let stats = loader.finish().unwrap();

        assert_eq!(stats.batches, 1);
        assert_eq!(store.releases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn malformed_group_is_isolated() {
        let store = DuckStore::open_in_memory().unwrap();
        store.insert_group(&group(8_800_031, None)).unwrap();

        let guard = capture();
        let mut loader = BatchLoader::new(&store, 10, RetryPolicy::immediate(2));
        loader.push(Some(group(8_800_030, None)));
        // duplicate primary key
        loader.push(Some(group(8_800_031, None)));
        loader.push(Some(group(8_800_032, None)));
        let stats = loader.finish().unwrap();

        assert_eq!(stats.committed, 2);
        assert_eq!(stats.failed_groups, 1);
        assert!(store.document_exists(8_800_030).unwrap());
        assert!(store.document_exists(8_800_032).unwrap());

        let failures: Vec<_> = guard
            .events()
            .into_iter()
            .filter(|e| e.message == "loading to database failed")
            .filter(|e| e.context("eid") == Some(&json!(8_800_031)))
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].level, log::Level::Error);
    }

    #[test]
    fn unresolved_source_drops_group() {
        let store = MemStore {
            fail_source: true,
            ..Default::default()
        };
        let mut loader = BatchLoader::new(&store, 10, RetryPolicy::immediate(3));
        loader.push(Some(group(40, Some(1))));
        loader.push(Some(group(41, None)));
        let stats = loader.finish().unwrap();

        assert_eq!(stats.failed_groups, 1);
        assert_eq!(stats.committed, 1);
        // Poisoned is permanent: no retries
        assert_eq!(store.source_calls.load(Ordering::Relaxed), 1);
        assert_eq!(*store.docs.lock().unwrap(), [41]);
    }
}
