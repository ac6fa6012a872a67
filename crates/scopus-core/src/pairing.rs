//! Pair document XML with its `citedby.xml` sibling
//!
//! Members arrive in walk order. The first member seen for a parent
//! directory waits in a backlog until its partner shows up; whatever is
//! still waiting when input ends is reported as unpaired.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde_json::json;

use crate::logging::emit;
use crate::walker::Member;

/// Suffix that marks the citation member of a pair
pub const CITEDBY_SUFFIX: &str = "citedby.xml";

/// Skip-progress log interval
const SKIP_LOG_EVERY: usize = 100_000;

/// One logical record: the document XML and its citation XML.
///
/// In count-only mode both contents are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlPair {
    /// Path of the document member
    pub path: String,
    pub document: Vec<u8>,
    pub citations: Vec<u8>,
}

/// Outcome of one pairing pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PairingReport {
    pub pairs: usize,
    /// Members rejected by the skip predicate
    pub skipped: usize,
    pub duplicates: usize,
    /// Pairs where both or neither member is a citation file
    pub malformed: usize,
    /// Members whose content could not be read
    pub read_failures: usize,
    /// Paths left without a partner, sorted
    pub unpaired: Vec<String>,
}

impl PairingReport {
    /// Fold the report of another pass into this one.
    pub fn merge(&mut self, other: PairingReport) {
        self.pairs += other.pairs;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.read_failures += other.read_failures;
        self.unpaired.extend(other.unpaired);
    }
}

type SkipFn<'a> = Box<dyn Fn(i64) -> bool + 'a>;

/// Streaming pair matcher over walked members.
pub struct PairMatcher<'a> {
    backlog: FxHashMap<String, (String, Vec<u8>)>,
    skip: Option<SkipFn<'a>>,
    count_only: bool,
    report: PairingReport,
}

impl Default for PairMatcher<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> PairMatcher<'a> {
    pub fn new() -> Self {
        Self {
            backlog: FxHashMap::default(),
            skip: None,
            count_only: false,
            report: PairingReport::default(),
        }
    }

    /// Do not read member contents; emitted pairs carry empty buffers.
    pub fn count_only(mut self, count_only: bool) -> Self {
        self.count_only = count_only;
        self
    }

    /// Skip members whose container id satisfies `skip`.
    ///
    /// The id is the integer after the last `-` of the parent directory
    /// (`.../2-s2.0-85012345678/doc.xml` gives `85012345678`). The
    /// predicate runs before any content is read.
    pub fn with_skip(mut self, skip: impl Fn(i64) -> bool + 'a) -> Self {
        self.skip = Some(Box::new(skip));
        self
    }

    /// Offer one member; returns a pair once both halves have been seen.
    pub fn offer(&mut self, member: Member<'_>) -> Option<XmlPair> {
        let path = member.path().to_string();
        let key = container_key(&path);

        if let Some(skip) = &self.skip {
            if container_id(&key).is_some_and(|id| skip(id)) {
                self.report.skipped += 1;
                if self.report.skipped % SKIP_LOG_EVERY == 0 {
                    emit(
                        log::Level::Info,
                        "skipped files so far",
                        json!({"skipped": self.report.skipped}),
                    );
                }
                return None;
            }
        }

        let content = if self.count_only {
            Vec::new()
        } else {
            match member.read() {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.report.read_failures += 1;
                    emit(
                        log::Level::Error,
                        "failed to read XML member",
                        json!({"path": path, "error": e.to_string()}),
                    );
                    return None;
                }
            }
        };

        let Some((other_path, other_content)) = self.backlog.remove(&key) else {
            self.backlog.insert(key, (path, content));
            return None;
        };

        if other_path == path {
            self.report.duplicates += 1;
            emit(
                log::Level::Error,
                "found duplicate XML files",
                json!({"path": path}),
            );
            self.backlog.insert(key, (path, content));
            return None;
        }

        let pair = match (is_citedby(&path), is_citedby(&other_path)) {
            (true, false) => XmlPair {
                path: other_path,
                document: other_content,
                citations: content,
            },
            (false, true) => XmlPair {
                path,
                document: content,
                citations: other_content,
            },
            _ => {
                self.report.malformed += 1;
                emit(
                    log::Level::Error,
                    "expected one document and one citedby file",
                    json!({"paths": [other_path, path]}),
                );
                return None;
            }
        };
        self.report.pairs += 1;
        Some(pair)
    }

    /// Close the pass, logging skip totals and leftover members.
    pub fn finish(mut self) -> PairingReport {
        if self.report.skipped > 0 {
            emit(
                log::Level::Warn,
                "skipped files (two per document) altogether",
                json!({"skipped": self.report.skipped}),
            );
        }
        if !self.backlog.is_empty() {
            let mut unpaired: Vec<String> =
                self.backlog.into_values().map(|(path, _)| path).collect();
            unpaired.sort();
            emit(
                log::Level::Error,
                "found unpaired XML files",
                json!({"paths": unpaired}),
            );
            self.report.unpaired = unpaired;
        }
        self.report
    }
}

fn is_citedby(path: &str) -> bool {
    path.ends_with(CITEDBY_SUFFIX)
}

/// Parent directory of a member path; archive members use `/` separators.
fn container_key(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Integer after the last `-` of the container key.
pub fn container_id(key: &str) -> Option<i64> {
    key.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_counts() {
        let mut total = PairingReport {
            pairs: 2,
            unpaired: vec!["a/x.xml".to_string()],
            ..Default::default()
        };
        total.merge(PairingReport {
            pairs: 3,
            skipped: 4,
            unpaired: vec!["b/y.xml".to_string()],
            ..Default::default()
        });
        assert_eq!(total.pairs, 5);
        assert_eq!(total.skipped, 4);
        assert_eq!(total.unpaired, ["a/x.xml", "b/y.xml"]);
    }

    #[test]
    fn key_is_parent_dir() {
        assert_eq!(container_key("a/2-s2.0-1/doc.xml"), "a/2-s2.0-1");
        assert_eq!(container_key("doc.xml"), "");
    }

    #[test]
    fn id_from_key() {
        assert_eq!(container_id("batch/2-s2.0-85012345678"), Some(85_012_345_678));
        assert_eq!(container_id("batch/plain"), None);
        assert_eq!(container_id(""), None);
    }

    #[test]
    fn citedby_suffix() {
        assert!(is_citedby("x/2-s2.0-1/2-s2.0-1.citedby.xml"));
        assert!(is_citedby("x/citedby.xml"));
        assert!(!is_citedby("x/2-s2.0-1.xml"));
    }
}
