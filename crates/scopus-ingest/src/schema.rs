//! Storage entities and their field-length limits
//!
//! Lengths are counted in characters. Oversize values are cut to the limit
//! and reported, never rejected.

use std::sync::LazyLock;

use rustc_hash::FxHashMap;
use scopus_core::emit;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Document,
    Source,
    Authorship,
    ItemId,
    Citation,
    Abstract,
}

impl Entity {
    pub fn name(self) -> &'static str {
        match self {
            Self::Document => "Document",
            Self::Source => "Source",
            Self::Authorship => "Authorship",
            Self::ItemId => "ItemID",
            Self::Citation => "Citation",
            Self::Abstract => "Abstract",
        }
    }
}

/// Maximum length per (entity, field). Fields not listed are unbounded.
pub fn field_limits() -> &'static FxHashMap<(Entity, &'static str), usize> {
    static LIMITS: LazyLock<FxHashMap<(Entity, &'static str), usize>> = LazyLock::new(|| {
        [
            (Entity::Document, "doi", 150),
            (Entity::Document, "title", 500),
            (Entity::Document, "title_language", 5),
            (Entity::Document, "citation_type", 5),
            (Entity::Source, "source_type", 1),
            (Entity::Source, "source_title", 400),
            (Entity::Source, "source_abbrev", 200),
            (Entity::Source, "issn_print", 15),
            (Entity::Source, "issn_electronic", 15),
            (Entity::Authorship, "initials", 20),
            (Entity::Authorship, "surname", 100),
            (Entity::Authorship, "country", 10),
            (Entity::Authorship, "city", 100),
            (Entity::ItemId, "item_id", 20),
            (Entity::ItemId, "item_type", 40),
            (Entity::Abstract, "abstract", 10_000),
        ]
        .into_iter()
        .map(|(entity, field, max)| ((entity, field), max))
        .collect()
    });
    &LIMITS
}

pub fn max_length(entity: Entity, field: &str) -> Option<usize> {
    field_limits().get(&(entity, field)).copied()
}

/// Cut `value` to the field's limit, logging one event if it was longer.
///
/// Returns whether the value was truncated.
pub fn truncate(entity: Entity, field: &'static str, value: &mut String, eid: i64) -> bool {
    let Some(max) = max_length(entity, field) else {
        return false;
    };
    // byte length bounds char count from above
    if value.len() <= max {
        return false;
    }
    let Some((cut, _)) = value.char_indices().nth(max) else {
        return false;
    };
    let length = value.chars().count();
    value.truncate(cut);
    emit(
        log::Level::Warn,
        "truncation of oversize field",
        json!({
            "entity": entity.name(),
            "field": field,
            "max_length": max,
            "length": length,
            "context": {"eid": eid},
        }),
    );
    true
}

pub fn truncate_opt(entity: Entity, field: &'static str, value: &mut Option<String>, eid: i64) {
    if let Some(value) = value {
        truncate(entity, field, value, eid);
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub eid: i64,
    pub doi: Option<String>,
    pub pub_year: i32,
    pub group_id: Option<i64>,
    pub title: String,
    pub title_language: String,
    pub citation_type: String,
    pub citation_count: i64,
    /// Surrogate id of the resolved source row
    pub source_id: Option<i64>,
}

/// Source as seen in one document, before get-or-create resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDraft {
    /// Scopus `srcid`, -1 when absent
    pub scopus_source_id: i64,
    pub source_type: String,
    pub source_title: String,
    pub source_abbrev: String,
    pub issn_print: Option<String>,
    pub issn_electronic: Option<String>,
}

/// One (author, affiliation) pair of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorship {
    pub document_id: i64,
    pub author_id: Option<i64>,
    pub initials: String,
    pub surname: String,
    pub seq: i32,
    pub affiliation_id: Option<i64>,
    /// Organization lines joined with `\n`
    pub affiliation: String,
    pub country: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemId {
    pub document_id: i64,
    pub item_id: String,
    pub item_type: String,
}

/// `cite_from` cites `cite_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Citation {
    pub cite_from: i64,
    pub cite_to: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abstract {
    pub document_id: i64,
    pub abstract_text: String,
}

/// Everything stored for one document, committed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordGroup {
    pub document: Document,
    pub source: Option<SourceDraft>,
    pub item_ids: Vec<ItemId>,
    pub authorships: Vec<Authorship>,
    pub citations: Vec<Citation>,
    pub abstract_text: Option<Abstract>,
}

impl RecordGroup {
    pub fn eid(&self) -> i64 {
        self.document.eid
    }
}
