//! Record extraction from a document XML and its citedby XML
//!
//! Field lookups go through [`get_one`], which expects a query to match
//! exactly one node. Deviations are logged as structured events and the
//! lookup falls back to a default (zero matches) or the first match (more
//! than one). Only eid and title are mandatory.

use std::borrow::Cow;
use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};
use scopus_core::{XmlPair, emit};
use serde_json::{Value, json};

use crate::xml::{Match, Node, XmlError, XmlTree};

const EID: &str = "/xocs:doc/xocs:meta/xocs:eid/text()";
const PUB_YEAR: &str = "/xocs:doc/xocs:meta/xocs:pub-year/text()";
const SORT_YEAR: &str = "/xocs:doc/xocs:meta/xocs:sort-year/text()";
const GROUP_ID: &str = "/xocs:doc/xocs:meta/cto:group-id/text()";
const DOI: &str = "/xocs:doc/xocs:meta/xocs:doi/text()";
const TITLE: &str =
    "/xocs:doc/xocs:item/item/bibrecord/head/citation-title/titletext[@original=\"y\"]";
const TITLE_LANGUAGE: &str =
    "/xocs:doc/xocs:item/item/bibrecord/head/citation-title/titletext[@original=\"y\"]/@xml:lang";
const CITATION_TYPE: &str = "/xocs:doc/xocs:item/item/bibrecord/head/citation-info/citation-type/@*";
const ABSTRACT: &str =
    "/xocs:doc/xocs:item/item/bibrecord/head/abstracts/abstract[@original=\"y\"]//ce:para";
const ITEM_IDS: &str = "/xocs:doc/xocs:item/item/bibrecord/item-info/itemidlist/itemid";
const SOURCE: &str = "/xocs:doc/xocs:item/item/bibrecord/head/source";
const AUTHOR_GROUPS: &str = "/xocs:doc/xocs:item/item/bibrecord/head/author-group";
const ALL_AUTHORS: &str = "/xocs:doc/xocs:item/item/bibrecord/head//author";

/// Prefix of Scopus identifiers (`2-s2.0-85012345678`)
const ID_PREFIX: &str = "2-s2.0-";

/// Default title language: ISO 639-2 "undetermined"
const UNDETERMINED_LANGUAGE: &str = "und";

// =============================================================================
// Selection
// =============================================================================

/// What a zero-match lookup should log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissing {
    Warn,
    Ignore,
}

/// Evaluate `path` against `node`, expecting exactly one match.
///
/// Zero matches log a warning (unless `on_missing` is `Ignore`) and return
/// `None`; several matches log an error and return the first. Never fails.
pub fn get_one<'t>(
    node: Node<'t>,
    path: &str,
    context: &Value,
    on_missing: OnMissing,
) -> Option<Match<'t>> {
    let matches = match node.select(path) {
        Ok(matches) => matches,
        Err(e) => {
            emit(
                log::Level::Error,
                "invalid query",
                json!({"path": path, "error": e.to_string(), "context": context}),
            );
            return None;
        }
    };
    let found = matches.len();
    if found > 1 {
        emit(
            log::Level::Error,
            "expected exactly one match",
            json!({"path": path, "found": found, "context": context}),
        );
    } else if found == 0 && on_missing == OnMissing::Warn {
        emit(
            log::Level::Warn,
            "expected exactly one match",
            json!({"path": path, "found": 0, "context": context}),
        );
    }
    matches.into_iter().next()
}

/// [`get_one`] returning the match's string value.
pub fn get_str<'t>(
    node: Node<'t>,
    path: &str,
    context: &Value,
    on_missing: OnMissing,
) -> Option<Cow<'t, str>> {
    get_one(node, path, context, on_missing).map(|m| m.string_value())
}

/// Collapse whitespace runs to one space and trim.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Integer after the `2-s2.0-` prefix.
pub fn id_to_int(raw: &str) -> Option<i64> {
    let (_, digits) = raw.trim().split_once(ID_PREFIX)?;
    digits.trim().parse().ok()
}

// =============================================================================
// Records
// =============================================================================

/// Map that iterates in first-insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<K: Hash + Eq, V> {
    index: FxHashMap<K, usize>,
    entries: Vec<(K, V)>,
}

impl<K: Hash + Eq, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self {
            index: FxHashMap::default(),
            entries: Vec::new(),
        }
    }
}

impl<K: Hash + Eq + Clone, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; an overwritten key keeps its position.
    pub fn insert(&mut self, key: K, value: V) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn entry_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        let i = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                let i = self.entries.len();
                self.index.insert(key.clone(), i);
                self.entries.push((key, V::default()));
                i
            }
        };
        &mut self.entries[i].1
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }
}

/// Publication venue as found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// `srcid`, -1 when absent
    pub source_id: i64,
    pub title: String,
    pub abbrev: String,
    pub source_type: String,
    pub issn_print: Option<String>,
    pub issn_electronic: Option<String>,
}

/// One author as listed in an author group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthorKey {
    pub author_id: Option<i64>,
    pub initials: Option<String>,
    pub surname: String,
    pub seq: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffiliationInfo {
    /// Text of each `organization` node
    pub organizations: Vec<String>,
    pub country: String,
    /// City, with `, STATE` appended when a state is given
    pub city: String,
}

/// Author → (affiliation id → affiliation), both in document order.
pub type AuthorMap = OrderedMap<AuthorKey, OrderedMap<Option<i64>, AffiliationInfo>>;

/// Fields of one document XML.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    pub eid: i64,
    pub pub_year: i32,
    pub group_id: Option<i64>,
    pub title: String,
    pub title_language: String,
    pub citation_type: String,
    pub abstract_text: String,
    pub doi: Option<String>,
    /// Identifier type → identifier
    pub item_ids: OrderedMap<String, String>,
    pub source: Option<SourceInfo>,
    pub authors: AuthorMap,
}

/// Fields of one citedby XML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedCitations {
    pub count: i64,
    /// Documents citing this one
    pub cited_eids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRecord {
    pub document: ExtractedDocument,
    pub citations: ExtractedCitations,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum ExtractError {
    Xml(XmlError),
    MissingEid,
    InvalidEid(String),
    /// Document-level failure after the eid is known
    Document { eid: i64, message: String },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xml(e) => write!(f, "{e}"),
            Self::MissingEid => write!(f, "document has no eid"),
            Self::InvalidEid(raw) => write!(f, "invalid eid {raw:?}"),
            Self::Document { eid, message } => write!(f, "document {eid}: {message}"),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Xml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<XmlError> for ExtractError {
    fn from(e: XmlError) -> Self {
        Self::Xml(e)
    }
}

impl ExtractError {
    pub fn eid(&self) -> Option<i64> {
        match self {
            Self::Document { eid, .. } => Some(*eid),
            _ => None,
        }
    }
}

fn parse_number<T: std::str::FromStr>(eid: i64, field: &str, raw: &str) -> Result<T, ExtractError> {
    raw.trim().parse().map_err(|_| ExtractError::Document {
        eid,
        message: format!("invalid {field} {raw:?}"),
    })
}

// =============================================================================
// Document
// =============================================================================

/// Extract the fields of a document XML.
pub fn extract_document(xml: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let tree = XmlTree::parse(xml)?;
    let doc = tree.document();

    let raw_eid = get_str(doc, EID, &Value::Null, OnMissing::Warn).ok_or(ExtractError::MissingEid)?;
    let eid = id_to_int(&raw_eid).ok_or_else(|| ExtractError::InvalidEid(raw_eid.into_owned()))?;
    let context = json!({"eid": eid});

    let title = get_one(doc, TITLE, &context, OnMissing::Warn)
        .map(|m| clean_text(&m.string_value()))
        .ok_or_else(|| ExtractError::Document {
            eid,
            message: "missing title".to_string(),
        })?;

    let title_language = get_str(doc, TITLE_LANGUAGE, &context, OnMissing::Ignore)
        .filter(|lang| !lang.is_empty())
        .map_or_else(|| UNDETERMINED_LANGUAGE.to_string(), Cow::into_owned);

    let citation_type = get_str(doc, CITATION_TYPE, &context, OnMissing::Warn)
        .map(Cow::into_owned)
        .unwrap_or_default();

    let abstract_text = get_one(doc, ABSTRACT, &context, OnMissing::Ignore)
        .map(|m| clean_text(&m.string_value()))
        .unwrap_or_default();

    let mut pub_year = match get_str(doc, PUB_YEAR, &context, OnMissing::Ignore) {
        Some(raw) => parse_number(eid, "pub-year", &raw)?,
        None => -1,
    };
    if pub_year == -1 {
        pub_year = match get_str(doc, SORT_YEAR, &context, OnMissing::Warn) {
            Some(raw) => parse_number(eid, "sort-year", &raw)?,
            None => -1,
        };
    }

    let group_id = match get_str(doc, GROUP_ID, &context, OnMissing::Warn) {
        Some(raw) => Some(parse_number(eid, "group-id", &raw)?),
        None => None,
    };

    let doi = get_str(doc, DOI, &context, OnMissing::Ignore)
        .map(|raw| raw.trim().to_string())
        .filter(|doi| !doi.is_empty());

    Ok(ExtractedDocument {
        eid,
        pub_year,
        group_id,
        title,
        title_language,
        citation_type,
        abstract_text,
        doi,
        item_ids: item_ids(doc, eid)?,
        source: source(doc, eid)?,
        authors: authors(doc, eid)?,
    })
}

fn item_ids(doc: Node<'_>, eid: i64) -> Result<OrderedMap<String, String>, ExtractError> {
    let mut out = OrderedMap::new();
    for m in doc.select(ITEM_IDS)? {
        let Some(node) = m.as_node() else { continue };
        let value = node.text_content().trim().to_string();
        match node.attr("idtype") {
            Some(idtype) => out.insert(idtype.to_string(), value),
            None => emit(
                log::Level::Warn,
                "itemid without idtype",
                json!({"context": {"eid": eid}, "value": value}),
            ),
        }
    }
    Ok(out)
}

fn source(doc: Node<'_>, eid: i64) -> Result<Option<SourceInfo>, ExtractError> {
    let Some(node) = get_one(doc, SOURCE, &json!({"eid": eid}), OnMissing::Warn)
        .and_then(|m| m.as_node())
    else {
        return Ok(None);
    };

    let source_id = match node.attr("srcid") {
        Some(raw) => parse_number(eid, "srcid", raw)?,
        None => -1,
    };
    let context = json!({"eid": eid, "srcid": source_id});
    let child_text = |name: &str| {
        node.child(name)
            .map(|c| clean_text(&c.text_content()))
            .unwrap_or_default()
    };
    let issn = |path: &str| {
        get_str(node, path, &context, OnMissing::Ignore)
            .map(|raw| raw.trim().to_string())
    };

    Ok(Some(SourceInfo {
        source_id,
        title: child_text("sourcetitle"),
        abbrev: child_text("sourcetitle-abbrev"),
        source_type: get_str(node, "./@type", &context, OnMissing::Ignore)
            .map(Cow::into_owned)
            .unwrap_or_default(),
        issn_print: issn(".//issn[@type='print']/text()"),
        issn_electronic: issn(".//issn[@type='electronic']/text()"),
    }))
}

/// Affiliation of an author group; `None` id when absent or unparsable.
fn affiliation(group: Node<'_>, eid: i64) -> (Option<i64>, AffiliationInfo) {
    let Some(node) = get_one(group, ".//affiliation", &json!({"eid": eid}), OnMissing::Ignore)
        .and_then(|m| m.as_node())
    else {
        return (None, AffiliationInfo::default());
    };

    let afid = node.attr("afid").and_then(|raw| match raw.trim().parse() {
        Ok(afid) => Some(afid),
        Err(_) => {
            emit(
                log::Level::Error,
                "invalid affiliation id",
                json!({"context": {"eid": eid}, "afid": raw}),
            );
            None
        }
    });

    let city_group = node.attr("city-group").unwrap_or_default();
    let mut city = node.attr("city").unwrap_or_default().to_string();
    if city.is_empty() {
        city = city_group.to_string();
    } else if !city_group.is_empty() {
        emit(
            log::Level::Warn,
            "city-group and city elements both present",
            json!({"context": {"eid": eid}, "city": city, "city-group": city_group}),
        );
    }
    if let Some(state) = node.attr("state").filter(|s| !s.is_empty()) {
        city.push_str(", ");
        city.push_str(state);
    }

    let info = AffiliationInfo {
        organizations: node
            .children_named("organization")
            .map(|org| clean_text(&org.text_content()))
            .collect(),
        country: node.attr("country").unwrap_or_default().to_string(),
        city,
    };
    (afid, info)
}

fn authors(doc: Node<'_>, eid: i64) -> Result<AuthorMap, ExtractError> {
    let mut authors = AuthorMap::new();

    for group in doc.select(AUTHOR_GROUPS)?.iter().filter_map(Match::as_node) {
        let (afid, info) = affiliation(group, eid);

        for author in group.children_named("author") {
            let mut context = json!({"eid": eid, "afid": afid});
            let author_id = match get_str(author, "@auid", &context, OnMissing::Ignore) {
                Some(raw) => Some(parse_number::<i64>(eid, "auid", &raw)?),
                None => None,
            };
            context["auid"] = json!(author_id);

            let seq = match get_str(author, "@seq", &context, OnMissing::Ignore) {
                None => 1,
                Some(raw) if raw.is_empty() => {
                    let n_author_nodes = doc.select(ALL_AUTHORS).map_or(0, |m| m.len());
                    emit(
                        log::Level::Warn,
                        "empty seq attribute, using 1",
                        json!({"context": context, "n_author_nodes": n_author_nodes}),
                    );
                    1
                }
                Some(raw) => parse_number(eid, "seq", &raw)?,
            };

            let surname = get_str(author, "./ce:surname", &context, OnMissing::Warn)
                .map(|s| clean_text(&s))
                .unwrap_or_default();
            let initials = get_str(author, "./ce:initials", &context, OnMissing::Ignore)
                .map(|s| clean_text(&s));

            let key = AuthorKey {
                author_id,
                initials,
                surname,
                seq,
            };
            authors.entry_or_default(key).insert(afid, info.clone());
        }
    }

    let distinct_seqs: FxHashSet<i32> = authors.keys().map(|k| k.seq).collect();
    if distinct_seqs.len() < authors.len() {
        emit(
            log::Level::Debug,
            "duplicate seq values for authors",
            json!({"context": {"eid": eid}, "authors": authors.len(), "distinct_seqs": distinct_seqs.len()}),
        );
    }
    Ok(authors)
}

// =============================================================================
// Citations
// =============================================================================

/// Extract the citation count and citing eids of a citedby XML.
pub fn extract_citations(xml: &[u8]) -> Result<ExtractedCitations, ExtractError> {
    let tree = XmlTree::parse(xml)?;
    let root = tree.root_element().ok_or(XmlError::NoRoot)?;

    let mut cited_eids = Vec::new();
    for citing in root.children_named("citing-doc") {
        let raw = citing.child("eid").map(|e| e.text_content()).unwrap_or_default();
        match id_to_int(&raw) {
            Some(eid) => cited_eids.push(eid),
            None => emit(
                log::Level::Warn,
                "citing-doc without a valid eid",
                json!({"eid": raw.trim()}),
            ),
        }
    }

    let count_text = root.child("count").map(|c| c.text_content());
    let count = match count_text.as_deref().map(str::trim).map(str::parse::<i64>) {
        Some(Ok(count)) => count,
        _ => {
            emit(
                log::Level::Warn,
                "citation count missing or invalid, using citing-doc count",
                json!({"count": count_text, "citing_docs": cited_eids.len()}),
            );
            cited_eids.len() as i64
        }
    };

    Ok(ExtractedCitations { count, cited_eids })
}

/// Extract both halves of a pair, logging and dropping failures.
pub fn extract_pair(pair: &XmlPair) -> Option<ExtractedRecord> {
    let document = match extract_document(&pair.document) {
        Ok(document) => document,
        Err(e) => {
            emit(
                log::Level::Error,
                "document extraction failed",
                json!({"context": {"eid": e.eid(), "path": pair.path}, "error": e.to_string()}),
            );
            return None;
        }
    };
    let citations = match extract_citations(&pair.citations) {
        Ok(citations) => citations,
        Err(e) => {
            emit(
                log::Level::Error,
                "citation extraction failed",
                json!({"context": {"eid": document.eid, "path": pair.path}, "error": e.to_string()}),
            );
            return None;
        }
    };
    Some(ExtractedRecord {
        document,
        citations,
    })
}
