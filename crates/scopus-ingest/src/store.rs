//! Storage contract and the DuckDB implementation
//!
//! The loader only talks to [`Store`]. [`DuckStore`] serializes access to
//! one DuckDB connection behind a mutex; each entity knows how to insert
//! itself one row at a time or in multi-row statements ([`Row`]).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use duckdb::types::Value;
use duckdb::{Connection, params, params_from_iter};
use scopus_core::{Retryable, emit};
use serde_json::json;

use crate::schema::{Abstract, Authorship, Citation, Document, ItemId, RecordGroup, SourceDraft};
use crate::sql;

/// Placeholder tuples per multi-row INSERT
const ROWS_PER_STATEMENT: usize = 256;

/// DuckDB error classes that a retry will not fix.
const PERMANENT_ERRORS: &[&str] = &[
    "Constraint Error",
    "Conversion Error",
    "Invalid Input Error",
    "Binder Error",
    "Parser Error",
    "Catalog Error",
];

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum StoreError {
    Db(duckdb::Error),
    /// A thread panicked while holding the connection
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(e) => write!(f, "database: {e}"),
            Self::Poisoned => write!(f, "database connection lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Db(e) => Some(e),
            Self::Poisoned => None,
        }
    }
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        Self::Db(e)
    }
}

impl StoreError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Db(e) if e.to_string().contains("Constraint Error"))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Db(duckdb::Error::DuckDBFailure(_, _)) => {
                let msg = self.to_string();
                !PERMANENT_ERRORS.iter().any(|p| msg.contains(p))
            }
            Self::Db(_) | Self::Poisoned => false,
        }
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }
}

// =============================================================================
// Contract
// =============================================================================

/// What the loader needs from persistent storage.
pub trait Store: Send + Sync {
    /// Resolve a source key to its surrogate id, creating the row if needed.
    ///
    /// Returns `(id, created)`. When racing writers left several rows for
    /// one key, the lowest id wins.
    fn get_or_create_source(&self, source: &SourceDraft) -> Result<(i64, bool), StoreError>;

    fn document_exists(&self, eid: i64) -> Result<bool, StoreError>;

    /// Insert every group in one transaction.
    fn bulk_insert(&self, groups: &[RecordGroup]) -> Result<(), StoreError>;

    /// Insert one group in its own transaction.
    fn insert_group(&self, group: &RecordGroup) -> Result<(), StoreError>;

    /// Drop per-batch caches (prepared statements).
    fn release_buffers(&self);
}

/// One table row.
pub trait Row {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Column values in `COLUMNS` order.
    fn values(&self) -> Vec<Value>;

    fn insert(&self, conn: &Connection) -> duckdb::Result<()> {
        let sql = sql::insert_rows(Self::TABLE, Self::COLUMNS, 1);
        conn.prepare_cached(&sql)?
            .execute(params_from_iter(self.values()))?;
        Ok(())
    }

    fn bulk_insert(rows: &[&Self], conn: &Connection) -> duckdb::Result<()> {
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let sql = sql::insert_rows(Self::TABLE, Self::COLUMNS, chunk.len());
            conn.prepare_cached(&sql)?
                .execute(params_from_iter(chunk.iter().flat_map(|row| row.values())))?;
        }
        Ok(())
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn opt_text(s: &Option<String>) -> Value {
    s.as_deref().map_or(Value::Null, text)
}

fn opt_bigint(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::BigInt)
}

impl Row for Document {
    const TABLE: &'static str = "document";
    const COLUMNS: &'static [&'static str] = &[
        "eid",
        "doi",
        "pub_year",
        "group_id",
        "title",
        "title_language",
        "citation_type",
        "citation_count",
        "source_id",
    ];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.eid),
            opt_text(&self.doi),
            Value::Int(self.pub_year),
            opt_bigint(self.group_id),
            text(&self.title),
            text(&self.title_language),
            text(&self.citation_type),
            Value::BigInt(self.citation_count),
            opt_bigint(self.source_id),
        ]
    }
}

impl Row for ItemId {
    const TABLE: &'static str = "itemid";
    const COLUMNS: &'static [&'static str] = &["document_id", "item_id", "item_type"];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.document_id),
            text(&self.item_id),
            text(&self.item_type),
        ]
    }
}

impl Row for Authorship {
    const TABLE: &'static str = "authorship";
    const COLUMNS: &'static [&'static str] = &[
        "document_id",
        "author_id",
        "initials",
        "surname",
        "seq",
        "affiliation_id",
        "affiliation",
        "country",
        "city",
    ];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.document_id),
            opt_bigint(self.author_id),
            text(&self.initials),
            text(&self.surname),
            Value::Int(self.seq),
            opt_bigint(self.affiliation_id),
            text(&self.affiliation),
            text(&self.country),
            text(&self.city),
        ]
    }
}

impl Row for Citation {
    const TABLE: &'static str = "citation";
    const COLUMNS: &'static [&'static str] = &["cite_from", "cite_to"];

    fn values(&self) -> Vec<Value> {
        vec![Value::BigInt(self.cite_from), Value::BigInt(self.cite_to)]
    }
}

impl Row for Abstract {
    const TABLE: &'static str = "abstract";
    const COLUMNS: &'static [&'static str] = &["document_id", "abstract"];

    fn values(&self) -> Vec<Value> {
        vec![Value::BigInt(self.document_id), text(&self.abstract_text)]
    }
}

/// Insert every row of `groups`, entity by entity, in dependency order.
fn insert_groups(conn: &Connection, groups: &[&RecordGroup]) -> duckdb::Result<()> {
    let documents: Vec<&Document> = groups.iter().map(|g| &g.document).collect();
    Document::bulk_insert(&documents, conn)?;

    let item_ids: Vec<&ItemId> = groups.iter().flat_map(|g| &g.item_ids).collect();
    ItemId::bulk_insert(&item_ids, conn)?;

    let authorships: Vec<&Authorship> = groups.iter().flat_map(|g| &g.authorships).collect();
    Authorship::bulk_insert(&authorships, conn)?;

    let citations: Vec<&Citation> = groups.iter().flat_map(|g| &g.citations).collect();
    Citation::bulk_insert(&citations, conn)?;

    let abstracts: Vec<&Abstract> = groups.iter().filter_map(|g| g.abstract_text.as_ref()).collect();
    Abstract::bulk_insert(&abstracts, conn)
}

// =============================================================================
// DuckDB
// =============================================================================

pub struct DuckStore {
    conn: Mutex<Connection>,
}

impl DuckStore {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(sql::create_schema())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Row count of a table.
    pub fn table_count(&self, table: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let count = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Row counts of every table, in dependency order.
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>, StoreError> {
        [
            "source",
            Document::TABLE,
            ItemId::TABLE,
            Authorship::TABLE,
            Citation::TABLE,
            Abstract::TABLE,
        ]
        .into_iter()
        .map(|table| Ok((table, self.table_count(table)?)))
        .collect()
    }

    /// Fetch a stored document by eid.
    pub fn document(&self, eid: i64) -> Result<Option<Document>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT eid, doi, pub_year, group_id, title, title_language, citation_type, \
             citation_count, source_id FROM document WHERE eid = ?",
        )?;
        let mut rows = stmt.query_map([eid], |row| {
            Ok(Document {
                eid: row.get(0)?,
                doi: row.get(1)?,
                pub_year: row.get(2)?,
                group_id: row.get(3)?,
                title: row.get(4)?,
                title_language: row.get(5)?,
                citation_type: row.get(6)?,
                citation_count: row.get(7)?,
                source_id: row.get(8)?,
            })
        })?;
        let document = rows.next().transpose()?;
        Ok(document)
    }

    fn find_source(conn: &Connection, source: &SourceDraft) -> Result<Option<i64>, StoreError> {
        let mut stmt = conn.prepare_cached(sql::find_source())?;
        let ids = stmt
            .query_map(
                params![
                    source.scopus_source_id,
                    source.issn_print,
                    source.issn_electronic
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        if ids.len() > 1 {
            emit(
                log::Level::Warn,
                "several sources share one key, using the lowest id",
                json!({
                    "scopus_source_id": source.scopus_source_id,
                    "issn_print": source.issn_print,
                    "issn_electronic": source.issn_electronic,
                    "ids": ids,
                }),
            );
        }
        Ok(ids.first().copied())
    }
}

impl Store for DuckStore {
    fn get_or_create_source(&self, source: &SourceDraft) -> Result<(i64, bool), StoreError> {
        let conn = self.lock()?;
        if let Some(id) = Self::find_source(&conn, source)? {
            return Ok((id, false));
        }

        let inserted = conn
            .prepare_cached(sql::insert_source())
            .and_then(|mut stmt| {
                stmt.query_row(
                    params![
                        source.scopus_source_id,
                        source.source_type,
                        source.source_title,
                        source.source_abbrev,
                        source.issn_print,
                        source.issn_electronic,
                    ],
                    |row| row.get::<_, i64>(0),
                )
            })
            .map_err(StoreError::from);

        match inserted {
            Ok(id) => Ok((id, true)),
            // another writer created it first
            Err(e) if e.is_constraint() => match Self::find_source(&conn, source)? {
                Some(id) => Ok((id, false)),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn document_exists(&self, eid: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .prepare_cached(sql::document_exists())?
            .query_row([eid], |row| row.get(0))?;
        Ok(count > 0)
    }

    fn bulk_insert(&self, groups: &[RecordGroup]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let refs: Vec<&RecordGroup> = groups.iter().collect();
        insert_groups(&tx, &refs)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_group(&self, group: &RecordGroup) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        group.document.insert(&tx)?;
        for row in &group.item_ids {
            row.insert(&tx)?;
        }
        for row in &group.authorships {
            row.insert(&tx)?;
        }
        for row in &group.citations {
            row.insert(&tx)?;
        }
        if let Some(row) = &group.abstract_text {
            row.insert(&tx)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn release_buffers(&self) {
        if let Ok(conn) = self.lock() {
            conn.flush_prepared_statement_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(issn_print: Option<&str>) -> SourceDraft {
        SourceDraft {
            scopus_source_id: 12,
            source_type: "j".to_string(),
            source_title: "Journal".to_string(),
            source_abbrev: "J".to_string(),
            issn_print: issn_print.map(str::to_string),
            issn_electronic: None,
        }
    }

    fn group(eid: i64) -> RecordGroup {
        RecordGroup {
            document: Document {
                eid,
                doi: None,
                pub_year: 2001,
                group_id: Some(eid),
                title: format!("Doc {eid}"),
                title_language: "eng".to_string(),
                citation_type: "ar".to_string(),
                citation_count: 1,
                source_id: None,
            },
            source: None,
            item_ids: vec![ItemId {
                document_id: eid,
                item_id: eid.to_string(),
                item_type: "SCP".to_string(),
            }],
            authorships: Vec::new(),
            citations: vec![Citation {
                cite_from: 1,
                cite_to: eid,
            }],
            abstract_text: None,
        }
    }

    #[test]
    fn get_or_create_reuses_row() {
        let store = DuckStore::open_in_memory().unwrap();
        let (a, created_a) = store.get_or_create_source(&draft(Some("1234"))).unwrap();
        let (b, created_b) = store.get_or_create_source(&draft(Some("1234"))).unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_eq!(store.table_count("source").unwrap(), 1);
    }

    #[test]
    fn null_issns_share_one_source() {
        let store = DuckStore::open_in_memory().unwrap();
        let (a, _) = store.get_or_create_source(&draft(None)).unwrap();
        let (b, _) = store.get_or_create_source(&draft(None)).unwrap();
        assert_eq!(a, b);
        let (c, _) = store.get_or_create_source(&draft(Some("9"))).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn duplicate_rows_resolve_to_lowest_id() {
        let store = DuckStore::open_in_memory().unwrap();
        {
            // NULLs are distinct for UNIQUE, so racing inserts can both land
            let conn = store.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO source (scopus_source_id, source_type, source_title, source_abbrev) \
                 VALUES (12, 'j', 'A', ''), (12, 'j', 'B', '')",
            )
            .unwrap();
        }
        let (id, created) = store.get_or_create_source(&draft(None)).unwrap();
        assert!(!created);
        assert_eq!(id, 1);
    }

    #[test]
    fn bulk_insert_is_atomic() {
        let store = DuckStore::open_in_memory().unwrap();
        store.bulk_insert(&[group(1), group(2)]).unwrap();
        assert_eq!(store.table_count("document").unwrap(), 2);
        assert_eq!(store.table_count("citation").unwrap(), 2);

        // eid 2 already exists: whole batch rolls back
        let err = store.bulk_insert(&[group(3), group(2)]).unwrap_err();
        assert!(err.is_constraint());
        assert!(!err.is_retryable());
        assert_eq!(store.table_count("document").unwrap(), 2);
        assert!(!store.document_exists(3).unwrap());
    }

    #[test]
    fn insert_group_and_fetch() {
        let store = DuckStore::open_in_memory().unwrap();
        let mut g = group(40);
        g.document.doi = Some("10.1/x".to_string());
        g.abstract_text = Some(Abstract {
            document_id: 40,
            abstract_text: "text".to_string(),
        });
        store.insert_group(&g).unwrap();

        assert!(store.document_exists(40).unwrap());
        assert_eq!(store.document(40).unwrap(), Some(g.document));
        assert_eq!(store.document(41).unwrap(), None);
        assert_eq!(store.table_count("abstract").unwrap(), 1);
    }

    #[test]
    fn bulk_insert_spans_statements() {
        let store = DuckStore::open_in_memory().unwrap();
        let groups: Vec<_> = (0..(ROWS_PER_STATEMENT as i64 + 10)).map(group).collect();
        store.bulk_insert(&groups).unwrap();
        assert_eq!(
            store.table_count("document").unwrap(),
            ROWS_PER_STATEMENT as i64 + 10
        );
        store.release_buffers();
    }

    #[test]
    fn concurrent_get_or_create_one_row() {
        let store = DuckStore::open_in_memory().unwrap();
        let ids: Vec<i64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| store.get_or_create_source(&draft(Some("5555"))).unwrap().0))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.table_count("source").unwrap(), 1);
    }

    #[test]
    fn table_counts_in_order() {
        let store = DuckStore::open_in_memory().unwrap();
        let counts = store.table_counts().unwrap();
        let names: Vec<_> = counts.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            names,
            ["source", "document", "itemid", "authorship", "citation", "abstract"]
        );
        assert!(counts.iter().all(|(_, n)| *n == 0));
    }
}
