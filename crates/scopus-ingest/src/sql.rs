//! SQL for the DuckDB store.
//!
//! Surrogate keys come from sequences. No foreign keys: citation edges may
//! point at documents that are loaded later or never.

/// Returns the DDL creating every table (idempotent).
pub fn create_schema() -> &'static str {
    "CREATE SEQUENCE IF NOT EXISTS source_id_seq START 1;
     CREATE SEQUENCE IF NOT EXISTS authorship_id_seq START 1;
     CREATE SEQUENCE IF NOT EXISTS itemid_id_seq START 1;
     CREATE SEQUENCE IF NOT EXISTS citation_id_seq START 1;
     CREATE SEQUENCE IF NOT EXISTS abstract_id_seq START 1;

     CREATE TABLE IF NOT EXISTS source (
         id BIGINT PRIMARY KEY DEFAULT nextval('source_id_seq'),
         scopus_source_id BIGINT NOT NULL DEFAULT -1,
         source_type VARCHAR(1),
         source_title VARCHAR(400) NOT NULL,
         source_abbrev VARCHAR(200) NOT NULL,
         issn_print VARCHAR(15),
         issn_electronic VARCHAR(15),
         UNIQUE (scopus_source_id, issn_print, issn_electronic)
     );

     CREATE TABLE IF NOT EXISTS document (
         eid BIGINT PRIMARY KEY,
         doi VARCHAR(150),
         pub_year INTEGER NOT NULL DEFAULT -1,
         group_id BIGINT,
         title VARCHAR(500) NOT NULL,
         title_language VARCHAR(5) NOT NULL DEFAULT '',
         citation_type VARCHAR(5) NOT NULL DEFAULT '',
         citation_count BIGINT NOT NULL DEFAULT 0,
         source_id BIGINT
     );

     CREATE TABLE IF NOT EXISTS itemid (
         id BIGINT PRIMARY KEY DEFAULT nextval('itemid_id_seq'),
         document_id BIGINT NOT NULL,
         item_id VARCHAR(20) NOT NULL,
         item_type VARCHAR(40) NOT NULL
     );

     CREATE TABLE IF NOT EXISTS authorship (
         id BIGINT PRIMARY KEY DEFAULT nextval('authorship_id_seq'),
         document_id BIGINT NOT NULL,
         author_id BIGINT,
         initials VARCHAR(20) NOT NULL DEFAULT '',
         surname VARCHAR(100) NOT NULL,
         seq INTEGER NOT NULL DEFAULT 0,
         affiliation_id BIGINT,
         affiliation VARCHAR NOT NULL DEFAULT '',
         country VARCHAR(10) NOT NULL DEFAULT '',
         city VARCHAR(100) NOT NULL DEFAULT ''
     );

     CREATE TABLE IF NOT EXISTS citation (
         id BIGINT PRIMARY KEY DEFAULT nextval('citation_id_seq'),
         cite_from BIGINT NOT NULL DEFAULT -1,
         cite_to BIGINT NOT NULL DEFAULT -1
     );

     CREATE TABLE IF NOT EXISTS abstract (
         id BIGINT PRIMARY KEY DEFAULT nextval('abstract_id_seq'),
         document_id BIGINT NOT NULL,
         abstract VARCHAR(10000) NOT NULL
     );"
}

/// Returns the lookup for a source key. NULL ISSNs compare equal.
pub fn find_source() -> &'static str {
    "SELECT id FROM source \
     WHERE scopus_source_id = ? \
       AND issn_print IS NOT DISTINCT FROM ? \
       AND issn_electronic IS NOT DISTINCT FROM ? \
     ORDER BY id"
}

/// Returns the source insert, yielding the new surrogate id.
pub fn insert_source() -> &'static str {
    "INSERT INTO source \
     (scopus_source_id, source_type, source_title, source_abbrev, issn_print, issn_electronic) \
     VALUES (?, ?, ?, ?, ?, ?) RETURNING id"
}

/// Returns the eid existence check.
pub fn document_exists() -> &'static str {
    "SELECT count(*) FROM document WHERE eid = ?"
}

/// Multi-row INSERT with `rows` placeholder tuples.
pub fn insert_rows(table: &str, columns: &[&str], rows: usize) -> String {
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![tuple.as_str(); rows].join(", ");
    format!("INSERT INTO {table} ({}) VALUES {values}", columns.join(", "))
}
