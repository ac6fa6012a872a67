//! Map an extracted record onto storage entities

use crate::extract::{ExtractedRecord, SourceInfo};
use crate::schema::{
    Abstract, Authorship, Citation, Document, Entity, ItemId, RecordGroup, SourceDraft, truncate,
    truncate_opt,
};

/// Build the drafts for one record, truncating oversize fields.
///
/// The document's `source_id` stays `None` until the loader resolves the
/// source draft.
pub fn aggregate(record: ExtractedRecord) -> RecordGroup {
    let ExtractedRecord {
        document: doc,
        citations,
    } = record;
    let eid = doc.eid;

    let item_ids = doc
        .item_ids
        .iter()
        .map(|(item_type, item_id)| {
            let mut row = ItemId {
                document_id: eid,
                item_id: item_id.clone(),
                item_type: item_type.clone(),
            };
            truncate(Entity::ItemId, "item_id", &mut row.item_id, eid);
            truncate(Entity::ItemId, "item_type", &mut row.item_type, eid);
            row
        })
        .collect();

    let source = doc.source.map(|source| source_draft(source, eid));

    let mut document = Document {
        eid,
        doi: doc.doi,
        pub_year: doc.pub_year,
        group_id: doc.group_id,
        title: doc.title,
        title_language: doc.title_language,
        citation_type: doc.citation_type,
        citation_count: citations.count,
        source_id: None,
    };
    truncate_opt(Entity::Document, "doi", &mut document.doi, eid);
    truncate(Entity::Document, "title", &mut document.title, eid);
    truncate(Entity::Document, "title_language", &mut document.title_language, eid);
    truncate(Entity::Document, "citation_type", &mut document.citation_type, eid);

    let abstract_text = (!doc.abstract_text.is_empty()).then(|| {
        let mut row = Abstract {
            document_id: eid,
            abstract_text: doc.abstract_text,
        };
        truncate(Entity::Abstract, "abstract", &mut row.abstract_text, eid);
        row
    });

    let mut authorships = Vec::new();
    for (author, affiliations) in doc.authors.iter() {
        for (afid, aff) in affiliations.iter() {
            let mut row = Authorship {
                document_id: eid,
                author_id: author.author_id,
                initials: author.initials.clone().unwrap_or_default(),
                surname: author.surname.clone(),
                seq: author.seq,
                affiliation_id: *afid,
                affiliation: aff.organizations.join("\n"),
                country: aff.country.clone(),
                city: aff.city.clone(),
            };
            truncate(Entity::Authorship, "initials", &mut row.initials, eid);
            truncate(Entity::Authorship, "surname", &mut row.surname, eid);
            truncate(Entity::Authorship, "country", &mut row.country, eid);
            truncate(Entity::Authorship, "city", &mut row.city, eid);
            authorships.push(row);
        }
    }

    let citations = citations
        .cited_eids
        .iter()
        .map(|&citing| Citation {
            cite_from: citing,
            cite_to: eid,
        })
        .collect();

    RecordGroup {
        document,
        source,
        item_ids,
        authorships,
        citations,
        abstract_text,
    }
}

fn source_draft(source: SourceInfo, eid: i64) -> SourceDraft {
    let mut draft = SourceDraft {
        scopus_source_id: source.source_id,
        source_type: source.source_type,
        source_title: source.title,
        source_abbrev: source.abbrev,
        issn_print: source.issn_print,
        issn_electronic: source.issn_electronic,
    };
    truncate(Entity::Source, "source_type", &mut draft.source_type, eid);
    truncate(Entity::Source, "source_title", &mut draft.source_title, eid);
    truncate(Entity::Source, "source_abbrev", &mut draft.source_abbrev, eid);
    truncate_opt(Entity::Source, "issn_print", &mut draft.issn_print, eid);
    truncate_opt(Entity::Source, "issn_electronic", &mut draft.issn_electronic, eid);
    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{
        AffiliationInfo, AuthorKey, AuthorMap, ExtractedCitations, ExtractedDocument, OrderedMap,
    };
    use scopus_core::capture;
    use serde_json::json;

    fn record(eid: i64) -> ExtractedRecord {
        let mut authors = AuthorMap::new();
        let key = |id: i64, seq: i32| AuthorKey {
            author_id: Some(id),
            initials: None,
            surname: format!("Author{id}"),
            seq,
        };
        let aff = |org: &str| AffiliationInfo {
            organizations: vec![org.to_string(), "Dept".to_string()],
            country: "nld".to_string(),
            city: "Delft".to_string(),
        };
        authors.entry_or_default(key(1, 1)).insert(Some(10), aff("Uni A"));
        authors.entry_or_default(key(1, 1)).insert(Some(11), aff("Uni B"));
        authors.entry_or_default(key(2, 2)).insert(None, AffiliationInfo::default());

        let mut item_ids = OrderedMap::new();
        item_ids.insert("PUI".to_string(), "555".to_string());
        item_ids.insert("SCP".to_string(), eid.to_string());

        ExtractedRecord {
            document: ExtractedDocument {
                eid,
                pub_year: 2012,
                group_id: Some(3),
                title: "Title".to_string(),
                title_language: "eng".to_string(),
                citation_type: "ar".to_string(),
                abstract_text: String::new(),
                doi: Some("10.1/abc".to_string()),
                item_ids,
                source: Some(SourceInfo {
                    source_id: 99,
                    title: "Journal".to_string(),
                    abbrev: "J.".to_string(),
                    source_type: "j".to_string(),
                    issn_print: Some("1234".to_string()),
                    issn_electronic: None,
                }),
                authors,
            },
            citations: ExtractedCitations {
                count: 2,
                cited_eids: vec![20, 21],
            },
        }
    }

    #[test]
    fn one_authorship_per_author_affiliation() {
        let group = aggregate(record(100));
        assert_eq!(group.authorships.len(), 3);
        assert_eq!(group.authorships[0].affiliation, "Uni A\nDept");
        assert_eq!(group.authorships[1].affiliation_id, Some(11));
        assert_eq!(group.authorships[2].affiliation_id, None);
        assert_eq!(group.authorships[2].initials, "");
        assert!(group.authorships.iter().all(|a| a.document_id == 100));
    }

    #[test]
    fn documents_ids_and_citations() {
        let group = aggregate(record(101));
        assert_eq!(group.eid(), 101);
        assert_eq!(group.document.citation_count, 2);
        assert_eq!(group.document.source_id, None);
        assert_eq!(group.item_ids.len(), 2);
        assert_eq!(group.item_ids[0].item_type, "PUI");
        assert_eq!(
            group.citations,
            [
                Citation { cite_from: 20, cite_to: 101 },
                Citation { cite_from: 21, cite_to: 101 },
            ]
        );
        assert_eq!(group.source.unwrap().scopus_source_id, 99);
    }

    #[test]
    fn empty_abstract_has_no_row() {
        assert!(aggregate(record(102)).abstract_text.is_none());

        let mut rec = record(103);
        rec.document.abstract_text = "Some text".to_string();
        let abs = aggregate(rec).abstract_text.unwrap();
        assert_eq!(abs.document_id, 103);
    }

    #[test]
    fn oversize_title_truncated_and_reported() {
        let mut rec = record(7_700_104);
        rec.document.title = "t".repeat(620);
        let guard = capture();
        let group = aggregate(rec);

        assert_eq!(group.document.title.len(), 500);
        let events: Vec<_> = guard
            .events()
            .into_iter()
            .filter(|e| e.context("eid") == Some(&json!(7_700_104)))
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field("length"), Some(&json!(620)));
        assert_eq!(events[0].field("max_length"), Some(&json!(500)));
        assert_eq!(events[0].field("entity"), Some(&json!("Document")));
    }

    #[test]
    fn missing_source_stays_none() {
        let mut rec = record(105);
        rec.document.source = None;
        assert!(aggregate(rec).source.is_none());
    }
}
