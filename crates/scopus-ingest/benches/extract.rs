use scopus_core::XmlPair;
use scopus_ingest::{aggregate, extract_pair};

/// Reads `<name>.xml` and `<name>-citedby.xml` from `BENCH_DATA_DIR`.
fn load_pair(name: &str) -> XmlPair {
    let dir = std::env::var("BENCH_DATA_DIR")
        .expect("set BENCH_DATA_DIR to directory with sample data files");
    let dir = std::path::Path::new(&dir);
    let read = |file: String| {
        let path = dir.join(file);
        std::fs::read(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
    };
    XmlPair {
        path: name.to_string(),
        document: read(format!("{name}.xml")),
        citations: read(format!("{name}-citedby.xml")),
    }
}

#[divan::bench]
fn extract_and_aggregate(bencher: divan::Bencher) {
    let pair = load_pair("scopus_sample");
    bencher.bench(|| {
        let record = extract_pair(&pair).unwrap();
        aggregate(record)
    });
}

fn main() {
    divan::main();
}
