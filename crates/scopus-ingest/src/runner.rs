//! Pipeline driver: walk, pair, extract in parallel, load sequentially
//!
//! ```text
//! producer thread ── XmlPair ──▶ rayon pool ── Option<RecordGroup> ──▶ loader
//! (walk + pair)     (bounded)    (extract +    (bounded)                (batches)
//!                                 aggregate)
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use crossbeam_channel::Sender;
use rayon::iter::{ParallelBridge, ParallelIterator};
use scopus_core::{
    PairMatcher, PairingReport, ProgressContext, RetryPolicy, XmlPair, emit, fmt_num, walk,
};
use serde_json::json;

use crate::aggregate::aggregate;
use crate::config::Config;
use crate::extract::extract_pair;
use crate::loader::BatchLoader;
use crate::schema::RecordGroup;
use crate::stats::Summary;
use crate::store::{DuckStore, Store};

/// Channel slots per worker thread
const QUEUE_PER_WORKER: usize = 64;

/// Count-only progress interval
const COUNT_LOG_EVERY: usize = 100_000;

/// Committed-count refresh interval, in results
const SPINNER_EVERY: usize = 1_000;

/// Open the configured database, creating its directory if needed.
pub fn open_store(config: &Config) -> anyhow::Result<DuckStore> {
    if let Some(dir) = config.database.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create database directory {}", dir.display()))?;
    }
    config
        .retry
        .run("open database", || DuckStore::open(&config.database))
        .with_context(|| format!("Cannot open database {}", config.database.display()))
}

/// Load every input into `store`.
///
/// Fails when an input root cannot be read or when nothing was processed;
/// per-record losses are logged and counted in the summary.
pub fn load<S: Store + ?Sized>(
    config: &Config,
    store: &S,
    progress: &ProgressContext,
) -> anyhow::Result<Summary> {
    config.validate()?;
    let start = Instant::now();
    log::info!(
        "Extracting from XML in {} workers, batch size {}",
        config.workers,
        fmt_num(config.batch_size)
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|i| format!("extract-{i}"))
        .build()
        .context("Failed to create thread pool")?;
    let pool = &pool;

    let capacity = config.workers * QUEUE_PER_WORKER;
    let (task_tx, task_rx) = crossbeam_channel::bounded::<XmlPair>(capacity);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<Option<RecordGroup>>(capacity);
    let pb = progress.stage_line("load");

    let (produced, loaded) = std::thread::scope(|s| {
        let producer = s.spawn(move || produce(config, store, task_tx));

        s.spawn(move || {
            pool.install(|| {
                task_rx
                    .into_iter()
                    .par_bridge()
                    .for_each_with(result_tx, |tx, pair| {
                        // receiver only goes away if the loader died
                        let _ = tx.send(extract_pair(&pair).map(aggregate));
                    });
            });
        });

        let mut loader = BatchLoader::new(store, config.batch_size, config.retry);
        for group in &result_rx {
            loader.push(group);
            pb.inc(1);
            let stats = loader.stats();
            if stats.processed % SPINNER_EVERY == 0 {
                pb.set_message(format!("{} committed", fmt_num(stats.committed)));
            }
        }
        let loaded = loader.finish();
        (producer.join(), loaded)
    });
    pb.finish_and_clear();

    let (pairing, container_failures) = produced
        .map_err(|_| anyhow::anyhow!("Pair producer panicked"))?
        .context("Reading inputs failed")?;
    let load = loaded?;

    let summary = Summary {
        pairing,
        load,
        container_failures,
        elapsed: start.elapsed(),
    };
    Ok(summary)
}

/// Walk and pair every input in order, feeding pairs to the workers.
fn produce<S: Store + ?Sized>(
    config: &Config,
    store: &S,
    tasks: Sender<XmlPair>,
) -> anyhow::Result<(PairingReport, usize)> {
    let policy = config.retry;
    let mut report = PairingReport::default();
    let mut container_failures = 0;

    for input in &config.inputs {
        let mut matcher = PairMatcher::new();
        if config.skip_existing {
            matcher = matcher.with_skip(|eid| already_saved(store, &policy, eid));
        }
        let mut closed = false;
        let walked = walk(input, &policy, &mut |member| {
            let Some(pair) = matcher.offer(member) else {
                return ControlFlow::Continue(());
            };
            if tasks.send(pair).is_err() {
                closed = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })
        .with_context(|| format!("Cannot read input {}", input.display()))?;

        container_failures += walked.failures;
        report.merge(matcher.finish());
        log::debug!(
            "{}: {} XML members in {} containers",
            input.display(),
            fmt_num(walked.members),
            fmt_num(walked.containers)
        );
        anyhow::ensure!(!closed, "Extraction workers stopped early");
    }
    Ok((report, container_failures))
}

/// Existence check for the skip predicate; a failed check loads anyway.
fn already_saved<S: Store + ?Sized>(store: &S, policy: &RetryPolicy, eid: i64) -> bool {
    match policy.run("document exists", || store.document_exists(eid)) {
        Ok(exists) => exists,
        Err(e) => {
            emit(
                log::Level::Warn,
                "existence check failed",
                json!({"context": {"eid": eid}, "error": e.to_string()}),
            );
            false
        }
    }
}

/// Count pairs without reading any member content.
pub fn count_pairs(
    inputs: &[PathBuf],
    policy: &RetryPolicy,
    progress: &ProgressContext,
) -> anyhow::Result<PairingReport> {
    log::warn!("COUNTING ONLY");
    let pb = progress.stage_line("count");
    let mut report = PairingReport::default();
    let mut count = 0usize;

    for input in inputs {
        let mut matcher = PairMatcher::new().count_only(true);
        walk(input, policy, &mut |member| {
            if let Some(pair) = matcher.offer(member) {
                count += 1;
                pb.inc(1);
                if count % COUNT_LOG_EVERY == 0 {
                    log::warn!(
                        "Found {} XML pairs so far. Up to {}",
                        fmt_num(count),
                        pair.path
                    );
                }
            }
            ControlFlow::Continue(())
        })
        .with_context(|| format!("Cannot read input {}", input.display()))?;
        report.merge(matcher.finish());
    }
    pb.finish_and_clear();

    log::warn!("Found {} XML pairs (i.e. documents)", fmt_num(report.pairs));
    Ok(report)
}
