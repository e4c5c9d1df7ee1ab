//! Refresh pipeline: history → patterns → embeddings → store.
//!
//! Candidates are pulled lazily from the extractor and written in batches
//! of `refresh.batch_size`. Each batch is:
//!
//! 1. checked against the store by content hash and embedding model
//!    (unchanged ones are skipped without re-embedding; switching models
//!    re-embeds everything),
//! 2. embedded on a rayon pool inside `spawn_blocking`,
//! 3. written with one `insert_batch` transaction.
//!
//! A candidate whose embedding fails is logged and dropped; the rest of the
//! batch is still written. A store error aborts the run, leaving earlier
//! batches committed.

use std::sync::Arc;

use globset::GlobSet;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::extractor::{build_glob, parse_date, ExtractOptions, PatternExtractor};
use crate::lock::WriterLock;
use crate::models::{EmbeddingRecord, Pattern, PatternRecord};
use crate::progress::{ProgressMode, RefreshProgressEvent, RefreshProgressReporter};
use crate::store::VectorStore;

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub max_revisions: usize,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub path_glob: Option<GlobSet>,
    /// Extract and diff against the store, but embed and write nothing.
    pub dry_run: bool,
}

/// Counts reported at the end of a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub scanned: usize,
    pub extracted: usize,
    /// New or changed records committed (would be committed, in a dry run).
    pub written: usize,
    /// Already present with identical content and model.
    pub skipped: usize,
    /// Candidates dropped because embedding failed.
    pub failed: usize,
    /// Vectors truncated or padded to the target dimension.
    pub coerced: u64,
}

/// Run one refresh against an open store.
///
/// `embedder` may be `None` only for a dry run.
pub async fn refresh(
    config: &Config,
    store: &VectorStore,
    embedder: Option<Arc<Embedder>>,
    options: RefreshOptions,
    progress: &dyn RefreshProgressReporter,
) -> Result<RefreshReport> {
    let embedder = match (embedder, options.dry_run) {
        (Some(e), _) => Some(e),
        (None, true) => None,
        (None, false) => {
            return Err(Error::InvalidInput(
                "an embedder is required unless --dry-run is set".to_string(),
            ))
        }
    };

    if let (Some(embedder), Some(dims)) = (&embedder, store.dims().await?) {
        if embedder.dims() != dims {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: embedder.dims(),
            });
        }
    }

    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.refresh.worker_threads())
            .build()
            .map_err(|e| Error::Inference(format!("failed to build worker pool: {}", e)))?,
    );
    let coerced_before = embedder.as_ref().map_or(0, |e| e.coerced_count());

    let extractor = PatternExtractor::open(&config.repo.path)?;
    let mut candidates = extractor.extract_with(ExtractOptions {
        max_revisions: options.max_revisions,
        since: options.since,
        until: options.until,
        path_glob: options.path_glob.clone(),
    })?;

    tracing::info!(
        repo = %config.repo.path.display(),
        max_revisions = options.max_revisions,
        dry_run = options.dry_run,
        "refresh started"
    );

    let batch_size = config.refresh.batch_size.max(1);
    let mut report = RefreshReport::default();
    let mut batch: Vec<Pattern> = Vec::with_capacity(batch_size);

    loop {
        let next = candidates.next();
        let done = next.is_none();
        if let Some(item) = next {
            batch.push(item?);
        }

        if batch.len() >= batch_size || (done && !batch.is_empty()) {
            let pending = std::mem::take(&mut batch);
            report.extracted += pending.len();
            progress.report(RefreshProgressEvent::Scanning {
                scanned: candidates.stats().scanned as u64,
            });
            write_batch(store, embedder.as_ref(), &pool, pending, options.dry_run, &mut report)
                .await?;
            progress.report(RefreshProgressEvent::Writing {
                written: report.written as u64,
                extracted: report.extracted as u64,
            });
        }

        if done {
            break;
        }
    }

    let stats = candidates.stats();
    report.scanned = stats.scanned;
    report.coerced = embedder
        .as_ref()
        .map_or(0, |e| e.coerced_count().saturating_sub(coerced_before));

    tracing::info!(
        scanned = stats.scanned,
        merges = stats.merges,
        automated = stats.automated,
        empty = stats.empty,
        filtered = stats.filtered,
        extracted = report.extracted,
        written = report.written,
        skipped = report.skipped,
        failed = report.failed,
        "refresh finished"
    );
    if report.coerced > 0 {
        tracing::warn!(
            coerced = report.coerced,
            "embedding dimensions were coerced; set embedding.dims to the model's native size"
        );
    }

    Ok(report)
}

async fn write_batch(
    store: &VectorStore,
    embedder: Option<&Arc<Embedder>>,
    pool: &Arc<rayon::ThreadPool>,
    patterns: Vec<Pattern>,
    dry_run: bool,
    report: &mut RefreshReport,
) -> Result<()> {
    let model = embedder.map(|e| e.model_name());
    let unchanged = store.unchanged_ids(&patterns, model).await?;
    let (fresh, same): (Vec<Pattern>, Vec<Pattern>) = patterns
        .into_iter()
        .partition(|p| !unchanged.contains(&p.id));
    report.skipped += same.len();

    if fresh.is_empty() {
        return Ok(());
    }
    let embedder = match (dry_run, embedder) {
        (false, Some(e)) => Arc::clone(e),
        _ => {
            report.written += fresh.len();
            return Ok(());
        }
    };

    let texts: Vec<String> = fresh.iter().map(|p| p.description.clone()).collect();
    let worker = Arc::clone(&embedder);
    let pool = Arc::clone(pool);
    let vectors = tokio::task::spawn_blocking(move || worker.embed_each(&texts, &pool))
        .await
        .map_err(|e| Error::Inference(format!("embedding task failed: {}", e)))?;

    let now = chrono::Utc::now().timestamp();
    let mut records = Vec::with_capacity(fresh.len());
    for (pattern, vector) in fresh.into_iter().zip(vectors) {
        match vector {
            Ok(embedded) => records.push(PatternRecord {
                embedding: EmbeddingRecord {
                    vector: embedded.vector,
                    norm: embedded.norm,
                    created_at: now,
                    model: embedder.model_name().to_string(),
                },
                pattern,
            }),
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    rev = %pattern.short_revision(),
                    path = %pattern.file_path,
                    error = %e,
                    "skipping candidate"
                );
            }
        }
    }

    if !records.is_empty() {
        let outcome = store.insert_batch(&records).await?;
        report.written += outcome.written;
        report.skipped += outcome.unchanged;
    }
    Ok(())
}

/// `tpr refresh`: parse flags, take the writer lock, run, print counts.
pub async fn run_refresh(
    config: &Config,
    commits: Option<usize>,
    since: Option<&str>,
    until: Option<&str>,
    path: Option<&str>,
    dry_run: bool,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let options = RefreshOptions {
        max_revisions: commits.unwrap_or(config.refresh.max_revisions),
        since: since.map(|s| parse_date(s, false)).transpose()?,
        until: until.map(|s| parse_date(s, true)).transpose()?,
        path_glob: path.map(build_glob).transpose()?,
        dry_run,
    };
    if options.max_revisions == 0 {
        anyhow::bail!("--commits must be > 0");
    }

    let _lock = if dry_run {
        None
    } else {
        Some(WriterLock::try_acquire(&config.db.path)?)
    };

    let store = VectorStore::open(&config.db.path).await?;
    let embedder = if dry_run {
        None
    } else {
        Some(Arc::new(Embedder::from_config(&config.embedding)?))
    };
    let reporter = progress.reporter();

    let report = refresh(config, &store, embedder, options, reporter.as_ref()).await;
    store.close().await;
    let report = report?;

    println!("refresh{}", if dry_run { " (dry run)" } else { "" });
    println!("  revisions scanned: {}", report.scanned);
    println!("  candidates extracted: {}", report.extracted);
    println!("  records written: {}", report.written);
    println!("  records skipped: {}", report.skipped);
    println!("  candidates failed: {}", report.failed);
    Ok(())
}
