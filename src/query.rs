//! Query pipeline and the `query` / `accept` / `reject` commands.
//!
//! `query` is read-only unless `--accept` or `--track` is passed. Search
//! over-fetches `top_k × candidate_multiplier` candidates so the ranker
//! can promote recent or frequently accepted patterns that were not in the
//! raw similarity top-k, then truncates to `top_k`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::extractor::{build_glob, parse_date};
use crate::lock::WriterLock;
use crate::models::{Feedback, Pattern};
use crate::ranker::{Ranker, Recommendation};
use crate::search::{search, validate_top_k, SearchFilters};
use crate::store::VectorStore;

/// Embed `text`, search, and rank. An empty store yields an empty list.
pub async fn recommend(
    store: &VectorStore,
    embedder: &Arc<Embedder>,
    ranker: &Ranker,
    text: &str,
    top_k: i64,
    filters: &SearchFilters,
    candidate_multiplier: usize,
) -> Result<Vec<Recommendation>> {
    let top_k = validate_top_k(top_k)?;
    if text.trim().is_empty() {
        return Err(Error::InvalidInput("query text is empty".to_string()));
    }

    let worker = Arc::clone(embedder);
    let owned = text.to_string();
    let query = tokio::task::spawn_blocking(move || worker.embed(&owned))
        .await
        .map_err(|e| Error::Inference(format!("embedding task failed: {}", e)))??;

    let fetch = top_k.saturating_mul(candidate_multiplier.max(1));
    let fetch = i64::try_from(fetch).unwrap_or(i64::MAX);
    let results = search(store, &query, fetch, filters).await?;

    let mut ranked = ranker.rank(results);
    ranked.truncate(top_k);
    Ok(ranked)
}

/// `<short revision> <file_path>`, with `unknown` for missing parts.
pub fn provenance(pattern: &Pattern) -> String {
    let path = if pattern.file_path.is_empty() {
        "unknown"
    } else {
        pattern.file_path.as_str()
    };
    format!("{} {}", pattern.short_revision(), path)
}

fn print_text(recommendations: &[Recommendation]) {
    if recommendations.is_empty() {
        println!("No recommendations.");
        return;
    }
    for (i, rec) in recommendations.iter().enumerate() {
        let description = rec.pattern.description.lines().next().unwrap_or("");
        println!(
            "{}. [{:.3}] {} ({})",
            i + 1,
            rec.final_score,
            description,
            provenance(&rec.pattern)
        );
        println!("   why: {}", rec.explanation);
        println!("   id: {}", rec.pattern.id);
    }
}

#[derive(serde::Serialize)]
struct JsonRecommendation<'a> {
    rank: usize,
    id: &'a str,
    final_score: f64,
    similarity: f32,
    recency_score: f64,
    usage_score: f64,
    usage_count: u64,
    pattern_type: &'a str,
    description: &'a str,
    revision_id: &'a str,
    file_path: &'a str,
    tags: Vec<&'a str>,
    created_at: i64,
    explanation: &'a str,
}

fn print_json(recommendations: &[Recommendation]) -> Result<()> {
    let out: Vec<JsonRecommendation<'_>> = recommendations
        .iter()
        .enumerate()
        .map(|(i, r)| JsonRecommendation {
            rank: i + 1,
            id: &r.pattern.id,
            final_score: r.final_score,
            similarity: r.similarity,
            recency_score: r.recency_score,
            usage_score: r.usage_score,
            usage_count: r.usage_count,
            pattern_type: r.pattern.pattern_type.as_str(),
            description: &r.pattern.description,
            revision_id: &r.pattern.revision_id,
            file_path: &r.pattern.file_path,
            tags: r.pattern.tags.iter().map(String::as_str).collect(),
            created_at: r.pattern.created_at,
            explanation: &r.explanation,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Flags for `tpr query`.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub text: String,
    pub top: Option<i64>,
    pub tags: Vec<String>,
    pub path: Option<String>,
    pub glob: Option<String>,
    pub since: Option<String>,
    pub min_score: Option<f32>,
    pub json: bool,
    pub accept: Vec<String>,
    pub track: bool,
}

/// `tpr query`.
pub async fn run_query(config: &Config, args: QueryArgs) -> anyhow::Result<()> {
    let top_k = validate_top_k(args.top.unwrap_or(config.retrieval.top_k))?;

    let min_score = args.min_score.unwrap_or(config.retrieval.min_score);
    let filters = SearchFilters {
        tags: args.tags.clone(),
        path_prefix: args.path.clone(),
        path_glob: args.glob.as_deref().map(build_glob).transpose()?,
        since: args.since.as_deref().map(|s| parse_date(s, false)).transpose()?,
        min_score: (min_score > -1.0).then_some(min_score),
    };

    let store = VectorStore::open(&config.db.path).await?;
    let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
    let result = recommend(
        &store,
        &embedder,
        &Ranker::new(),
        &args.text,
        top_k as i64,
        &filters,
        config.retrieval.candidate_multiplier,
    )
    .await;
    let recommendations = match result {
        Ok(r) => r,
        Err(e) => {
            store.close().await;
            return Err(e.into());
        }
    };

    if args.json {
        print_json(&recommendations)?;
    } else {
        print_text(&recommendations);
    }

    let outcome = record_query_feedback(config, &store, &recommendations, &args).await;
    store.close().await;
    outcome
}

async fn record_query_feedback(
    config: &Config,
    store: &VectorStore,
    recommendations: &[Recommendation],
    args: &QueryArgs,
) -> anyhow::Result<()> {
    if args.accept.is_empty() && !args.track {
        return Ok(());
    }

    let surfaced: HashSet<&str> = recommendations
        .iter()
        .map(|r| r.pattern.id.as_str())
        .collect();
    if let Some(missing) = args.accept.iter().find(|id| !surfaced.contains(id.as_str())) {
        anyhow::bail!("cannot accept {}: it was not among the recommendations", missing);
    }

    let _lock = WriterLock::try_acquire(&config.db.path)?;

    if args.track {
        let ids: Vec<String> = recommendations.iter().map(|r| r.pattern.id.clone()).collect();
        store.record_surfaced(&ids).await?;
    }
    for id in &args.accept {
        let score = recommendations
            .iter()
            .find(|r| &r.pattern.id == id)
            .map(|r| r.final_score);
        let metrics = store.record_usage(id).await?;
        store.record_feedback(id, Feedback::Positive, score).await?;
        eprintln!("accepted {} (used {} times)", id, metrics.usage_count);
    }
    Ok(())
}

/// `tpr accept`: record an explicit acceptance, with `feedback`, for each
/// id.
///
/// All ids are checked before any is recorded, so an unknown id changes
/// nothing.
pub async fn run_accept(config: &Config, ids: &[String], feedback: Feedback) -> anyhow::Result<()> {
    let _lock = WriterLock::try_acquire(&config.db.path)?;
    let store = VectorStore::open(&config.db.path).await?;

    let result = accept_all(&store, ids, feedback).await;
    store.close().await;
    for (id, count) in result? {
        println!("accepted {} (used {} times)", id, count);
    }
    Ok(())
}

/// `tpr reject`: record negative feedback for each id. Usage counts, and
/// so ranking, are untouched.
pub async fn run_reject(config: &Config, ids: &[String]) -> anyhow::Result<()> {
    let _lock = WriterLock::try_acquire(&config.db.path)?;
    let store = VectorStore::open(&config.db.path).await?;

    let result = reject_all(&store, ids).await;
    store.close().await;
    for (id, avg) in result? {
        println!("rejected {} (average feedback {:+.2})", id, avg);
    }
    Ok(())
}

async fn ensure_all_exist(store: &VectorStore, ids: &[String]) -> Result<()> {
    for id in ids {
        if store.get_pattern(id).await?.is_none() {
            return Err(Error::PatternNotFound(id.clone()));
        }
    }
    Ok(())
}

async fn accept_all(
    store: &VectorStore,
    ids: &[String],
    feedback: Feedback,
) -> Result<Vec<(String, u64)>> {
    ensure_all_exist(store, ids).await?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let metrics = store.record_usage(id).await?;
        store.record_feedback(id, feedback, None).await?;
        out.push((id.clone(), metrics.usage_count));
    }
    Ok(out)
}

async fn reject_all(store: &VectorStore, ids: &[String]) -> Result<Vec<(String, f64)>> {
    ensure_all_exist(store, ids).await?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let metrics = store.record_feedback(id, Feedback::Negative, None).await?;
        out.push((id.clone(), metrics.avg_feedback.unwrap_or(0.0)));
    }
    Ok(out)
}
