//! Exhaustive nearest-neighbour search over stored pattern vectors.
//!
//! Stored vectors and query vectors are unit length, so cosine similarity
//! is a plain dot product. Results are sorted by score descending, ties by
//! newer `created_at` first and then by id, and truncated to `top_k`.
//!
//! Tag, path-prefix, and `since` filters are pushed down to the store's
//! index tables so they shrink the candidate set before scoring. A path
//! glob and a minimum score are applied while scoring.

use globset::GlobSet;
use std::cmp::Ordering;

use crate::embedding::dot;
use crate::error::{Error, Result};
use crate::models::{Pattern, StoredPattern, UsageMetrics};
use crate::store::{CandidateFilter, VectorStore};

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub tags: Vec<String>,
    pub path_prefix: Option<String>,
    pub path_glob: Option<GlobSet>,
    pub since: Option<i64>,
    pub min_score: Option<f32>,
}

impl SearchFilters {
    fn candidate_filter(&self) -> CandidateFilter {
        CandidateFilter {
            tags: self.tags.clone(),
            path_prefix: self.path_prefix.clone(),
            since: self.since,
        }
    }
}

/// One scored candidate.
#[derive(Debug, Clone)]
pub struct SimilarityResult {
    pub pattern: Pattern,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
    pub metrics: UsageMetrics,
}

/// Validate a caller-supplied result count.
pub fn validate_top_k(top_k: i64) -> Result<usize> {
    if top_k <= 0 {
        return Err(Error::InvalidInput(format!(
            "top_k must be a positive integer, got {}",
            top_k
        )));
    }
    usize::try_from(top_k).map_err(|_| Error::InvalidInput(format!("top_k too large: {}", top_k)))
}

/// Top `top_k` stored patterns most similar to `query`.
pub async fn search(
    store: &VectorStore,
    query: &[f32],
    top_k: i64,
    filters: &SearchFilters,
) -> Result<Vec<SimilarityResult>> {
    let top_k = validate_top_k(top_k)?;

    if let Some(dims) = store.dims().await? {
        if dims != query.len() {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: query.len(),
            });
        }
    }

    let candidates = store.get_embeddings(&filters.candidate_filter()).await?;
    tracing::debug!(candidates = candidates.len(), "scoring candidates");
    Ok(score_candidates(candidates, query, top_k, filters))
}

/// Score, filter, sort, and truncate an in-memory candidate set.
pub fn score_candidates(
    candidates: Vec<StoredPattern>,
    query: &[f32],
    top_k: usize,
    filters: &SearchFilters,
) -> Vec<SimilarityResult> {
    let mut results: Vec<SimilarityResult> = candidates
        .into_iter()
        .filter(|c| match &filters.path_glob {
            Some(glob) => c.pattern.all_paths().any(|p| glob.is_match(p)),
            None => true,
        })
        .map(|c| SimilarityResult {
            similarity: dot(query, &c.vector).clamp(-1.0, 1.0),
            pattern: c.pattern,
            metrics: c.metrics,
        })
        .filter(|r| filters.min_score.map_or(true, |min| r.similarity >= min))
        .collect();

    results.sort_by(|a, b| {
        by_score_then_recency(
            f64::from(a.similarity),
            &a.pattern,
            f64::from(b.similarity),
            &b.pattern,
        )
    });
    results.truncate(top_k);
    results
}

/// Score descending, then newer `created_at`, then id ascending.
pub(crate) fn by_score_then_recency(
    score_a: f64,
    a: &Pattern,
    score_b: f64,
    b: &Pattern,
) -> Ordering {
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then(b.created_at.cmp(&a.created_at))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize_l2;
    use crate::extractor::build_glob;
    use crate::store::test_support::{pattern, record};
    use tempfile::TempDir;

    fn stored(rev: &str, path: &str, created_at: i64, v: Vec<f32>) -> StoredPattern {
        StoredPattern {
            pattern: pattern(rev, path, created_at, &[]),
            vector: normalize_l2(v).0,
            metrics: UsageMetrics::default(),
        }
    }

    #[test]
    fn test_validate_top_k() {
        assert!(matches!(validate_top_k(0), Err(Error::InvalidInput(_))));
        assert!(matches!(validate_top_k(-1), Err(Error::InvalidInput(_))));
        assert_eq!(validate_top_k(5).unwrap(), 5);
    }

    #[test]
    fn test_sorted_descending_and_truncated() {
        let candidates = vec![
            stored("r1", "a.rs", 1, vec![0.0, 1.0]),
            stored("r2", "b.rs", 2, vec![1.0, 0.0]),
            stored("r3", "c.rs", 3, vec![1.0, 1.0]),
        ];
        let out = score_candidates(candidates, &[1.0, 0.0], 2, &SearchFilters::default());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].pattern.file_path, "b.rs");
        assert_eq!(out[1].pattern.file_path, "c.rs");
        assert!(out[0].similarity >= out[1].similarity);
    }

    #[test]
    fn test_ties_prefer_newer() {
        let candidates = vec![
            stored("old", "a.rs", 100, vec![1.0, 0.0]),
            stored("new", "b.rs", 200, vec![1.0, 0.0]),
        ];
        let out = score_candidates(candidates, &[1.0, 0.0], 5, &SearchFilters::default());
        assert_eq!(out[0].pattern.revision_id, "new");
        assert_eq!(out[1].pattern.revision_id, "old");
    }

    #[test]
    fn test_scores_within_bounds() {
        let candidates = vec![
            stored("r1", "a.rs", 1, vec![-1.0, 0.0]),
            stored("r2", "b.rs", 2, vec![1.0, 0.0]),
        ];
        for r in score_candidates(candidates, &[1.0, 0.0], 5, &SearchFilters::default()) {
            assert!((-1.0..=1.0).contains(&r.similarity));
        }
    }

    #[test]
    fn test_glob_and_min_score_filters() {
        let candidates = vec![
            stored("r1", "src/a.rs", 1, vec![1.0, 0.0]),
            stored("r2", "web/b.ts", 2, vec![1.0, 0.1]),
            stored("r3", "src/c.rs", 3, vec![0.0, 1.0]),
        ];
        let filters = SearchFilters {
            path_glob: Some(build_glob("src/**").unwrap()),
            min_score: Some(0.5),
            ..Default::default()
        };
        let out = score_candidates(candidates, &[1.0, 0.0], 5, &filters);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pattern.file_path, "src/a.rs");
    }

    #[tokio::test]
    async fn test_search_empty_store() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("s.sqlite")).await.unwrap();
        let out = search(&store, &[1.0, 0.0], 5, &SearchFilters::default())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_search_rejects_bad_top_k_and_dims() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("s.sqlite")).await.unwrap();
        store
            .insert_batch(&[record(pattern("r1", "a.rs", 1, &["rust"]), vec![1.0, 0.0])])
            .await
            .unwrap();

        for bad in [0, -1] {
            let err = search(&store, &[1.0, 0.0], bad, &SearchFilters::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }

        let err = search(&store, &[1.0, 0.0, 0.0], 5, &SearchFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_search_with_tag_filter() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("s.sqlite")).await.unwrap();
        store
            .insert_batch(&[
                record(pattern("r1", "a.rs", 1, &["rust"]), vec![1.0, 0.0]),
                record(pattern("r2", "b.py", 2, &["python"]), vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let filters = SearchFilters {
            tags: vec!["python".into()],
            ..Default::default()
        };
        let out = search(&store, &[1.0, 0.0], 5, &filters).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pattern.file_path, "b.py");
    }
}
