//! Multi-factor re-ranking of similarity results.
//!
//! ```text
//! final_score   = 0.5 × similarity + 0.2 × recency_score + 0.3 × usage_score
//! recency_score = exp(-0.01 × days_since_created)
//! usage_score   = min(1.0, usage_count / 100)
//! ```
//!
//! Ordering matches [`crate::search`]: final score descending, ties by newer
//! `created_at`, then id.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::Pattern;
use crate::search::{by_score_then_recency, SimilarityResult};

pub const DEFAULT_SIMILARITY_WEIGHT: f64 = 0.5;
pub const DEFAULT_RECENCY_WEIGHT: f64 = 0.2;
pub const DEFAULT_USAGE_WEIGHT: f64 = 0.3;

const RECENCY_DECAY_PER_DAY: f64 = 0.01;
const USAGE_SATURATION: f64 = 100.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub similarity: f64,
    pub recency: f64,
    pub usage: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            similarity: DEFAULT_SIMILARITY_WEIGHT,
            recency: DEFAULT_RECENCY_WEIGHT,
            usage: DEFAULT_USAGE_WEIGHT,
        }
    }
}

/// A ranked, explained result.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub pattern: Pattern,
    pub final_score: f64,
    pub similarity: f32,
    pub recency_score: f64,
    pub usage_score: f64,
    pub usage_count: u64,
    pub explanation: String,
}

#[derive(Debug, Clone, Default)]
pub struct Ranker {
    weights: Weights,
}

impl Ranker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom weights, rescaled to sum to 1. All must be non-negative and at
    /// least one positive.
    pub fn with_weights(similarity: f64, recency: f64, usage: f64) -> Result<Self> {
        let all = [similarity, recency, usage];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidInput(
                "ranker weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = all.iter().sum();
        if sum <= 0.0 {
            return Err(Error::InvalidInput(
                "at least one ranker weight must be positive".to_string(),
            ));
        }
        Ok(Self {
            weights: Weights {
                similarity: similarity / sum,
                recency: recency / sum,
                usage: usage / sum,
            },
        })
    }

    pub fn weights(&self) -> Weights {
        self.weights
    }

    /// Rank relative to the current time.
    pub fn rank(&self, results: Vec<SimilarityResult>) -> Vec<Recommendation> {
        self.rank_at(results, chrono::Utc::now().timestamp())
    }

    /// Rank relative to `now` (unix seconds).
    pub fn rank_at(&self, results: Vec<SimilarityResult>, now: i64) -> Vec<Recommendation> {
        let mut ranked: Vec<Recommendation> = results
            .into_iter()
            .map(|r| self.score(r, now))
            .collect();
        ranked.sort_by(|a, b| {
            by_score_then_recency(a.final_score, &a.pattern, b.final_score, &b.pattern)
        });
        ranked
    }

    fn score(&self, result: SimilarityResult, now: i64) -> Recommendation {
        let days = days_between(result.pattern.created_at, now);
        let recency = recency_score(days);
        let usage = usage_score(result.metrics.usage_count);
        let final_score = self.weights.similarity * f64::from(result.similarity)
            + self.weights.recency * recency
            + self.weights.usage * usage;
        let explanation = explain(&result.pattern, result.similarity, days, result.metrics.usage_count);

        Recommendation {
            pattern: result.pattern,
            final_score,
            similarity: result.similarity,
            recency_score: recency,
            usage_score: usage,
            usage_count: result.metrics.usage_count,
            explanation,
        }
    }
}

/// Whole-and-fractional days from `created_at` to `now`, never negative.
/// `None` when the timestamp is missing (zero or negative).
fn days_between(created_at: i64, now: i64) -> Option<f64> {
    if created_at <= 0 {
        return None;
    }
    Some(((now - created_at) as f64 / SECONDS_PER_DAY).max(0.0))
}

/// `exp(-0.01 × days)`, kept inside `(0, 1]`. Unknown age scores the
/// smallest positive value.
pub fn recency_score(days: Option<f64>) -> f64 {
    match days {
        Some(days) => (-RECENCY_DECAY_PER_DAY * days).exp().max(f64::MIN_POSITIVE),
        None => f64::MIN_POSITIVE,
    }
}

/// `min(1, usage_count / 100)`.
pub fn usage_score(usage_count: u64) -> f64 {
    (usage_count as f64 / USAGE_SATURATION).min(1.0)
}

fn explain(pattern: &Pattern, similarity: f32, days: Option<f64>, usage_count: u64) -> String {
    let similarity = if similarity.is_finite() {
        format!("{:.1}% similar", f64::from(similarity) * 100.0)
    } else {
        "unknown similarity".to_string()
    };
    let age = match days {
        Some(d) => {
            let d = d.floor() as i64;
            format!("{} day{} ago", d, if d == 1 { "" } else { "s" })
        }
        None => "unknown age".to_string(),
    };
    let file = if pattern.file_path.is_empty() {
        "unknown file"
    } else {
        pattern.file_path.as_str()
    };
    let mut out = format!(
        "{} pattern from {} ({}), {}, {}",
        capitalize(pattern.pattern_type.label()),
        pattern.short_revision(),
        file,
        similarity,
        age
    );
    if usage_count > 0 {
        out.push_str(&format!(
            ", accepted {} time{}",
            usage_count,
            if usage_count == 1 { "" } else { "s" }
        ));
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageMetrics;
    use crate::store::test_support::pattern;

    const NOW: i64 = 1_700_000_000;
    const DAY: i64 = 86_400;

    fn result(rev: &str, created_at: i64, similarity: f32, usage: u64) -> SimilarityResult {
        SimilarityResult {
            pattern: pattern(rev, "src/lib.rs", created_at, &[]),
            similarity,
            metrics: UsageMetrics {
                usage_count: usage,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_formula_exact() {
        let ranked = Ranker::new().rank_at(vec![result("r1", NOW - 10 * DAY, 0.8, 25)], NOW);
        let expected = 0.5 * f64::from(0.8f32) + 0.2 * (-0.1f64).exp() + 0.3 * 0.25;
        assert!((ranked[0].final_score - expected).abs() < 1e-12);
        assert!((ranked[0].recency_score - (-0.1f64).exp()).abs() < 1e-12);
        assert!((ranked[0].usage_score - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_sorted_by_final_not_similarity() {
        let ranked = Ranker::new().rank_at(
            vec![
                result("fresh-popular", NOW, 0.6, 100),
                result("old-similar", NOW - 1000 * DAY, 0.7, 0),
            ],
            NOW,
        );
        assert_eq!(ranked[0].pattern.revision_id, "fresh-popular");
    }

    #[test]
    fn test_equal_scores_prefer_newer() {
        let ranked = Ranker::new().rank_at(
            vec![result("a", NOW - DAY, 0.5, 0), result("b", NOW - DAY, 0.5, 0)],
            NOW,
        );
        // Same timestamp: falls through to id.
        assert!(ranked[0].pattern.id < ranked[1].pattern.id);

        let r = Ranker::with_weights(1.0, 0.0, 0.0).unwrap();
        let ranked = r.rank_at(
            vec![result("older", NOW - 5 * DAY, 0.5, 0), result("newer", NOW - DAY, 0.5, 0)],
            NOW,
        );
        assert_eq!(ranked[0].pattern.revision_id, "newer");
    }

    #[test]
    fn test_score_bounds() {
        assert!((recency_score(Some(0.0)) - 1.0).abs() < 1e-12);
        assert!(recency_score(Some(1e9)) > 0.0);
        assert!(recency_score(None) > 0.0);
        assert_eq!(usage_score(0), 0.0);
        assert_eq!(usage_score(50), 0.5);
        assert_eq!(usage_score(1000), 1.0);
    }

    #[test]
    fn test_future_timestamp_clamped() {
        let ranked = Ranker::new().rank_at(vec![result("r", NOW + DAY, 1.0, 0)], NOW);
        assert!((ranked[0].recency_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reproducible() {
        let make = || vec![result("x", NOW - 3 * DAY, 0.42, 7), result("y", NOW - 9 * DAY, 0.51, 2)];
        let a = Ranker::new().rank_at(make(), NOW);
        let b = Ranker::new().rank_at(make(), NOW);
        let sa: Vec<f64> = a.iter().map(|r| r.final_score).collect();
        let sb: Vec<f64> = b.iter().map(|r| r.final_score).collect();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_explanation() {
        let ranked = Ranker::new().rank_at(vec![result("abcdef123", NOW - 2 * DAY, 0.875, 1)], NOW);
        assert_eq!(
            ranked[0].explanation,
            "Feature implementation pattern from abcdef1 (src/lib.rs), 87.5% similar, 2 days ago, accepted 1 time"
        );
    }

    #[test]
    fn test_explanation_placeholders() {
        let mut r = result("", 0, f32::NAN, 0);
        r.pattern.file_path.clear();
        let ranked = Ranker::new().rank_at(vec![r], NOW);
        assert_eq!(
            ranked[0].explanation,
            "Feature implementation pattern from unknown (unknown file), unknown similarity, unknown age"
        );
    }

    #[test]
    fn test_with_weights_normalizes() {
        let r = Ranker::with_weights(2.0, 1.0, 1.0).unwrap();
        let w = r.weights();
        assert!((w.similarity - 0.5).abs() < 1e-12);
        assert!((w.recency - 0.25).abs() < 1e-12);
        assert!(Ranker::with_weights(0.0, 0.0, 0.0).is_err());
        assert!(Ranker::with_weights(-1.0, 1.0, 1.0).is_err());
        assert_eq!(Ranker::new().weights(), Weights::default());
    }
}
