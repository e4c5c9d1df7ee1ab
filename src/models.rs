//! Core data models that flow from extraction through storage to ranking.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::Result;

/// Kind of change a pattern captures, inferred from the revision message
/// and the touched paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    FeatureImplementation,
    BugFix,
    Refactoring,
    Architecture,
    Configuration,
    Test,
    Documentation,
}

impl PatternType {
    /// Stable identifier used in the store and in JSON output.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::FeatureImplementation => "feature_implementation",
            PatternType::BugFix => "bug_fix",
            PatternType::Refactoring => "refactoring",
            PatternType::Architecture => "architecture",
            PatternType::Configuration => "configuration",
            PatternType::Test => "test",
            PatternType::Documentation => "documentation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "feature_implementation" => PatternType::FeatureImplementation,
            "bug_fix" => PatternType::BugFix,
            "refactoring" => PatternType::Refactoring,
            "architecture" => PatternType::Architecture,
            "configuration" => PatternType::Configuration,
            "test" => PatternType::Test,
            "documentation" => PatternType::Documentation,
            _ => return None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PatternType::FeatureImplementation => "feature implementation",
            PatternType::BugFix => "bug fix",
            PatternType::Refactoring => "refactoring",
            PatternType::Architecture => "architecture",
            PatternType::Configuration => "configuration",
            PatternType::Test => "test",
            PatternType::Documentation => "documentation",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Typed metadata carried alongside a pattern.
///
/// `other` holds genuinely unstructured extras; everything the engine
/// itself reads has a typed field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternExtras {
    /// Touched paths other than [`Pattern::file_path`], sorted.
    #[serde(default)]
    pub related_paths: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Conventional-commit scope, e.g. `auth` in `feat(auth): ...`.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub breaking: bool,
    #[serde(default)]
    pub insertions: usize,
    #[serde(default)]
    pub deletions: usize,
    #[serde(default)]
    pub other: BTreeMap<String, String>,
}

/// A reusable unit of engineering knowledge derived from one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub revision_id: String,
    pub revision_message: String,
    /// Primary path of the revision.
    pub file_path: String,
    pub pattern_type: PatternType,
    pub tags: BTreeSet<String>,
    /// Unix seconds of the source revision.
    pub created_at: i64,
    /// Text that gets embedded.
    pub description: String,
    #[serde(default)]
    pub extras: PatternExtras,
}

impl Pattern {
    /// Stable id derived from the revision id and the primary path.
    pub fn derive_id(revision_id: &str, file_path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(revision_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(file_path.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// SHA-256 over the serialized pattern. Two extractions of the same
    /// revision with the same heuristics hash equal; any persisted field
    /// that changes, extras included, changes the hash.
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Every path this pattern touches, primary first.
    pub fn all_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.file_path.as_str())
            .chain(self.extras.related_paths.iter().map(String::as_str))
    }

    /// First 7 characters of the revision id, or `unknown`.
    pub fn short_revision(&self) -> &str {
        if self.revision_id.is_empty() {
            "unknown"
        } else {
            self.revision_id.get(..7).unwrap_or(&self.revision_id)
        }
    }
}

/// Unit-length vector owned 1:1 by a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub vector: Vec<f32>,
    /// Norm of the model output before normalization.
    pub norm: f32,
    pub created_at: i64,
    pub model: String,
}

impl EmbeddingRecord {
    /// Normalize `raw` and keep its original norm.
    pub fn new(raw: Vec<f32>, model: impl Into<String>, created_at: i64) -> Self {
        let (vector, norm) = crate::embedding::normalize_l2(raw);
        Self {
            vector,
            norm,
            created_at,
            model: model.into(),
        }
    }
}

/// A user's verdict on a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Negative,
    Neutral,
    Positive,
}

impl Feedback {
    pub fn score(self) -> i64 {
        match self {
            Feedback::Negative => -1,
            Feedback::Neutral => 0,
            Feedback::Positive => 1,
        }
    }
}

/// Mutable per-pattern counters. The only state that changes after a
/// pattern is written. Ranking reads `usage_count` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub usage_count: u64,
    pub last_used_at: Option<i64>,
    pub surfaced_count: u64,
    pub last_surfaced_at: Option<i64>,
    pub feedback_count: u64,
    /// Mean of every feedback score, in [-1, 1].
    pub avg_feedback: Option<f64>,
    pub relevance_count: u64,
    /// Mean final score the pattern had when feedback was given on it.
    pub avg_relevance: Option<f64>,
}

/// A pattern ready for `insert_batch`.
#[derive(Debug, Clone)]
pub struct PatternRecord {
    pub pattern: Pattern,
    pub embedding: EmbeddingRecord,
}

/// A pattern as read back from the store for scoring.
#[derive(Debug, Clone)]
pub struct StoredPattern {
    pub pattern: Pattern,
    pub vector: Vec<f32>,
    pub metrics: UsageMetrics,
}
