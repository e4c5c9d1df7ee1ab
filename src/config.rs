//! TOML configuration for the `tpr` binary and the library commands.
//!
//! Every field has a default, so an empty file (or no file at the default
//! location) produces a usable configuration:
//!
//! ```toml
//! [db]
//! path = "data/temporal-patterns.sqlite"
//!
//! [repo]
//! path = "."
//!
//! [embedding]
//! provider = "local"
//! model_path = "models/model.onnx"
//! dims = 768
//!
//! [refresh]
//! max_revisions = 1000
//! batch_size = 64
//!
//! [retrieval]
//! top_k = 5
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::EMBEDDING_DIM;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/temporal-patterns.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    /// Repository whose history is mined by `refresh`.
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
        }
    }
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"local"` loads `model_path`; `"hashing"` is a deterministic lexical
    /// embedder that needs no model file.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_path")]
    pub model_path: Option<PathBuf>,
    /// Target dimension. Model output is truncated or zero-padded to this.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_path: default_model_path(),
            dims: default_dims(),
            batch_size: default_embed_batch_size(),
            max_length: default_max_length(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_model_path() -> Option<PathBuf> {
    Some(PathBuf::from("models/model.onnx"))
}
fn default_dims() -> usize {
    EMBEDDING_DIM
}
fn default_embed_batch_size() -> usize {
    32
}
fn default_max_length() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    #[serde(default = "default_max_revisions")]
    pub max_revisions: usize,
    /// Patterns written per store transaction.
    #[serde(default = "default_refresh_batch_size")]
    pub batch_size: usize,
    /// Embedding worker threads; 0 means one per available core.
    #[serde(default)]
    pub workers: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            batch_size: default_refresh_batch_size(),
            workers: 0,
        }
    }
}

fn default_max_revisions() -> usize {
    1000
}
fn default_refresh_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            min_score: default_min_score(),
        }
    }
}

fn default_top_k() -> i64 {
    5
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_min_score() -> f32 {
    0.0
}

impl RefreshConfig {
    /// Resolved worker count for the embedding pool.
    pub fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Load configuration from `path`.
///
/// When `required` is false and the file does not exist, defaults are
/// returned; this is how the binary treats its default `--config` location.
pub fn load_config(path: &Path, required: bool) -> Result<Config> {
    if !required && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "local" => {
            if config.embedding.model_path.is_none() {
                anyhow::bail!("embedding.model_path must be set when provider is 'local'");
            }
        }
        "hashing" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local or hashing.",
            other
        ),
    }

    if config.refresh.max_revisions == 0 {
        anyhow::bail!("refresh.max_revisions must be > 0");
    }
    if config.refresh.batch_size == 0 {
        anyhow::bail!("refresh.batch_size must be > 0");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    Ok(())
}
