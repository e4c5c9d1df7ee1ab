//! # Temporal Patterns
//!
//! Mines a git history for reusable engineering patterns and recommends the
//! most relevant ones for a natural-language query, using a local embedding
//! model and a single-file SQLite vector store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────────┐
//! │ Extractor │──▶│ Embedder  │──▶│ VectorStore  │
//! │  (git2)   │   │ (rayon)   │   │ (SQLite WAL) │
//! └───────────┘   └───────────┘   └──────┬───────┘
//!       refresh                          │
//!                                        ▼
//!  query ──▶ Embedder ──▶ Similarity search ──▶ Ranker ──▶ recommendations
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tpr init                         # create the store
//! tpr refresh --commits 500        # mine the newest 500 revisions
//! tpr query "add authentication middleware" --top 3
//! tpr accept <id>                  # count an accepted recommendation
//! tpr reject <id>                  # note an unhelpful one (ranking unchanged)
//! tpr stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed library errors |
//! | [`models`] | Pattern, embedding, and usage types |
//! | [`embedding`] | Text → unit vector, local model or hashing backend |
//! | [`extractor`] | Revision history → pattern candidates |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Store schema |
//! | [`store`] | Transactional vector store |
//! | [`lock`] | Single-writer advisory lock |
//! | [`search`] | Exhaustive cosine similarity search |
//! | [`ranker`] | Similarity + recency + usage scoring |
//! | [`refresh`] | Extract → embed → store pipeline |
//! | [`query`] | Recommend, accept, reject |
//! | [`stats`] | Store summary |
//! | [`progress`] | Refresh progress on stderr |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod lock;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod ranker;
pub mod refresh;
pub mod search;
pub mod stats;
pub mod store;

pub use error::{Error, Result};

/// Default target embedding dimension.
pub const EMBEDDING_DIM: usize = 768;

/// Store schema version written to `schema_meta`.
pub const SCHEMA_VERSION: u32 = 2;
