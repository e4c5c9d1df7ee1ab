//! Typed errors for every library operation.
//!
//! None of these are retried. The `tpr` binary converts them into a
//! message on stderr and exit code 1.

use std::path::PathBuf;

/// Errors produced by the embedder, extractor, store, and search layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The embedding model is missing, corrupt, or cannot be loaded.
    #[error("failed to load embedding model from {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    /// Tokenization or the forward pass failed for one input.
    #[error("embedding inference failed: {0}")]
    Inference(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// History could not be read (repository missing, bad revision, diff failure).
    #[error("repository access failed ({context}): {source}")]
    RepositoryAccess {
        context: String,
        #[source]
        source: git2::Error,
    },

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    /// A vector does not have the dimension the store was configured with.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller supplied an argument outside its valid range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Another process holds the writer lock on the store.
    #[error("store at {0} is locked by another writer")]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn repo(context: impl Into<String>, source: git2::Error) -> Self {
        Error::RepositoryAccess {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn model_load(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Error::ModelLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        let err = Error::PatternNotFound("abc123".into());
        assert_eq!(err.to_string(), "pattern not found: abc123");

        let err = Error::DimensionMismatch {
            expected: 768,
            actual: 384,
        };
        assert!(err.to_string().contains("expected 768"));
    }

    #[test]
    fn test_repo_error_keeps_context() {
        let err = Error::repo("open /nope", git2::Error::from_str("not found"));
        let msg = err.to_string();
        assert!(msg.contains("open /nope"));
        assert!(msg.contains("not found"));
    }
}
