//! Text → unit-length vector embedding.
//!
//! An [`Embedder`] owns one loaded [`EmbeddingBackend`] and a target
//! dimension. Callers hold the `Embedder` explicitly (usually behind an
//! `Arc`) and pass it to every operation that needs it; there is no
//! process-global model.
//!
//! Backends:
//! - **local** — a model file on disk, run through fastembed (primary) or
//!   tract (musl/Intel Mac). No network access.
//! - **[`HashingBackend`]** — deterministic feature-hashing over word tokens.
//!   Needs no model file; used for offline runs and tests.
//!
//! # Dimension coercion
//!
//! Whatever the backend emits is coerced to the target dimension before
//! normalization: longer vectors are truncated, shorter ones are
//! zero-padded, then the result is L2-normalized. This is lossy. Truncation
//! drops whatever the trailing components encoded, and padding leaves the
//! similarity geometry unchanged but wastes space. Each coercion is
//! counted and logged as a `DimensionMismatch` warning; set
//! `embedding.dims` to the model's native size to avoid it.

mod hashing;
#[cfg(feature = "local-embeddings-fastembed")]
mod local_fastembed;
#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

pub use hashing::HashingBackend;

use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// A loaded model that maps texts to raw (unnormalized, native-dimension)
/// vectors.
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier recorded next to every stored vector.
    fn model_name(&self) -> &str;
    /// Native output dimension, when known before the first call.
    fn native_dims(&self) -> Option<usize>;
    /// Embed a batch. Output order matches input order.
    fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A unit vector and the norm it had before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    pub vector: Vec<f32>,
    pub norm: f32,
}

pub struct Embedder {
    backend: Box<dyn EmbeddingBackend>,
    target_dims: usize,
    batch_size: usize,
    coerced: AtomicU64,
}

impl Embedder {
    /// Load a local model from `model_path`.
    ///
    /// `model_path` is either an `.onnx` file or a directory containing
    /// `model.onnx`; tokenizer files are read from the same directory.
    /// Fails with [`Error::ModelLoad`] if anything is missing or the loader
    /// rejects the model.
    pub fn load(model_path: &Path, target_dims: usize) -> Result<Self> {
        Self::load_with(model_path, target_dims, 512)
    }

    fn load_with(model_path: &Path, target_dims: usize, max_length: usize) -> Result<Self> {
        if !model_path.exists() {
            return Err(Error::model_load(model_path, "no such file or directory"));
        }
        let backend = load_local_backend(model_path, max_length)?;
        if let Some(native) = backend.native_dims() {
            if native != target_dims {
                tracing::warn!(
                    model = backend.model_name(),
                    native,
                    target = target_dims,
                    "model output will be {} to the target dimension",
                    if native > target_dims { "truncated" } else { "zero-padded" }
                );
            }
        }
        Ok(Self::with_backend(backend, target_dims))
    }

    /// Build the embedder selected by `[embedding]` in the config.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let embedder = match config.provider.as_str() {
            "hashing" => Self::with_backend(Box::new(HashingBackend::new(config.dims)), config.dims),
            "local" => {
                let path = config.model_path.as_deref().ok_or_else(|| {
                    Error::InvalidInput("embedding.model_path is not set".to_string())
                })?;
                Self::load_with(path, config.dims, config.max_length)?
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown embedding provider: {}",
                    other
                )))
            }
        };
        Ok(embedder.with_batch_size(config.batch_size))
    }

    pub fn with_backend(backend: Box<dyn EmbeddingBackend>, target_dims: usize) -> Self {
        Self {
            backend,
            target_dims,
            batch_size: 32,
            coerced: AtomicU64::new(0),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> usize {
        self.target_dims
    }

    /// How many vectors have been truncated or padded so far.
    pub fn coerced_count(&self) -> u64 {
        self.coerced.load(Ordering::Relaxed)
    }

    /// Embed one text into a unit vector of [`Embedder::dims`] components.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Inference("backend returned no vectors".to_string()))
    }

    /// Embed a batch. Any failure fails the whole batch.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .embed_batch_with_norms(texts)?
            .into_iter()
            .map(|e| e.vector)
            .collect())
    }

    /// Like [`Embedder::embed_batch`], keeping each vector's norm before
    /// normalization.
    pub fn embed_batch_with_norms(&self, texts: &[String]) -> Result<Vec<Embedded>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.backend.embed_raw(texts)?;
        if raw.len() != texts.len() {
            return Err(Error::Inference(format!(
                "backend returned {} vectors for {} texts",
                raw.len(),
                texts.len()
            )));
        }
        raw.into_iter().map(|v| self.finish(v)).collect()
    }

    /// Embed many texts on `pool`, isolating failures per text.
    ///
    /// Texts go through the backend in batches. A failed batch of several
    /// texts is split and each text is run alone, so one bad input only
    /// costs itself. A text that fails alone is reported as failed and
    /// never run again; a batch of one is never run twice. Output order
    /// matches input order.
    pub fn embed_each(&self, texts: &[String], pool: &rayon::ThreadPool) -> Vec<Result<Embedded>> {
        pool.install(|| {
            texts
                .par_chunks(self.batch_size)
                .flat_map_iter(|chunk| match self.embed_batch_with_norms(chunk) {
                    Ok(vectors) => vectors.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) if chunk.len() == 1 => vec![Err(e)],
                    Err(e) => {
                        tracing::debug!(error = %e, size = chunk.len(), "batch failed, isolating texts");
                        chunk
                            .iter()
                            .map(|t| {
                                self.embed_batch_with_norms(std::slice::from_ref(t))?
                                    .into_iter()
                                    .next()
                                    .ok_or_else(|| {
                                        Error::Inference("backend returned no vectors".to_string())
                                    })
                            })
                            .collect()
                    }
                })
                .collect()
        })
    }

    fn finish(&self, raw: Vec<f32>) -> Result<Embedded> {
        let native = raw.len();
        let (vector, changed) = coerce_dims(raw, self.target_dims);
        if changed {
            let n = self.coerced.fetch_add(1, Ordering::Relaxed);
            let mismatch = Error::DimensionMismatch {
                expected: self.target_dims,
                actual: native,
            };
            if n == 0 {
                tracing::warn!("{}; vector coerced", mismatch);
            } else {
                tracing::debug!("{}; vector coerced", mismatch);
            }
        }
        let (vector, norm) = normalize_l2(vector);
        if norm <= f32::EPSILON {
            return Err(Error::Inference("model produced a zero vector".to_string()));
        }
        Ok(Embedded { vector, norm })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn load_local_backend(model_path: &Path, max_length: usize) -> Result<Box<dyn EmbeddingBackend>> {
    Ok(Box::new(local_fastembed::FastembedBackend::load(
        model_path, max_length,
    )?))
}

#[cfg(all(
    feature = "local-embeddings-tract",
    not(feature = "local-embeddings-fastembed")
))]
fn load_local_backend(model_path: &Path, max_length: usize) -> Result<Box<dyn EmbeddingBackend>> {
    Ok(Box::new(local_tract::TractBackend::load(
        model_path, max_length,
    )?))
}

#[cfg(not(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
)))]
fn load_local_backend(model_path: &Path, _max_length: usize) -> Result<Box<dyn EmbeddingBackend>> {
    Err(Error::model_load(
        model_path,
        "built without local embedding support; enable local-embeddings-fastembed or local-embeddings-tract",
    ))
}

/// Resolve a model path into `(onnx file, directory holding tokenizer files)`.
#[cfg_attr(
    not(any(
        feature = "local-embeddings-fastembed",
        feature = "local-embeddings-tract"
    )),
    allow(dead_code)
)]
pub(crate) fn resolve_model_files(
    model_path: &Path,
) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    let (onnx, dir) = if model_path.is_dir() {
        (model_path.join("model.onnx"), model_path.to_path_buf())
    } else {
        let dir = model_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        (model_path.to_path_buf(), dir)
    };
    if !onnx.is_file() {
        return Err(Error::model_load(model_path, "model.onnx not found"));
    }
    if !dir.join("tokenizer.json").is_file() {
        return Err(Error::model_load(
            model_path,
            format!("tokenizer.json not found in {}", dir.display()),
        ));
    }
    Ok((onnx, dir))
}

/// Truncate or zero-pad `v` to `target` components. Returns whether the
/// length changed.
pub fn coerce_dims(mut v: Vec<f32>, target: usize) -> (Vec<f32>, bool) {
    let changed = v.len() != target;
    v.resize(target, 0.0);
    (v, changed)
}

/// Scale `v` to unit length. Returns the vector and its original norm.
/// A zero vector is returned unchanged.
pub fn normalize_l2(mut v: Vec<f32>) -> (Vec<f32>, f32) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    (v, norm)
}

/// Dot product; equals cosine similarity for unit vectors.
///
/// Returns `0.0` for vectors of different lengths.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for &val in vec {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing bytes that do not
/// form a whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that returns fixed-size vectors, or fails on texts
    /// containing "boom".
    struct FixedBackend {
        dims: usize,
    }

    impl EmbeddingBackend for FixedBackend {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn native_dims(&self) -> Option<usize> {
            Some(self.dims)
        }
        fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts
                .iter()
                .map(|t| {
                    if t.contains("boom") {
                        Err(Error::Inference("boom".into()))
                    } else {
                        Ok((0..self.dims).map(|i| (i + t.len()) as f32).collect())
                    }
                })
                .collect()
        }
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_coerce_truncates_and_pads() {
        let (v, changed) = coerce_dims(vec![1.0, 2.0, 3.0, 4.0], 2);
        assert!(changed);
        assert_eq!(v, vec![1.0, 2.0]);

        let (v, changed) = coerce_dims(vec![1.0], 3);
        assert!(changed);
        assert_eq!(v, vec![1.0, 0.0, 0.0]);

        let (v, changed) = coerce_dims(vec![1.0, 2.0], 2);
        assert!(!changed);
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn test_normalize_returns_original_norm() {
        let (v, n) = normalize_l2(vec![3.0, 4.0]);
        assert!((n - 5.0).abs() < 1e-6);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dot_of_unit_vectors() {
        let (a, _) = normalize_l2(vec![1.0, 1.0]);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(dot(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(dot(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_embed_pads_to_target_and_counts() {
        let embedder = Embedder::with_backend(Box::new(FixedBackend { dims: 4 }), 8);
        let v = embedder.embed("hello").unwrap();
        assert_eq!(v.len(), 8);
        assert!((norm(&v) - 1.0).abs() < 1e-5);
        assert_eq!(&v[4..], &[0.0; 4]);
        assert_eq!(embedder.coerced_count(), 1);
    }

    #[test]
    fn test_embed_truncates_to_target() {
        let embedder = Embedder::with_backend(Box::new(FixedBackend { dims: 16 }), 4);
        let v = embedder.embed("hello").unwrap();
        assert_eq!(v.len(), 4);
        assert!((norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_matching_dims_not_counted() {
        let embedder = Embedder::with_backend(Box::new(FixedBackend { dims: 4 }), 4);
        embedder.embed("hello").unwrap();
        assert_eq!(embedder.coerced_count(), 0);
    }

    #[test]
    fn test_embed_each_isolates_failures() {
        let embedder =
            Embedder::with_backend(Box::new(FixedBackend { dims: 4 }), 4).with_batch_size(2);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let texts: Vec<String> = ["a", "boom", "c", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = embedder.embed_each(&texts, &pool);
        assert_eq!(out.len(), 5);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(Error::Inference(_))));
        assert!(out[2..].iter().all(|r| r.is_ok()));
    }

    /// Counts how often each text reaches the backend.
    struct CountingBackend {
        calls: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl EmbeddingBackend for CountingBackend {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn native_dims(&self) -> Option<usize> {
            Some(2)
        }
        fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().extend(texts.iter().cloned());
            texts
                .iter()
                .map(|t| {
                    if t.contains("boom") {
                        Err(Error::Inference("boom".into()))
                    } else {
                        Ok(vec![3.0, 4.0])
                    }
                })
                .collect()
        }
    }

    #[test]
    fn test_embed_each_runs_single_failures_once() {
        let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let backend = Box::new(CountingBackend {
            calls: std::sync::Arc::clone(&calls),
        });
        let embedder = Embedder::with_backend(backend, 2).with_batch_size(1);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let texts: Vec<String> = ["a", "boom"].iter().map(|s| s.to_string()).collect();
        let out = embedder.embed_each(&texts, &pool);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
        let seen = calls.lock().unwrap();
        assert_eq!(seen.iter().filter(|t| t.as_str() == "boom").count(), 1);
    }

    #[test]
    fn test_embed_each_keeps_raw_norm() {
        let embedder = Embedder::with_backend(
            Box::new(CountingBackend {
                calls: Default::default(),
            }),
            2,
        );
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let out = embedder.embed_each(&["x".to_string()], &pool);
        let embedded = out.into_iter().next().unwrap().unwrap();
        assert!((embedded.norm - 5.0).abs() < 1e-6);
        assert!((norm(&embedded.vector) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model_is_model_load_error() {
        let err = Embedder::load(Path::new("/definitely/not/here.onnx"), 768)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }

    #[test]
    fn test_resolve_requires_tokenizer() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("model.onnx"), b"not really").unwrap();
        let err = resolve_model_files(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("tokenizer.json"));
    }

    #[test]
    fn test_from_config_hashing() {
        let cfg = EmbeddingConfig {
            provider: "hashing".into(),
            dims: 32,
            ..EmbeddingConfig::default()
        };
        let embedder = Embedder::from_config(&cfg).unwrap();
        assert_eq!(embedder.dims(), 32);
        assert_eq!(embedder.embed("add middleware").unwrap().len(), 32);
    }
}
