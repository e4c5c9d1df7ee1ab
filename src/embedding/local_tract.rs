//! Tract-based local embedding backend (fallback for musl and Intel Mac).
//!
//! Pure-Rust path: loads the ONNX model with tract-onnx and tokenizes with
//! the tokenizers crate. No ONNX Runtime or system deps.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use std::path::Path;
use tract_onnx::prelude::*;

use super::{resolve_model_files, EmbeddingBackend};
use crate::error::{Error, Result};

type RunFn = dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send + Sync;

pub struct TractBackend {
    run: Box<RunFn>,
    tokenizer: tokenizers::Tokenizer,
    wants_token_types: bool,
    max_length: usize,
    name: String,
}

impl TractBackend {
    pub fn load(model_path: &Path, max_length: usize) -> Result<Self> {
        let (onnx_path, dir) = resolve_model_files(model_path)?;

        let tokenizer = tokenizers::Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| Error::model_load(model_path, format!("load tokenizer: {}", e)))?;

        let model = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| Error::model_load(model_path, format!("load ONNX: {}", e)))?
            .into_optimized()
            .map_err(|e| Error::model_load(model_path, format!("optimize: {}", e)))?;
        let wants_token_types = model.inputs.len() > 2;
        let plan = model
            .into_runnable()
            .map_err(|e| Error::model_load(model_path, format!("build runnable: {}", e)))?;

        let name = onnx_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string());

        tracing::info!(model = %name, "loaded local embedding model (tract)");

        Ok(Self {
            run: Box::new(move |inputs| plan.run(inputs)),
            tokenizer,
            wants_token_types,
            max_length: max_length.max(1),
            name,
        })
    }

    fn run_batch(&self, texts: &[String]) -> TractResult<Vec<Vec<f32>>> {
        let encodings = texts
            .iter()
            .map(|s| {
                self.tokenizer
                    .encode(s.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("tokenize: {}", e))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .clamp(1, self.max_length);

        let rows = encodings.len();
        let mut input_ids = vec![0i64; rows * max_len];
        let mut attention_mask = vec![0i64; rows * max_len];
        for (i, enc) in encodings.iter().enumerate() {
            for (j, &id) in enc.get_ids().iter().take(max_len).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = 1;
            }
        }

        let ids: Tensor = ndarray::Array2::from_shape_vec((rows, max_len), input_ids)?.into();
        let mask: Tensor =
            ndarray::Array2::from_shape_vec((rows, max_len), attention_mask)?.into();
        let mut inputs: TVec<TValue> = tvec!(ids.into(), mask.into());
        if self.wants_token_types {
            let types: Tensor = ndarray::Array2::<i64>::zeros((rows, max_len)).into();
            inputs.push(types.into());
        }

        let output = (self.run)(inputs)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no output tensor"))?;
        let view = output.to_array_view::<f32>()?;

        // [batch, hidden] is already pooled; [batch, seq, hidden] needs a
        // mean over the unpadded tokens.
        let shape = view.shape().to_vec();
        let mut out = Vec::with_capacity(rows);
        match shape.len() {
            2 => {
                for i in 0..shape[0] {
                    out.push(view.slice(ndarray::s![i, ..]).iter().copied().collect());
                }
            }
            3 => {
                let (seq_len, hidden) = (shape[1], shape[2]);
                for (i, enc) in encodings.iter().enumerate() {
                    let valid = enc.get_ids().len().min(seq_len).min(max_len).max(1);
                    let mut sum = vec![0f32; hidden];
                    for j in 0..valid {
                        for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                            sum[k] += v;
                        }
                    }
                    for x in &mut sum {
                        *x /= valid as f32;
                    }
                    out.push(sum);
                }
            }
            _ => anyhow::bail!("unexpected output shape: {:?}", shape),
        }
        Ok(out)
    }
}

impl EmbeddingBackend for TractBackend {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn native_dims(&self) -> Option<usize> {
        None
    }

    fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.run_batch(texts)
            .map_err(|e| Error::Inference(e.to_string()))
    }
}
