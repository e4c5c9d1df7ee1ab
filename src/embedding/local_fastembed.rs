//! fastembed backend over a user-supplied ONNX model.
//!
//! The model is read from disk once; fastembed runs it through the bundled
//! ONNX Runtime. `TextEmbedding::embed` needs `&mut self`, so the session
//! sits behind a `Mutex`.

use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use std::path::Path;
use std::sync::Mutex;

use super::{resolve_model_files, EmbeddingBackend};
use crate::error::{Error, Result};

pub struct FastembedBackend {
    model: Mutex<TextEmbedding>,
    name: String,
    dims: usize,
}

impl FastembedBackend {
    pub fn load(model_path: &Path, max_length: usize) -> Result<Self> {
        let (onnx_path, dir) = resolve_model_files(model_path)?;

        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| Error::model_load(model_path, format!("{}: {}", p.display(), e)))
        };
        let onnx = read(&onnx_path)?;
        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read(&dir.join("tokenizer.json"))?,
            config_file: read(&dir.join("config.json"))?,
            special_tokens_map_file: read(&dir.join("special_tokens_map.json"))?,
            tokenizer_config_file: read(&dir.join("tokenizer_config.json"))?,
        };

        let user_model =
            UserDefinedEmbeddingModel::new(onnx, tokenizer_files).with_pooling(Pooling::Mean);
        let options = InitOptionsUserDefined::new().with_max_length(max_length);

        let mut model = TextEmbedding::try_new_from_user_defined(user_model, options)
            .map_err(|e| Error::model_load(model_path, e))?;

        let dims = probe_dimensions(&mut model).map_err(|e| Error::model_load(model_path, e))?;

        let name = onnx_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string());

        tracing::info!(model = %name, dims, "loaded local embedding model");

        Ok(Self {
            model: Mutex::new(model),
            name,
            dims,
        })
    }
}

fn probe_dimensions(model: &mut TextEmbedding) -> std::result::Result<usize, String> {
    let out = model
        .embed(vec!["probe"], None)
        .map_err(|e| format!("probe embedding failed: {}", e))?;
    out.first()
        .map(Vec::len)
        .ok_or_else(|| "probe returned no vectors".to_string())
}

impl EmbeddingBackend for FastembedBackend {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn native_dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::Inference("embedding model lock poisoned".to_string()))?;
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::Inference(e.to_string()))
    }
}
