//! Deterministic feature-hashing embedder.
//!
//! Lowercased word tokens (and adjacent-word bigrams at half weight) are
//! hashed with FNV-1a into a fixed number of buckets, with the sign taken
//! from a high hash bit. Texts sharing vocabulary get positive cosine
//! similarity; nothing is learned and no file is read.

use super::EmbeddingBackend;
use crate::error::Result;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingBackend {
    dims: usize,
    name: String,
}

impl HashingBackend {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            name: format!("hashing-{}", dims.max(1)),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        let tokens = tokenize(text);
        for token in &tokens {
            self.add(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add(&mut v, bigram.as_bytes(), BIGRAM_WEIGHT);
        }
        v
    }

    fn add(&self, v: &mut [f32], bytes: &[u8], weight: f32) {
        let h = fnv1a(bytes);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl EmbeddingBackend for HashingBackend {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn native_dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}
