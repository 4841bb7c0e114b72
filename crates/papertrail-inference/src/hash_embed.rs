//! Offline feature-hashing embedder.
//!
//! Each lower-cased alphanumeric token is hashed with SHA-256; the first
//! eight digest bytes pick a bucket and the ninth picks the sign. The bag of
//! signed counts is L2-normalised. Texts that share vocabulary land close
//! together, which is enough to keep topic similarity meaningful while the
//! primary embedder is down. It needs no network and no model files.
//! A text without any token is hashed whole, so every input gets a vector.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use papertrail_core::{defaults, EmbeddingBackend, Result};

/// Model name recorded on fallback embeddings.
pub const HASH_MODEL_NAME: &str = "sha256-feature-hash";

pub struct HashEmbedder {
    dimension: usize,
    model_name: String,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(defaults::FALLBACK_EMBED_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_name: format!("{}-{}", HASH_MODEL_NAME, dimension),
        }
    }

    /// Embed one text. Always returns a unit vector.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let mut tokens = 0usize;

        for token in tokenize(text) {
            self.add(&mut vector, token.as_bytes());
            tokens += 1;
        }
        if tokens == 0 {
            self.add(&mut vector, text.trim().as_bytes());
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }

    fn add(&self, vector: &mut [f32], feature: &[u8]) {
        let digest = Sha256::digest(feature);
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(idx_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingBackend for HashEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
