//! Embedding backends.
//!
//! Every backend implements [`Embedder`]: an ordered batch of texts goes in,
//! one vector per text comes out. Backends tell resource exhaustion
//! (retryable) apart from inputs the model rejects.

mod http;
mod onnx;

use std::sync::Arc;

use async_trait::async_trait;

pub use http::HttpEmbedder;
pub use onnx::{OnnxEmbedder, resolve_model_dir};

use crate::error::EmbeddingError;
use crate::models::{EmbeddingBackend, EmbeddingConfig, EmbeddingTask};

/// Per-call parameters passed through to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedOptions {
    pub task: EmbeddingTask,
    /// Token limit per input.
    pub max_length: usize,
    /// Matryoshka dimension. Vectors are cut to this size and re-normalized.
    pub truncate_dim: Option<usize>,
}

impl EmbedOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            task: config.task,
            max_length: config.max_length,
            truncate_dim: config.truncate_dim,
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: EmbeddingTask) -> Self {
        self.task = task;
        self
    }
}

/// Vectors for one batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    /// Tokens consumed, when the backend can count them.
    pub token_count: Option<u64>,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Embeddings, EmbeddingError>;

    fn model_name(&self) -> &str;

    /// Native output dimension before any Matryoshka truncation.
    fn dimension(&self) -> usize;

    async fn health_check(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }

    /// Embed a single text, typically a search query.
    async fn embed_one(
        &self,
        text: &str,
        options: &EmbedOptions,
    ) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(&[text.to_string()], options)
            .await?
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".to_string()))
    }
}

pub type SharedEmbedder = Arc<dyn Embedder>;

/// Build the backend selected by `config.backend`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<SharedEmbedder, EmbeddingError> {
    match config.backend {
        EmbeddingBackend::Onnx => Ok(Arc::new(OnnxEmbedder::load(config)?)),
        EmbeddingBackend::Http => Ok(Arc::new(HttpEmbedder::new(config)?)),
    }
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Keep the leading `dim` components and re-normalize.
pub fn truncate_embedding(mut v: Vec<f32>, dim: Option<usize>) -> Vec<f32> {
    if let Some(dim) = dim
        && dim < v.len()
    {
        v.truncate(dim);
    }
    normalize(&mut v);
    v
}
