// src/embeddings/mod.rs
// Embedding provider module
//
// Providers are pluggable behind `EmbeddingProvider`; the client picks one
// from configuration and falls back to the local hash embedder when the
// remote provider cannot initialise. Lexical search never depends on this
// module being available.

mod hash;
mod openai;
pub mod pipeline;

pub use hash::HashEmbedder;
pub use openai::OpenAiEmbedder;
pub use pipeline::EmbeddingPipeline;

use crate::config::{EmbeddingProviderName, EnvConfig};
use crate::error::{MnemoError, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// A pluggable embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider identifier ("hash", "openai").
    fn name(&self) -> &'static str;
    /// Model identifier stamped onto vector indexes.
    fn model(&self) -> String;
    /// Fixed output dimensionality.
    fn dimensions(&self) -> usize;
    /// Whether the provider can currently serve requests.
    fn available(&self) -> bool;
    /// One-time setup (connectivity probe, key validation).
    async fn initialize(&self) -> Result<()>;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedding client with config-driven provider selection.
pub struct EmbeddingClient {
    provider: Box<dyn EmbeddingProvider>,
}

impl EmbeddingClient {
    /// Select and initialise a provider from configuration.
    ///
    /// `openai` requires an API key; on a missing key or a failed probe the
    /// client falls back to the local deterministic hash embedder so the
    /// pipeline keeps working offline.
    pub async fn from_config(config: &EnvConfig) -> Self {
        if config.embedding_provider == EmbeddingProviderName::OpenAi {
            if let Some(api_key) = config.embedding_api_key.clone() {
                let provider = OpenAiEmbedder::new(
                    api_key,
                    config.embedding_model.clone(),
                    config.embedding_dimensions,
                );
                match provider.initialize().await {
                    Ok(()) => {
                        info!(model = %provider.model(), "Using OpenAI embeddings");
                        return Self {
                            provider: Box::new(provider),
                        };
                    }
                    Err(e) => {
                        warn!("OpenAI embeddings unavailable, falling back to hash: {}", e)
                    }
                }
            } else {
                warn!("MNEMO_EMBEDDING_PROVIDER=openai but OPENAI_API_KEY unset, using hash");
            }
        }

        let provider = HashEmbedder::new(config.embedding_dimensions.unwrap_or(256));
        info!(
            model = %provider.model(),
            dimensions = provider.dimensions(),
            "Using local hash embeddings"
        );
        Self {
            provider: Box::new(provider),
        }
    }

    /// Wrap an explicit provider (used by tests).
    pub fn with_provider(provider: Box<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_id(&self) -> &'static str {
        self.provider.name()
    }

    pub fn model(&self) -> String {
        self.provider.model()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn available(&self) -> bool {
        self.provider.available()
    }

    /// Provider-appropriate sub-batch size so each sub-batch maps to one
    /// upstream request and failures stay contained.
    pub fn batch_size(&self) -> usize {
        match self.provider.name() {
            "openai" => 256,
            _ => 64,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if !self.provider.available() {
            return Err(MnemoError::Provider(format!(
                "embedding provider '{}' unavailable",
                self.provider.name()
            )));
        }
        self.provider.embed(text).await
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if !self.provider.available() {
            return Err(MnemoError::Provider(format!(
                "embedding provider '{}' unavailable",
                self.provider.name()
            )));
        }
        self.provider.embed_batch(texts).await
    }
}

/// Serialise an embedding for sqlite-vec storage (little-endian f32).
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Map a cosine distance (0..2) to a similarity score (1 best, 0 worst).
pub fn distance_to_score(distance: f32) -> f32 {
    (1.0 - distance).clamp(-1.0, 1.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_to_bytes_layout() {
        let bytes = embedding_to_bytes(&[1.0, -2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(f32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(bytes[4..8].try_into().unwrap()), -2.0);
    }

    #[test]
    fn test_distance_to_score() {
        assert_eq!(distance_to_score(0.0), 1.0);
        assert_eq!(distance_to_score(1.0), 0.0);
        assert_eq!(distance_to_score(2.0), 0.0);
    }

    #[tokio::test]
    async fn test_client_empty_batch() {
        let client = EmbeddingClient::with_provider(Box::new(HashEmbedder::new(64)));
        let out = client.embed_batch(&[]).await.expect("empty batch");
        assert!(out.is_empty());
    }
}
