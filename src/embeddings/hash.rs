// src/embeddings/hash.rs
// Local deterministic embedder: feature-hashed character trigrams,
// L2-normalised. Runs on the CPU with no key or network, which makes it
// the default provider and the one tests exercise.

use super::EmbeddingProvider;
use crate::error::Result;
use async_trait::async_trait;

const NGRAM: usize = 3;

/// FNV-1a over a byte slice; stable across platforms and runs.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic character n-gram embedder.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();
        if chars.is_empty() {
            return vector;
        }

        let mut buf = String::with_capacity(NGRAM * 4);
        for window in chars.windows(NGRAM.min(chars.len())) {
            buf.clear();
            buf.extend(window.iter());
            let hash = fnv1a(buf.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            // Sign bit from a higher hash bit keeps buckets roughly centred.
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn model(&self) -> String {
        format!("hash-ngram-v1-{}", self.dimensions)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn available(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed("the same input text").await.expect("embed");
        let b = embedder.embed("the same input text").await.expect("embed");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_dimensions_fixed() {
        let embedder = HashEmbedder::new(64);
        for text in ["", "short", &"long ".repeat(500)] {
            let v = embedder.embed(text).await.expect("embed");
            assert_eq!(v.len(), 64);
        }
    }

    #[tokio::test]
    async fn test_normalised() {
        let embedder = HashEmbedder::new(128);
        let v = embedder.embed("some content to hash").await.expect("embed");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_similar_texts_closer_than_different() {
        let embedder = HashEmbedder::new(256);
        let a = embedder.embed("postgres connection pooling").await.expect("embed");
        let b = embedder.embed("postgres connection pool sizing").await.expect("embed");
        let c = embedder.embed("birthday cake recipe ideas").await.expect("embed");

        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(a, b)| a * b).sum::<f32>();
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = embedder.embed_batch(&texts).await.expect("batch");
        assert_eq!(batch[0], embedder.embed("one").await.expect("embed"));
        assert_eq!(batch[1], embedder.embed("two").await.expect("embed"));
    }
}
