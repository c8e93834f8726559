// src/embeddings/openai.rs
// OpenAI embeddings API client

use super::EmbeddingProvider;
use crate::error::{MnemoError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Max characters to embed (truncate longer text).
const MAX_TEXT_CHARS: usize = 8000;

/// Max inputs per batch request.
const MAX_BATCH_SIZE: usize = 256;

/// Per-call HTTP timeout.
const TIMEOUT_SECS: u64 = 30;

/// Retry attempts after the first try.
const RETRY_ATTEMPTS: usize = 3;

/// Exponential backoff base delay.
const BACKOFF_BASE_MS: u64 = 500;

const API_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// Remote embedding provider over the OpenAI embeddings API.
pub struct OpenAiEmbedder {
    api_key: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: Option<String>, dimensions: Option<usize>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: dimensions.unwrap_or(1536),
            http_client,
        }
    }

    fn truncated(text: &str) -> &str {
        if text.len() > MAX_TEXT_CHARS {
            let mut end = MAX_TEXT_CHARS;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            debug!("Truncating text from {} to {} chars", text.len(), end);
            &text[..end]
        } else {
            text
        }
    }

    /// POST one batch, retrying with exponential backoff on transport and
    /// 5xx/429 errors.
    async fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let mut last_error: Option<MnemoError> = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                let delay = BACKOFF_BASE_MS * (1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let response = match self
                .http_client
                .post(API_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let json: serde_json::Value = response.json().await?;
                return self.parse_response(&json, inputs.len());
            }

            let text = response.text().await.unwrap_or_default();
            let err = MnemoError::Provider(format!("OpenAI API error {status}: {text}"));
            if status.is_server_error() || status.as_u16() == 429 {
                last_error = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_error
            .unwrap_or_else(|| MnemoError::Provider("embedding request failed".to_string())))
    }

    /// Responses carry an index field; sort by it to restore input order.
    fn parse_response(&self, json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
        let data = json["data"]
            .as_array()
            .ok_or_else(|| MnemoError::Provider("invalid embedding response".to_string()))?;

        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            let Some(values) = item["embedding"].as_array() else {
                continue;
            };
            let vector: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vector.len() != self.dimensions {
                return Err(MnemoError::Provider(format!(
                    "embedding dimension mismatch: got {}, expected {}",
                    vector.len(),
                    self.dimensions
                )));
            }
            indexed.push((index, vector));
        }

        if indexed.len() != expected {
            return Err(MnemoError::Provider(format!(
                "embedding count mismatch: got {}, expected {expected}",
                indexed.len()
            )));
        }
        indexed.sort_by_key(|(i, _)| *i);
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn initialize(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(MnemoError::Provider("empty OpenAI API key".to_string()));
        }
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inputs = [Self::truncated(text)];
        let mut vectors = self.request(&inputs).await?;
        vectors
            .pop()
            .ok_or_else(|| MnemoError::Provider("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            let inputs: Vec<&str> = chunk.iter().map(|t| Self::truncated(t)).collect();
            results.extend(self.request(&inputs).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_TEXT_CHARS); // 2 bytes per char
        let cut = OpenAiEmbedder::truncated(&long);
        assert!(cut.len() <= MAX_TEXT_CHARS);
        assert!(cut.is_char_boundary(cut.len()));
    }

    #[test]
    fn test_parse_response_restores_order() {
        let embedder = OpenAiEmbedder::new("k".into(), None, Some(2));
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [3.0, 4.0]},
                {"index": 0, "embedding": [1.0, 2.0]},
            ]
        });
        let vectors = embedder.parse_response(&json, 2).expect("parse");
        assert_eq!(vectors[0], vec![1.0, 2.0]);
        assert_eq!(vectors[1], vec![3.0, 4.0]);
    }

    #[test]
    fn test_parse_response_dimension_mismatch() {
        let embedder = OpenAiEmbedder::new("k".into(), None, Some(3));
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [1.0, 2.0]}]
        });
        let err = embedder.parse_response(&json, 1).expect_err("mismatch");
        assert!(matches!(err, MnemoError::Provider(_)));
    }

    #[test]
    fn test_parse_response_count_mismatch() {
        let embedder = OpenAiEmbedder::new("k".into(), None, Some(2));
        let json = serde_json::json!({"data": []});
        assert!(embedder.parse_response(&json, 1).is_err());
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_key() {
        let embedder = OpenAiEmbedder::new("  ".into(), None, None);
        assert!(embedder.initialize().await.is_err());
    }
}
