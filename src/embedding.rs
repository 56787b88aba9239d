//! Text embedding clients.
//!
//! Schema text at ingestion and user queries at resolution time go through the
//! same [`Embedder`] with the same preprocessing, so their vectors are
//! comparable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};
use crate::retry::{RetryPolicy, send_with_retry};

/// Dimension of `models/embedding-001` vectors.
pub const EMBEDDING_DIM: usize = 768;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one piece of text into a fixed-length vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;
}

/// Normalization applied to every input before it is embedded.
pub fn preprocess(text: &str) -> &str {
    text.trim()
}

// ============================================================================
// Gemini
// ============================================================================

/// Gemini `embedContent` client.
pub struct GeminiEmbedder {
    api_key: String,
    model: String,
    base_url: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    content: EmbedContent<'a>,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

impl GeminiEmbedder {
    pub const DEFAULT_MODEL: &'static str = "models/embedding-001";
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: Self::DEFAULT_MODEL.to_string(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{model}")
        };
        self
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/{}:embedContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = EmbedRequest {
            model: &self.model,
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: preprocess(text),
                }],
            },
        };

        let response = send_with_retry(&self.retry, "embedContent", || {
            self.client
                .post(&url)
                .query(&[("key", self.api_key.as_str())])
                .json(&body)
        })
        .await
        .map_err(|e| RouterError::Embedding(e.to_string()))?;

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RouterError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        let values = parsed.embedding.values;
        if values.len() != EMBEDDING_DIM {
            return Err(RouterError::Embedding(format!(
                "expected {EMBEDDING_DIM} dimensions, got {}",
                values.len()
            )));
        }
        Ok(values)
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

// ============================================================================
// Mock Implementation (Test Only)
// ============================================================================

/// Deterministic bag-of-words embedder: every lowercase token is hashed into
/// a bucket, then the vector is L2-normalized. Texts sharing words land close
/// together under cosine similarity.
#[cfg(test)]
pub struct MockEmbedder {
    pub dim: usize,
    pub calls: std::sync::atomic::AtomicUsize,
    pub fail: bool,
}

#[cfg(test)]
impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(8)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use std::hash::{Hash, Hasher};

        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail {
            return Err(RouterError::Embedding("mock embedder down".into()));
        }

        let mut v = vec![0.0f32; self.dim];
        for token in preprocess(text)
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % self.dim as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = EmbedRequest {
            model: "models/embedding-001",
            content: EmbedContent {
                parts: vec![EmbedPart { text: "Table: price" }],
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["content"]["parts"][0]["text"], "Table: price");
    }

    #[test]
    fn test_with_model_prefixes() {
        let e = GeminiEmbedder::new("k".into()).with_model("text-embedding-004");
        assert_eq!(e.model, "models/text-embedding-004");
        let e = GeminiEmbedder::new("k".into()).with_model("models/embedding-001");
        assert_eq!(e.model, "models/embedding-001");
    }

    #[tokio::test]
    async fn test_mock_is_deterministic_and_trimmed() {
        let e = MockEmbedder::new(64);
        let a = e.embed("cheapest milk").await.unwrap();
        let b = e.embed("  cheapest milk \n").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(e.call_count(), 2);
    }
}
