use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vectors = self.embed(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: vectors.len(),
            });
        }
        Ok(vectors.into_iter().next().unwrap_or_default())
    }
}

/// Hashed character trigram embedder. Deterministic and offline, used when no
/// embedding endpoint is configured and throughout the tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    batch_size: usize,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let base = ensure_trailing_slash(&config.base_url);
        let endpoint = Url::parse(&base)?.join("embeddings")?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size.max(1),
            timeout: config.timeout,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&json!({
                "model": self.model,
                "input": batch,
            }));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::Decode(error.to_string()))?;

        order_batch(payload.data, batch.len(), self.dimensions)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(batch_size = batch.len(), model = %self.model, "requesting embeddings");
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

fn order_batch(
    mut items: Vec<EmbeddingItem>,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if items.len() != expected {
        return Err(EmbeddingError::CountMismatch {
            expected,
            actual: items.len(),
        });
    }

    items.sort_by_key(|item| item.index);
    items
        .into_iter()
        .map(|item| {
            if item.embedding.len() != dimensions {
                Err(EmbeddingError::DimensionMismatch {
                    expected: dimensions,
                    actual: item.embedding.len(),
                })
            } else {
                Ok(item.embedding)
            }
        })
        .collect()
}

pub(crate) fn ensure_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_one("Hydraulic pressure and flow");
        let second = embedder.embed_one("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_one("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn query_embedding_matches_batch_embedding() {
        let embedder = CharacterNgramEmbedder::default();
        let batch = embedder
            .embed(&["annual leave policy".to_string()])
            .await
            .expect("batch embedding should succeed");
        let query = embedder
            .embed_query("annual leave policy")
            .await
            .expect("query embedding should succeed");
        assert_eq!(batch[0], query);
    }

    #[test]
    fn batch_results_are_reordered_by_index() {
        let items = vec![
            EmbeddingItem {
                index: 1,
                embedding: vec![0.0, 1.0],
            },
            EmbeddingItem {
                index: 0,
                embedding: vec![1.0, 0.0],
            },
        ];

        let ordered = order_batch(items, 2, 2).expect("batch should be accepted");
        assert_eq!(ordered, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn short_or_misshapen_batches_are_rejected() {
        let items = vec![EmbeddingItem {
            index: 0,
            embedding: vec![1.0],
        }];
        assert!(matches!(
            order_batch(items, 2, 1),
            Err(EmbeddingError::CountMismatch { expected: 2, actual: 1 })
        ));

        let items = vec![EmbeddingItem {
            index: 0,
            embedding: vec![1.0],
        }];
        assert!(matches!(
            order_batch(items, 1, 3),
            Err(EmbeddingError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn endpoint_is_joined_onto_the_base_url() {
        let embedder = OpenAiEmbedder::new(&EmbeddingConfig {
            base_url: "http://localhost:8080/v1".to_string(),
            ..EmbeddingConfig::default()
        })
        .expect("config should be valid");
        assert_eq!(embedder.endpoint.as_str(), "http://localhost:8080/v1/embeddings");
    }
}
