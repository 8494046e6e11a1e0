use crate::chunking::{EstimatedTokenCounter, TokenCounter};
use crate::config::Settings;
use crate::error::ProviderError;
use crate::models::{ProviderDescriptor, ProviderMode};
use crate::providers::{endpoint, http_client, read_json, require_api_key};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use url::Url;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Length function matching this model, used to size chunks.
    fn token_counter(&self) -> Arc<dyn TokenCounter> {
        Arc::new(EstimatedTokenCounter::default())
    }

    /// Returns one vector per input, in input order, or an error. Never a partial list.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Rejects responses whose count or dimensionality disagrees with the request.
pub fn check_embeddings(
    descriptor: &ProviderDescriptor,
    requested: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if vectors.len() != requested {
        return Err(ProviderError::InvalidResponse(format!(
            "{} returned {} vectors for {} inputs",
            descriptor,
            vectors.len(),
            requested
        )));
    }
    if let Some(bad) = vectors.iter().find(|vector| vector.len() != descriptor.dimensions) {
        return Err(ProviderError::InvalidResponse(format!(
            "{} returned a {}-dimensional vector",
            descriptor,
            bad.len()
        )));
    }
    Ok(vectors)
}

/// Self-hosted text-embeddings-inference server (`POST /embed`).
pub struct LocalEmbeddingProvider {
    client: Client,
    url: Url,
    descriptor: ProviderDescriptor,
    chars_per_token: usize,
}

impl LocalEmbeddingProvider {
    pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
        let local = &settings.providers.local;
        Ok(Self {
            client: http_client(settings)?,
            url: endpoint(&local.embedding_url, "embed")?,
            descriptor: ProviderDescriptor {
                mode: ProviderMode::Local,
                model: local.embedding_model.clone(),
                dimensions: local.embedding_dimensions,
                max_input_tokens: local.embedding_max_input_tokens,
            },
            chars_per_token: settings.chunking.chars_per_token,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn token_counter(&self) -> Arc<dyn TokenCounter> {
        Arc::new(EstimatedTokenCounter {
            chars_per_token: self.chars_per_token,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({ "inputs": texts, "truncate": true }))
            .send()
            .await?;

        let vectors: Vec<Vec<f32>> = read_json(response).await?;
        check_embeddings(&self.descriptor, texts.len(), vectors)
    }
}

#[derive(Debug, Deserialize)]
struct RemoteEmbeddingResponse {
    data: Vec<RemoteEmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct RemoteEmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

fn order_remote_embeddings(response: RemoteEmbeddingResponse) -> Vec<Vec<f32>> {
    let mut items = response.data;
    items.sort_by_key(|item| item.index);
    items.into_iter().map(|item| item.embedding).collect()
}

/// Hosted OpenAI-compatible embeddings API (`POST /embeddings`).
pub struct RemoteEmbeddingProvider {
    client: Client,
    url: Url,
    api_key: String,
    descriptor: ProviderDescriptor,
    chars_per_token: usize,
}

impl RemoteEmbeddingProvider {
    pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
        let remote = &settings.providers.remote;
        Ok(Self {
            client: http_client(settings)?,
            url: endpoint(&remote.base_url, "embeddings")?,
            api_key: require_api_key(settings)?,
            descriptor: ProviderDescriptor {
                mode: ProviderMode::Remote,
                model: remote.embedding_model.clone(),
                dimensions: remote.embedding_dimensions,
                max_input_tokens: remote.embedding_max_input_tokens,
            },
            chars_per_token: settings.chunking.chars_per_token,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn token_counter(&self) -> Arc<dyn TokenCounter> {
        Arc::new(EstimatedTokenCounter {
            chars_per_token: self.chars_per_token,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.descriptor.model,
                "input": texts,
                "encoding_format": "float",
            }))
            .send()
            .await?;

        let parsed: RemoteEmbeddingResponse = read_json(response).await?;
        check_embeddings(&self.descriptor, texts.len(), order_remote_embeddings(parsed))
    }
}

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Offline embedder hashing character trigrams into a fixed number of buckets.
///
/// Deterministic and dependency-free; useful for dry runs and tests, not for quality retrieval.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    descriptor: ProviderDescriptor,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                mode: ProviderMode::Local,
                model: "char-trigram-hash".to_string(),
                dimensions: dimensions.max(1),
                max_input_tokens: 512,
            },
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.descriptor.dimensions];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
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

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}
