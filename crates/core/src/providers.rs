//! Provider selection and the HTTP plumbing shared by every backend.
//!
//! The concrete embedding and generation backends are chosen exactly once from
//! [`ProviderSettings::mode`](crate::config::ProviderSettings) and handed to the
//! orchestrator as trait objects; nothing downstream branches on the mode again.

use crate::config::Settings;
use crate::embeddings::{EmbeddingProvider, LocalEmbeddingProvider, RemoteEmbeddingProvider};
use crate::error::ProviderError;
use crate::generation::{GenerationProvider, LocalGenerationProvider, RemoteGenerationProvider};
use crate::models::ProviderMode;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::info;
use url::Url;

#[derive(Clone)]
pub struct ProviderPair {
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub generation: Arc<dyn GenerationProvider>,
}

pub fn build_providers(settings: &Settings) -> Result<ProviderPair, ProviderError> {
    let pair = match settings.providers.mode {
        ProviderMode::Local => ProviderPair {
            embedding: Arc::new(LocalEmbeddingProvider::new(settings)?),
            generation: Arc::new(LocalGenerationProvider::new(settings)?),
        },
        ProviderMode::Remote => ProviderPair {
            embedding: Arc::new(RemoteEmbeddingProvider::new(settings)?),
            generation: Arc::new(RemoteGenerationProvider::new(settings)?),
        },
    };

    info!(
        mode = %settings.providers.mode,
        embedding = %pair.embedding.descriptor(),
        generation = pair.generation.model(),
        "providers selected"
    );
    Ok(pair)
}

pub(crate) fn http_client(settings: &Settings) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(settings.providers.request_timeout)
        .build()
        .map_err(|error| ProviderError::Configuration(error.to_string()))
}

/// Resolves `path` under `base`, treating `base` as a directory even without a trailing slash.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url, ProviderError> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?.join(path)?)
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let details = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            code: status.as_u16(),
            details,
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|error| ProviderError::InvalidResponse(error.to_string()))
}

pub(crate) fn require_api_key(settings: &Settings) -> Result<String, ProviderError> {
    settings
        .providers
        .remote
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Configuration("remote providers require an API key".to_string()))
}
