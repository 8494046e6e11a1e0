//! Process-wide settings.
//!
//! A [`Settings`] value is built once at startup (defaults plus whatever the front-end
//! overrides) and handed by reference to every component constructor. Nothing in the
//! library reads environment variables or other ambient state on its own.

use crate::models::ProviderMode;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub limits: Limits,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub retry: RetrySettings,
    pub entities: EntitySettings,
    pub storage: StorageSettings,
    pub providers: ProviderSettings,
    pub ocr: OcrSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_pdf_bytes: usize,
    pub max_pages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pdf_bytes: 25 * 1024 * 1024,
            max_pages: 100,
        }
    }
}

/// Chunk sizes are derived from the embedding model's input limit unless overridden.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingSettings {
    pub chunk_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
    pub chunk_fraction_of_limit: f64,
    pub overlap_fraction: f64,
    /// Portion of the chunk size searched backwards for a sentence or paragraph end.
    pub lookback_fraction: f64,
    pub chars_per_token: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_tokens: None,
            overlap_tokens: None,
            chunk_fraction_of_limit: 0.8,
            overlap_fraction: 0.2,
            lookback_fraction: 0.2,
            chars_per_token: 4,
        }
    }
}

/// Which extractor produces page text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Text layer first, OCR when it is missing or too thin.
    #[default]
    Auto,
    TextOnly,
    ForceOcr,
}

/// Multimodal OCR service for scanned or unparseable PDFs. Disabled without an endpoint.
#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub strategy: ExtractionStrategy,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout: Duration::from_secs(120),
            strategy: ExtractionStrategy::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalSettings {
    pub top_k: usize,
    /// Retrieved chunks scoring below this cosine similarity are not used as grounding.
    pub min_similarity: f32,
    pub entity_routing: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 4,
            min_similarity: 0.2,
            entity_routing: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub embedding_deadline: Duration,
    pub generation_deadline: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            embedding_deadline: Duration::from_secs(60),
            generation_deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EntitySettings {
    pub max_text_chars: usize,
    pub use_generation: bool,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            max_text_chars: 12_000,
            use_generation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl StorageSettings {
    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("contracts")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub mode: ProviderMode,
    pub local: LocalProviderSettings,
    pub remote: RemoteProviderSettings,
    pub request_timeout: Duration,
    pub embedding_batch_size: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Local,
            local: LocalProviderSettings::default(),
            remote: RemoteProviderSettings::default(),
            request_timeout: Duration::from_secs(30),
            embedding_batch_size: 32,
        }
    }
}

/// Self-hosted services: a text-embeddings-inference server and an Ollama daemon.
#[derive(Debug, Clone)]
pub struct LocalProviderSettings {
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_max_input_tokens: usize,
    pub generation_url: String,
    pub generation_model: String,
}

impl Default for LocalProviderSettings {
    fn default() -> Self {
        Self {
            embedding_url: "http://localhost:8504".to_string(),
            embedding_model: "intfloat/multilingual-e5-large-instruct".to_string(),
            embedding_dimensions: 1024,
            embedding_max_input_tokens: 512,
            generation_url: "http://localhost:11434".to_string(),
            generation_model: "llama3.2:3b".to_string(),
        }
    }
}

/// Hosted OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct RemoteProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_max_input_tokens: usize,
    pub generation_model: String,
}

impl Default for RemoteProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/".to_string(),
            api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            embedding_max_input_tokens: 8192,
            generation_model: "gpt-4o-mini".to_string(),
        }
    }
}
