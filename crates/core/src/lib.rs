pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod entities;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{ChunkStream, Chunker, ChunkingConfig, EstimatedTokenCounter, TokenCounter};
pub use config::{ExtractionStrategy, OcrSettings, Settings};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingProvider, LocalEmbeddingProvider, RemoteEmbeddingProvider,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use entities::{EntityExtraction, EntityExtractor, EntityPatterns};
pub use error::{IngestError, InvalidContractId, ProviderError, QueryError, StoreError};
pub use extractor::{ExtractedDocument, LopdfExtractor, OcrExtractor, PdfExtractor, TextExtractor};
pub use generation::{
    ContextPassage, Generation, GenerationProvider, LocalGenerationProvider, Prompt,
    RemoteGenerationProvider,
};
pub use ingest::{contract_id_for, discover_pdf_files, sanitize_filename, validate_contract_id};
pub use models::{
    Chunk, Citation, Contract, ContractStatus, EmbeddingRecord, Entity, EntityKind, EntitySource,
    IngestionFailure, IngestionReport, IngestionStage, PageText, ProviderDescriptor, ProviderMode,
    QaAnswer, ScoredChunk, TokenUsage,
};
pub use orchestrator::{QaOrchestrator, INSUFFICIENT_GROUNDING};
pub use providers::{build_providers, ProviderPair};
pub use registry::ContractRegistry;
pub use retry::RetryPolicy;
pub use stores::FileVectorIndex;
pub use traits::VectorIndex;
