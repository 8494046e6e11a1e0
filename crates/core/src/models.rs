use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Local,
    Remote,
}

impl fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderMode::Local => f.write_str("local"),
            ProviderMode::Remote => f.write_str("remote"),
        }
    }
}

/// Identity of an embedding model as seen by the vector index.
///
/// Two descriptors are compatible only when mode, model and dimensionality all agree;
/// vectors produced under different descriptors are not comparable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProviderDescriptor {
    pub mode: ProviderMode,
    pub model: String,
    pub dimensions: usize,
    pub max_input_tokens: usize,
}

impl ProviderDescriptor {
    pub fn is_compatible_with(&self, other: &ProviderDescriptor) -> bool {
        self.mode == other.mode && self.model == other.model && self.dimensions == other.dimensions
    }
}

impl fmt::Display for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}d)", self.mode, self.model, self.dimensions)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Pending,
    Ready,
    Failed,
}

/// Steps of the ingestion pipeline, in the order they complete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStage {
    Received,
    Extracted,
    Chunked,
    Embedded,
    Indexed,
    EntitiesExtracted,
    Ready,
}

impl fmt::Display for IngestionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IngestionStage::Received => "received",
            IngestionStage::Extracted => "extracted",
            IngestionStage::Chunked => "chunked",
            IngestionStage::Embedded => "embedded",
            IngestionStage::Indexed => "indexed",
            IngestionStage::EntitiesExtracted => "entities_extracted",
            IngestionStage::Ready => "ready",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionFailure {
    pub last_completed: IngestionStage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntitySource {
    Generation,
    Pattern,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub contract_id: String,
    pub original_filename: String,
    pub page_count: usize,
    pub size_bytes: usize,
    pub ingested_at: DateTime<Utc>,
    pub status: ContractStatus,
    /// Last pipeline step that committed for this contract.
    pub stage: IngestionStage,
    pub failure: Option<IngestionFailure>,
    pub entity_source: Option<EntitySource>,
    /// Set when entity extraction degraded; ingestion still completes.
    pub entity_failure: Option<String>,
}

impl Contract {
    pub fn is_ready(&self) -> bool {
        self.status == ContractStatus::Ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub contract_id: String,
    pub chunk_index: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub token_count: usize,
    /// Tokens at the start of this chunk repeated from the end of the previous one.
    pub overlap_tokens: usize,
    pub overlaps_previous: bool,
    pub text: String,
}

/// One stored vector plus the payload needed to cite it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_index: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub text: String,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            page_start: chunk.page_start,
            page_end: chunk.page_end,
            text: chunk.text.clone(),
            vector,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_index: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Party,
    Date,
    MonetaryValue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Party => f.write_str("party"),
            EntityKind::Date => f.write_str("date"),
            EntityKind::MonetaryValue => f.write_str("monetary_value"),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub kind: EntityKind,
    pub text: String,
    pub normalized: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub chunk_index: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub excerpt: String,
    pub score: f32,
}

impl Citation {
    pub fn page_label(&self) -> String {
        if self.page_start == self.page_end {
            format!("page {}", self.page_start)
        } else {
            format!("pages {}-{}", self.page_start, self.page_end)
        }
    }
}

impl From<ScoredChunk> for Citation {
    fn from(value: ScoredChunk) -> Self {
        Self {
            chunk_index: value.chunk_index,
            page_start: value.page_start,
            page_end: value.page_end,
            excerpt: value.text,
            score: value.score,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaAnswer {
    pub answer_id: uuid::Uuid,
    pub contract_id: String,
    pub question: String,
    pub answer: String,
    /// False for the canned response returned when retrieval found nothing usable.
    pub grounded: bool,
    pub citations: Vec<Citation>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub contract: Contract,
    pub entities: Vec<Entity>,
    pub chunk_count: usize,
    pub oversized_segments: usize,
}
