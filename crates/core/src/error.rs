use crate::models::IngestionStage;
use thiserror::Error;

/// Outcome of a single call to an embedding or generation backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned status {code}: {details}")]
    Status { code: u16, details: String },

    #[error("provider call timed out: {0}")]
    Timeout(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider misconfigured: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Connection failures, timeouts, rate limiting and server errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::Timeout(_) => true,
            ProviderError::Status { code, .. } => *code == 429 || *code >= 500,
            ProviderError::InvalidResponse(_) | ProviderError::Configuration(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            ProviderError::Status {
                code: status.as_u16(),
                details: error.to_string(),
            }
        } else if error.is_timeout() {
            ProviderError::Timeout(error.to_string())
        } else if error.is_decode() {
            ProviderError::InvalidResponse(error.to_string())
        } else {
            ProviderError::Transport(error.to_string())
        }
    }
}

impl From<url::ParseError> for ProviderError {
    fn from(error: url::ParseError) -> Self {
        ProviderError::Configuration(error.to_string())
    }
}

/// A caller-supplied contract id that is not 64 lowercase hex characters.
#[derive(Debug, Error)]
#[error("invalid contract id: {0:?}")]
pub struct InvalidContractId(pub String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backing store at {path} is corrupted: {details}")]
    Corrupted { path: String, details: String },

    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("contract already registered: {0}")]
    DuplicateContract(String),

    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("pdf is {actual} bytes, limit is {limit}")]
    SizeExceeded { actual: usize, limit: usize },

    #[error("pdf has {actual} pages, limit is {limit}")]
    PageLimitExceeded { actual: usize, limit: usize },

    #[error("pdf extraction failed: {0}")]
    Extraction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid chunking config: {0}")]
    Chunking(String),

    #[error("ingestion already in progress for contract {0}")]
    IngestionInProgress(String),

    #[error("contract already registered: {0}")]
    DuplicateContract(String),

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ingestion failed after stage {last_completed}: {reason}")]
    Failed {
        last_completed: IngestionStage,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("contract {0} is not ready for questions")]
    ContractNotReady(String),

    #[error("contract was indexed with {indexed} but the active embedding provider is {active}")]
    ProviderMismatch { indexed: String, active: String },

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("generation provider unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("generation exceeded its deadline: {0}")]
    GenerationTimeout(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<InvalidContractId> for IngestError {
    fn from(error: InvalidContractId) -> Self {
        IngestError::InvalidArgument(error.to_string())
    }
}

impl From<InvalidContractId> for QueryError {
    fn from(error: InvalidContractId) -> Self {
        QueryError::InvalidArgument(error.to_string())
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
