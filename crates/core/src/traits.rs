use crate::error::StoreError;
use crate::models::{EmbeddingRecord, ProviderDescriptor, ScoredChunk};
use async_trait::async_trait;

/// Nearest-neighbour store of chunk embeddings, partitioned by contract.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replaces every record of `contract_id` with `records` in one step.
    ///
    /// On error the previous record set is left untouched.
    async fn upsert(
        &self,
        contract_id: &str,
        embedder: &ProviderDescriptor,
        records: Vec<EmbeddingRecord>,
    ) -> Result<(), StoreError>;

    /// Top `k` records by cosine similarity, descending; equal scores by ascending chunk index.
    async fn query(
        &self,
        contract_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    async fn delete(&self, contract_id: &str) -> Result<bool, StoreError>;

    /// Embedding provider the contract was indexed with, if it is indexed at all.
    async fn descriptor(&self, contract_id: &str) -> Result<Option<ProviderDescriptor>, StoreError>;

    async fn count(&self, contract_id: &str) -> Result<usize, StoreError>;
}
