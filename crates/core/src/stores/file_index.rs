use crate::error::StoreError;
use crate::models::{EmbeddingRecord, ProviderDescriptor, ScoredChunk};
use crate::store::{read_json, read_json_if_exists, sweep_temp_files, write_json_atomic};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    dimensions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContractVectors {
    contract_id: String,
    embedder: ProviderDescriptor,
    records: Vec<EmbeddingRecord>,
}

#[derive(Debug, Default)]
struct IndexState {
    dimensions: Option<usize>,
    contracts: HashMap<String, ContractVectors>,
}

/// Brute-force cosine index persisted as one JSON file per contract.
///
/// Layout under the root directory:
/// `manifest.json` holds the index dimensionality, `contracts/<id>.json` holds the
/// provider descriptor and every record of one contract. Replacing a contract's
/// record set is a single atomic file swap, and that swap is the commit point: the
/// contract files are authoritative and the manifest is rebuilt from them on open.
pub struct FileVectorIndex {
    root: PathBuf,
    state: RwLock<IndexState>,
}

impl FileVectorIndex {
    /// Loads every stored contract; unreadable files fail the open instead of being skipped.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let contracts_dir = root.join("contracts");
        fs::create_dir_all(&contracts_dir).await?;

        let swept = sweep_temp_files(&root).await? + sweep_temp_files(&contracts_dir).await?;
        if swept > 0 {
            warn!(root = %root.display(), swept, "removed interrupted index writes");
        }

        let manifest_path = root.join("manifest.json");
        let manifest: Option<Manifest> = read_json_if_exists(&manifest_path).await?;
        if let Some(manifest) = &manifest {
            if manifest.version != MANIFEST_VERSION {
                return Err(corrupted(
                    &manifest_path,
                    format!("unsupported manifest version {}", manifest.version),
                ));
            }
        }

        let mut state = IndexState::default();
        let mut entries = fs::read_dir(&contracts_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let stored: ContractVectors = read_json(&path).await?;
            validate_stored(&path, &stored, state.dimensions)?;
            state.dimensions = Some(stored.embedder.dimensions);
            state.contracts.insert(stored.contract_id.clone(), stored);
        }

        let recorded = manifest.map(|manifest| manifest.dimensions);
        let dimensions = state.dimensions;
        info!(
            root = %root.display(),
            contracts = state.contracts.len(),
            dimensions = ?dimensions,
            "vector index opened"
        );

        let index = Self {
            root,
            state: RwLock::new(state),
        };
        if let Some(dimensions) = dimensions.filter(|dimensions| recorded != Some(*dimensions)) {
            warn!(recorded = ?recorded, dimensions, "index manifest lagged behind contract files, rewriting");
            index.write_manifest(dimensions).await?;
        }
        Ok(index)
    }

    pub async fn dimensions(&self) -> Option<usize> {
        self.state.read().await.dimensions
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    async fn write_manifest(&self, dimensions: usize) -> Result<(), StoreError> {
        write_json_atomic(
            &self.manifest_path(),
            &Manifest {
                version: MANIFEST_VERSION,
                dimensions,
            },
        )
        .await
    }

    fn contract_path(&self, contract_id: &str) -> PathBuf {
        self.root.join("contracts").join(format!("{contract_id}.json"))
    }
}

fn corrupted(path: &Path, details: impl Into<String>) -> StoreError {
    StoreError::Corrupted {
        path: path.display().to_string(),
        details: details.into(),
    }
}

fn validate_stored(
    path: &Path,
    stored: &ContractVectors,
    dimensions: Option<usize>,
) -> Result<(), StoreError> {
    let stem = path.file_stem().and_then(|stem| stem.to_str());
    if stem != Some(stored.contract_id.as_str()) {
        return Err(corrupted(path, "file name does not match contract id"));
    }

    if let Some(dimensions) = dimensions {
        if stored.embedder.dimensions != dimensions {
            return Err(corrupted(
                path,
                format!(
                    "contract indexed at {} dimensions, other contracts hold {}",
                    stored.embedder.dimensions, dimensions
                ),
            ));
        }
    }
    let dimensions = stored.embedder.dimensions;
    if let Some(record) = stored.records.iter().find(|record| record.vector.len() != dimensions) {
        return Err(corrupted(
            path,
            format!("chunk {} has {} dimensions", record.chunk_index, record.vector.len()),
        ));
    }
    Ok(())
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut left_norm = 0f32;
    let mut right_norm = 0f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

fn rank(records: &[EmbeddingRecord], vector: &[f32], k: usize) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = records
        .iter()
        .map(|record| ScoredChunk {
            chunk_index: record.chunk_index,
            page_start: record.page_start,
            page_end: record.page_end,
            text: record.text.clone(),
            score: cosine_similarity(&record.vector, vector),
        })
        .collect();

    scored.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.chunk_index.cmp(&right.chunk_index))
    });
    scored.truncate(k);
    scored
}

#[async_trait]
impl VectorIndex for FileVectorIndex {
    async fn upsert(
        &self,
        contract_id: &str,
        embedder: &ProviderDescriptor,
        records: Vec<EmbeddingRecord>,
    ) -> Result<(), StoreError> {
        if let Some(record) = records
            .iter()
            .find(|record| record.vector.len() != embedder.dimensions)
        {
            return Err(StoreError::DimensionMismatch {
                expected: embedder.dimensions,
                actual: record.vector.len(),
            });
        }

        let mut state = self.state.write().await;
        let conflicting = state
            .contracts
            .values()
            .filter(|stored| stored.contract_id != contract_id)
            .map(|stored| stored.embedder.dimensions)
            .find(|dimensions| *dimensions != embedder.dimensions);
        if let Some(expected) = conflicting {
            return Err(StoreError::DimensionMismatch {
                expected,
                actual: embedder.dimensions,
            });
        }

        let mut records = records;
        records.sort_by_key(|record| record.chunk_index);
        let stored = ContractVectors {
            contract_id: contract_id.to_string(),
            embedder: embedder.clone(),
            records,
        };
        write_json_atomic(&self.contract_path(contract_id), &stored).await?;

        debug!(
            contract_id,
            records = stored.records.len(),
            embedder = %stored.embedder,
            "contract vectors replaced"
        );
        state.contracts.insert(contract_id.to_string(), stored);

        // Committed above; a stale manifest is rebuilt on the next open.
        if state.dimensions != Some(embedder.dimensions) {
            state.dimensions = Some(embedder.dimensions);
            if let Err(error) = self.write_manifest(embedder.dimensions).await {
                warn!(%error, dimensions = embedder.dimensions, "could not update index manifest");
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        contract_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let state = self.state.read().await;
        let Some(stored) = state.contracts.get(contract_id) else {
            return Ok(Vec::new());
        };

        if vector.len() != stored.embedder.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: stored.embedder.dimensions,
                actual: vector.len(),
            });
        }

        Ok(rank(&stored.records, vector, k))
    }

    async fn delete(&self, contract_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if !state.contracts.contains_key(contract_id) {
            return Ok(false);
        }

        fs::remove_file(self.contract_path(contract_id)).await?;
        state.contracts.remove(contract_id);

        // An empty index adopts the dimensionality of whatever is indexed next.
        if state.contracts.is_empty() {
            state.dimensions = None;
            match fs::remove_file(self.manifest_path()).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => warn!(%error, "could not remove index manifest"),
            }
        }

        debug!(contract_id, "contract vectors deleted");
        Ok(true)
    }

    async fn descriptor(&self, contract_id: &str) -> Result<Option<ProviderDescriptor>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .contracts
            .get(contract_id)
            .map(|stored| stored.embedder.clone()))
    }

    async fn count(&self, contract_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .contracts
            .get(contract_id)
            .map_or(0, |stored| stored.records.len()))
    }
}
