use crate::error::StoreError;
use crate::ingest::is_contract_id;
use crate::models::{Contract, ContractStatus, Entity, EntitySource, IngestionFailure, IngestionStage};
use crate::store::{read_json, read_json_if_exists, sweep_temp_files, write_bytes_atomic, write_json_atomic};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const ENTITIES_FILE: &str = "entities.json";
const SOURCE_FILE: &str = "source.pdf";
const INTERRUPTED: &str = "ingestion interrupted before completion";

/// Durable contract metadata, entities and source copies, one directory per contract.
///
/// All metadata is loaded on open and kept in memory; every mutation is written
/// through to disk before the in-memory view changes.
pub struct ContractRegistry {
    root: PathBuf,
    contracts: RwLock<HashMap<String, Contract>>,
}

impl ContractRegistry {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut contracts = HashMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let dir = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_contract_id(&name) {
                warn!(path = %dir.display(), "ignoring non-contract directory in registry");
                continue;
            }

            let swept = sweep_temp_files(&dir).await?;
            if swept > 0 {
                warn!(contract_id = %name, swept, "removed interrupted registry writes");
            }

            let meta_path = dir.join(META_FILE);
            let mut contract: Contract = read_json(&meta_path).await.map_err(|error| match error {
                StoreError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    StoreError::Corrupted {
                        path: meta_path.display().to_string(),
                        details: "contract directory has no metadata".to_string(),
                    }
                }
                other => other,
            })?;

            if contract.contract_id != name {
                return Err(StoreError::Corrupted {
                    path: meta_path.display().to_string(),
                    details: format!("metadata names contract {}", contract.contract_id),
                });
            }

            if is_unfinished(&contract) {
                record_failure(&mut contract, INTERRUPTED.to_string());
                write_json_atomic(&meta_path, &contract).await?;
                warn!(
                    contract_id = %name,
                    status = ?contract.status,
                    last_completed = ?contract.failure.as_ref().map(|failure| failure.last_completed),
                    "settled interrupted ingestion"
                );
            }
            contracts.insert(name, contract);
        }

        info!(root = %root.display(), contracts = contracts.len(), "contract registry opened");
        Ok(Self {
            root,
            contracts: RwLock::new(contracts),
        })
    }

    fn contract_dir(&self, contract_id: &str) -> PathBuf {
        self.root.join(contract_id)
    }

    pub fn source_path(&self, contract_id: &str) -> PathBuf {
        self.contract_dir(contract_id).join(SOURCE_FILE)
    }

    /// Creates the entry, or replaces it when `overwrite` is set.
    ///
    /// Replacing drops stale entities, except for a ready contract being refreshed, which
    /// keeps answering from its previous entities until new ones are attached.
    pub async fn register(&self, contract: Contract, overwrite: bool) -> Result<(), StoreError> {
        let mut contracts = self.contracts.write().await;
        let existed = contracts.contains_key(&contract.contract_id);
        if existed && !overwrite {
            return Err(StoreError::DuplicateContract(contract.contract_id));
        }

        let dir = self.contract_dir(&contract.contract_id);
        write_json_atomic(&dir.join(META_FILE), &contract).await?;
        if existed && contract.status != ContractStatus::Ready {
            remove_if_exists(&dir.join(ENTITIES_FILE)).await?;
        }

        debug!(contract_id = %contract.contract_id, replaced = existed, "contract registered");
        contracts.insert(contract.contract_id.clone(), contract);
        Ok(())
    }

    pub async fn store_source(&self, contract_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if !self.exists(contract_id).await {
            return Err(StoreError::NotFound(contract_id.to_string()));
        }
        write_bytes_atomic(&self.source_path(contract_id), bytes).await
    }

    async fn update<F>(&self, contract_id: &str, mutate: F) -> Result<Contract, StoreError>
    where
        F: FnOnce(&mut Contract),
    {
        let mut contracts = self.contracts.write().await;
        let current = contracts
            .get(contract_id)
            .ok_or_else(|| StoreError::NotFound(contract_id.to_string()))?;

        let mut updated = current.clone();
        mutate(&mut updated);
        write_json_atomic(&self.contract_dir(contract_id).join(META_FILE), &updated).await?;
        contracts.insert(contract_id.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn update_status(
        &self,
        contract_id: &str,
        status: ContractStatus,
    ) -> Result<Contract, StoreError> {
        self.update(contract_id, |contract| contract.status = status).await
    }

    /// Commits a completed pipeline step; reaching `Ready` also flips the status.
    pub async fn record_stage(
        &self,
        contract_id: &str,
        stage: IngestionStage,
    ) -> Result<Contract, StoreError> {
        self.update(contract_id, |contract| {
            contract.stage = stage;
            if stage == IngestionStage::Ready {
                contract.status = ContractStatus::Ready;
                contract.failure = None;
            }
        })
        .await
    }

    /// Records a pipeline failure. A contract that was ready before the run keeps serving
    /// its committed vectors and stays ready; anything else becomes failed.
    pub async fn mark_failed(
        &self,
        contract_id: &str,
        reason: impl Into<String>,
    ) -> Result<Contract, StoreError> {
        let reason = reason.into();
        self.update(contract_id, |contract| record_failure(contract, reason))
            .await
    }

    pub async fn attach_entities(
        &self,
        contract_id: &str,
        entities: &[Entity],
        source: Option<EntitySource>,
        failure: Option<String>,
    ) -> Result<Contract, StoreError> {
        if !self.exists(contract_id).await {
            return Err(StoreError::NotFound(contract_id.to_string()));
        }

        write_json_atomic(&self.contract_dir(contract_id).join(ENTITIES_FILE), &entities).await?;
        self.update(contract_id, |contract| {
            contract.entity_source = source;
            contract.entity_failure = failure;
        })
        .await
    }

    pub async fn get(&self, contract_id: &str) -> Result<Contract, StoreError> {
        self.contracts
            .read()
            .await
            .get(contract_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(contract_id.to_string()))
    }

    pub async fn exists(&self, contract_id: &str) -> bool {
        self.contracts.read().await.contains_key(contract_id)
    }

    /// Newest first; contracts ingested in the same instant are ordered by id.
    pub async fn list(&self) -> Vec<Contract> {
        let mut contracts: Vec<Contract> = self.contracts.read().await.values().cloned().collect();
        contracts.sort_by(|left, right| {
            right
                .ingested_at
                .cmp(&left.ingested_at)
                .then_with(|| left.contract_id.cmp(&right.contract_id))
        });
        contracts
    }

    pub async fn entities(&self, contract_id: &str) -> Result<Vec<Entity>, StoreError> {
        if !self.exists(contract_id).await {
            return Err(StoreError::NotFound(contract_id.to_string()));
        }
        let stored: Option<Vec<Entity>> =
            read_json_if_exists(&self.contract_dir(contract_id).join(ENTITIES_FILE)).await?;
        Ok(stored.unwrap_or_default())
    }

    pub async fn remove(&self, contract_id: &str) -> Result<Contract, StoreError> {
        let mut contracts = self.contracts.write().await;
        let removed = contracts
            .remove(contract_id)
            .ok_or_else(|| StoreError::NotFound(contract_id.to_string()))?;

        if let Err(error) = fs::remove_dir_all(self.contract_dir(contract_id)).await {
            contracts.insert(contract_id.to_string(), removed);
            return Err(error.into());
        }

        info!(contract_id, "contract removed from registry");
        Ok(removed)
    }
}

/// Pending entries, and ready entries part-way through a refresh, belong to a run that
/// never returned.
fn is_unfinished(contract: &Contract) -> bool {
    match contract.status {
        ContractStatus::Pending => true,
        ContractStatus::Ready => contract.stage != IngestionStage::Ready,
        ContractStatus::Failed => false,
    }
}

fn record_failure(contract: &mut Contract, reason: String) {
    let last_completed = contract.stage;
    if contract.status == ContractStatus::Ready {
        contract.stage = IngestionStage::Ready;
    } else {
        contract.status = ContractStatus::Failed;
    }
    contract.failure = Some(IngestionFailure {
        last_completed,
        reason,
        failed_at: Utc::now(),
    });
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}
