mod common;

use common::{
    nda_pdf, open_orchestrator, pdf_with_pages, providers, test_settings, ScriptedGenerator,
    VocabularyEmbedder,
};
use contract_qa_core::{
    contract_id_for, ContractRegistry, ContractStatus, EmbeddingRecord, EntityKind, EntitySource,
    ExtractionStrategy, FileVectorIndex, IngestError, IngestionStage, ProviderDescriptor, QaOrchestrator, QueryError,
    ScoredChunk, StoreError, VectorIndex,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn nda_ingests_to_ready_with_parties_and_dates() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;

    let report = orchestrator.ingest("uploads/NDA.pdf", nda_pdf(), true).await?;
    let contract = &report.contract;

    assert_eq!(contract.status, ContractStatus::Ready);
    assert_eq!(contract.stage, IngestionStage::Ready);
    assert_eq!(contract.page_count, 3);
    assert_eq!(contract.original_filename, "NDA.pdf");
    assert_eq!(contract.contract_id, contract_id_for(&nda_pdf()));
    assert_eq!(contract.entity_source, Some(EntitySource::Generation));
    assert!(report.entities.iter().any(|entity| entity.kind == EntityKind::Party));
    assert!(report.entities.iter().any(|entity| entity.kind == EntityKind::Date));

    assert!(report.chunk_count > 0);
    assert_eq!(
        orchestrator.index().count(&contract.contract_id).await?,
        report.chunk_count
    );
    assert_eq!(
        orchestrator.contract_entities(&contract.contract_id).await?,
        report.entities
    );
    assert!(orchestrator
        .registry()
        .source_path(&contract.contract_id)
        .exists());
    Ok(())
}

#[tokio::test]
async fn unreachable_generation_still_yields_pattern_entities() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::without_entities()),
        ),
    )
    .await;

    let report = orchestrator.ingest("nda.pdf", nda_pdf(), true).await?;

    assert!(report.contract.is_ready());
    assert_eq!(report.contract.entity_source, Some(EntitySource::Pattern));
    let parties: Vec<&str> = report
        .entities
        .iter()
        .filter(|entity| entity.kind == EntityKind::Party)
        .map(|entity| entity.text.as_str())
        .collect();
    assert!(parties.contains(&"Acme Corp"));
    assert!(report
        .entities
        .iter()
        .any(|entity| entity.normalized.as_deref() == Some("2024-01-15")));
    Ok(())
}

#[tokio::test]
async fn reingesting_the_same_pdf_does_not_duplicate_chunks() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;
    let question = "How must the receiving party protect confidential information?";

    let first = orchestrator.ingest("nda.pdf", nda_pdf(), true).await?;
    let id = first.contract.contract_id.clone();
    let first_count = orchestrator.index().count(&id).await?;
    let first_answer = orchestrator.ask(&id, question).await?;

    let second = orchestrator.ingest("nda-copy.pdf", nda_pdf(), true).await?;
    let second_count = orchestrator.index().count(&id).await?;
    let second_answer = orchestrator.ask(&id, question).await?;

    assert_eq!(first_count, second_count);
    assert_eq!(first.chunk_count, second.chunk_count);
    assert_eq!(first_answer.citations, second_answer.citations);
    assert_eq!(orchestrator.list_contracts().await.len(), 1);
    assert_eq!(second.contract.original_filename, "nda-copy.pdf");
    Ok(())
}

#[tokio::test]
async fn duplicate_is_rejected_without_replace() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;

    orchestrator.ingest("nda.pdf", nda_pdf(), false).await?;
    let again = orchestrator.ingest("nda.pdf", nda_pdf(), false).await;

    assert!(matches!(again, Err(IngestError::DuplicateContract(_))));
    Ok(())
}

#[tokio::test]
async fn oversized_pdf_is_rejected_before_any_record_exists() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut settings = test_settings(dir.path());
    settings.limits.max_pdf_bytes = 256;
    let embedder = Arc::new(VocabularyEmbedder::new("vocab-a"));
    let orchestrator = open_orchestrator(
        &settings,
        providers(embedder.clone(), Arc::new(ScriptedGenerator::new())),
    )
    .await;

    let bytes = nda_pdf();
    let size = bytes.len();
    let result = orchestrator.ingest("nda.pdf", bytes, true).await;

    assert!(matches!(
        result,
        Err(IngestError::SizeExceeded { actual, limit: 256 }) if actual == size
    ));
    assert!(orchestrator.list_contracts().await.is_empty());
    assert_eq!(std::fs::read_dir(settings.storage.registry_dir())?.count(), 0);
    assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn forced_ocr_needs_an_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut settings = test_settings(dir.path());
    settings.ocr.strategy = ExtractionStrategy::ForceOcr;
    let pair = providers(
        Arc::new(VocabularyEmbedder::new("vocab-a")),
        Arc::new(ScriptedGenerator::new()),
    );
    let index = FileVectorIndex::open(settings.storage.index_dir()).await?;
    let registry = ContractRegistry::open(settings.storage.registry_dir()).await?;

    let result = QaOrchestrator::new(&settings, pair, index, registry);
    assert!(matches!(result, Err(IngestError::InvalidArgument(_))));

    settings.ocr.endpoint = Some("http://127.0.0.1:9/ocr".to_string());
    let pair = providers(
        Arc::new(VocabularyEmbedder::new("vocab-a")),
        Arc::new(ScriptedGenerator::new()),
    );
    let index = FileVectorIndex::open(settings.storage.index_dir()).await?;
    let registry = ContractRegistry::open(settings.storage.registry_dir()).await?;
    assert!(QaOrchestrator::new(&settings, pair, index, registry).is_ok());
    Ok(())
}

#[tokio::test]
async fn page_limit_fails_closed_without_a_record() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut settings = test_settings(dir.path());
    settings.limits.max_pages = 2;
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;

    let result = orchestrator.ingest("nda.pdf", nda_pdf(), true).await;

    assert!(matches!(
        result,
        Err(IngestError::PageLimitExceeded { actual: 3, limit: 2 })
    ));
    assert!(orchestrator.list_contracts().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_ingestion_of_one_contract_admits_only_one() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;

    let (first, second) = tokio::join!(
        orchestrator.ingest("nda.pdf", nda_pdf(), true),
        orchestrator.ingest("nda.pdf", nda_pdf(), true)
    );

    let outcomes = [first, second];
    let ready = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(report) if report.contract.is_ready()))
        .count();
    let rejected = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(IngestError::IngestionInProgress(_))))
        .count();
    assert_eq!((ready, rejected), (1, 1));

    // the guard is released once the winner finishes
    orchestrator.ingest("nda.pdf", nda_pdf(), true).await?;
    Ok(())
}

#[tokio::test]
async fn different_contracts_ingest_in_parallel() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;

    let other = pdf_with_pages(&[
        "SERVICES AGREEMENT between Gamma Ltd and Delta Corp dated March 3, 2023.",
        "The receiving party shall keep business information confidential.",
    ]);
    let (first, second) = tokio::join!(
        orchestrator.ingest("nda.pdf", nda_pdf(), true),
        orchestrator.ingest("services.pdf", other, true)
    );

    assert!(first?.contract.is_ready());
    assert!(second?.contract.is_ready());
    assert_eq!(orchestrator.list_contracts().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn embedding_outage_marks_contract_failed_after_chunking() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let embedder = Arc::new(VocabularyEmbedder::unreachable("vocab-a"));
    let orchestrator = open_orchestrator(
        &settings,
        providers(embedder.clone(), Arc::new(ScriptedGenerator::new())),
    )
    .await;

    let result = orchestrator.ingest("nda.pdf", nda_pdf(), true).await;

    assert!(matches!(
        result,
        Err(IngestError::Failed {
            last_completed: IngestionStage::Chunked,
            ..
        })
    ));
    let id = contract_id_for(&nda_pdf());
    let contract = orchestrator.contract(&id).await?;
    assert_eq!(contract.status, ContractStatus::Failed);
    assert_eq!(
        contract.failure.map(|failure| failure.last_completed),
        Some(IngestionStage::Chunked)
    );
    assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    Ok(())
}

/// Delegates to a real index but refuses every upsert.
struct RejectingIndex {
    inner: FileVectorIndex,
}

#[async_trait]
impl VectorIndex for RejectingIndex {
    async fn upsert(
        &self,
        _contract_id: &str,
        _embedder: &ProviderDescriptor,
        _records: Vec<EmbeddingRecord>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }

    async fn query(
        &self,
        contract_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.inner.query(contract_id, vector, k).await
    }

    async fn delete(&self, contract_id: &str) -> Result<bool, StoreError> {
        self.inner.delete(contract_id).await
    }

    async fn descriptor(&self, contract_id: &str) -> Result<Option<ProviderDescriptor>, StoreError> {
        self.inner.descriptor(contract_id).await
    }

    async fn count(&self, contract_id: &str) -> Result<usize, StoreError> {
        self.inner.count(contract_id).await
    }
}

#[tokio::test]
async fn index_failure_leaves_contract_failed_not_pending() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let index = RejectingIndex {
        inner: FileVectorIndex::open(settings.storage.index_dir()).await?,
    };
    let registry = ContractRegistry::open(settings.storage.registry_dir()).await?;
    let orchestrator = QaOrchestrator::new(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
        index,
        registry,
    )?;

    let result = orchestrator.ingest("nda.pdf", nda_pdf(), true).await;
    assert!(matches!(
        result,
        Err(IngestError::Failed {
            last_completed: IngestionStage::Embedded,
            ..
        })
    ));

    let id = contract_id_for(&nda_pdf());
    let contract = orchestrator.contract(&id).await?;
    assert_eq!(contract.status, ContractStatus::Failed);
    assert!(contract.failure.is_some_and(|failure| failure.reason.contains("disk full")));

    let asked = orchestrator.ask(&id, "What is confidential information?").await;
    assert!(matches!(asked, Err(QueryError::ContractNotReady(_))));

    // a crashed process reports the same state after restart
    let reopened = ContractRegistry::open(settings.storage.registry_dir()).await?;
    assert_eq!(reopened.get(&id).await?.status, ContractStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn cancelled_ingestion_is_recorded_as_failed() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let orchestrator = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::stalled("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;
    let bytes = nda_pdf();
    let id = contract_id_for(&bytes);

    let cancelled = tokio::time::timeout(
        Duration::from_secs(1),
        orchestrator.ingest("nda.pdf", bytes, true),
    )
    .await;
    assert!(cancelled.is_err());

    let mut contract = orchestrator.contract(&id).await?;
    for _ in 0..200 {
        if contract.status != ContractStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        contract = orchestrator.contract(&id).await?;
    }
    assert_eq!(contract.status, ContractStatus::Failed);
    assert_eq!(
        contract.failure.map(|failure| failure.last_completed),
        Some(IngestionStage::Chunked)
    );

    let reopened = ContractRegistry::open(settings.storage.registry_dir()).await?;
    assert_eq!(reopened.get(&id).await?.status, ContractStatus::Failed);
    drop(reopened);

    // The id is free again once the cancellation is recorded.
    orchestrator.remove_contract(&id).await?;
    Ok(())
}

#[tokio::test]
async fn failed_refresh_keeps_serving_previous_vectors() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    let question = "How must the receiving party protect confidential information?";
    let (id, chunk_count) = {
        let orchestrator = open_orchestrator(
            &settings,
            providers(
                Arc::new(VocabularyEmbedder::new("vocab-a")),
                Arc::new(ScriptedGenerator::new()),
            ),
        )
        .await;
        let report = orchestrator.ingest("nda.pdf", nda_pdf(), true).await?;
        (report.contract.contract_id, report.chunk_count)
    };

    {
        let outage = open_orchestrator(
            &settings,
            providers(
                Arc::new(VocabularyEmbedder::unreachable("vocab-a")),
                Arc::new(ScriptedGenerator::new()),
            ),
        )
        .await;
        let refresh = outage.ingest("nda-v2.pdf", nda_pdf(), true).await;
        assert!(matches!(
            refresh,
            Err(IngestError::Failed {
                last_completed: IngestionStage::Chunked,
                ..
            })
        ));

        let contract = outage.contract(&id).await?;
        assert!(contract.is_ready());
        assert!(contract.failure.is_some());
        assert_eq!(outage.index().count(&id).await?, chunk_count);
        assert!(!outage.contract_entities(&id).await?.is_empty());
    }

    let recovered = open_orchestrator(
        &settings,
        providers(
            Arc::new(VocabularyEmbedder::new("vocab-a")),
            Arc::new(ScriptedGenerator::new()),
        ),
    )
    .await;
    assert!(recovered.ask(&id, question).await?.grounded);
    Ok(())
}
