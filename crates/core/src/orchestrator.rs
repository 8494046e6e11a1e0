use crate::chunking::{Chunker, ChunkingConfig};
use crate::config::{ExtractionStrategy, Settings};
use crate::embeddings::{check_embeddings, EmbeddingProvider};
use crate::entities::EntityExtractor;
use crate::error::{IngestError, ProviderError, QueryError, StoreError};
use crate::extractor::{ExtractedDocument, OcrExtractor, TextExtractor};
use crate::generation::{ContextPassage, GenerationProvider, Prompt};
use crate::ingest::{contract_id_for, sanitize_filename, validate_contract_id};
use crate::models::{
    Chunk, Citation, Contract, ContractStatus, EmbeddingRecord, Entity, EntityKind,
    IngestionReport, IngestionStage, QaAnswer, ScoredChunk,
};
use crate::providers::ProviderPair;
use crate::registry::ContractRegistry;
use crate::retry::RetryPolicy;
use crate::traits::VectorIndex;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INSUFFICIENT_GROUNDING: &str =
    "The contract excerpts available do not contain enough information to answer this question.";

const ANSWER_SYSTEM: &str = "You answer questions about a single contract using only the numbered \
excerpts supplied with the question. Cite every excerpt you rely on by its bracketed number, for \
example [2]. If the excerpts do not contain the answer, reply that the contract excerpts do not \
provide it. Never use outside knowledge.";

/// Runs the ingestion and question-answering pipelines over one index and registry.
pub struct QaOrchestrator<V>
where
    V: VectorIndex,
{
    settings: Settings,
    extractor: Arc<TextExtractor>,
    chunker: Chunker,
    embedding: Arc<dyn EmbeddingProvider>,
    generation: Arc<dyn GenerationProvider>,
    entities: EntityExtractor,
    index: V,
    registry: Arc<ContractRegistry>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

const CANCELLED: &str = "ingestion cancelled before completion";

/// Holds a contract id in the in-flight set until dropped.
///
/// While armed, the contract is registered but its pipeline has not returned; dropping
/// an armed guard means the ingest future was cancelled, so the contract is marked
/// failed before the id is released.
struct IngestionGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    contract_id: String,
    armed: Option<Arc<ContractRegistry>>,
}

impl IngestionGuard {
    fn arm(&mut self, registry: Arc<ContractRegistry>) {
        self.armed = Some(registry);
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

fn release(in_flight: &Mutex<HashSet<String>>, contract_id: &str) {
    let mut in_flight = in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    in_flight.remove(contract_id);
}

impl Drop for IngestionGuard {
    fn drop(&mut self) {
        let contract_id = std::mem::take(&mut self.contract_id);
        let runtime = tokio::runtime::Handle::try_current();
        match (self.armed.take(), runtime) {
            (Some(registry), Ok(runtime)) => {
                let in_flight = self.in_flight.clone();
                runtime.spawn(async move {
                    match registry.mark_failed(&contract_id, CANCELLED).await {
                        Ok(contract) => warn!(
                            %contract_id,
                            last_completed = ?contract.failure.map(|failure| failure.last_completed),
                            "ingestion cancelled"
                        ),
                        Err(error) => warn!(%contract_id, %error, "could not record cancelled ingestion"),
                    }
                    release(&in_flight, &contract_id);
                });
            }
            // Without a runtime the entry is settled by the next registry open.
            _ => release(&self.in_flight, &contract_id),
        }
    }
}

impl<V> QaOrchestrator<V>
where
    V: VectorIndex,
{
    pub fn new(
        settings: &Settings,
        providers: ProviderPair,
        index: V,
        registry: ContractRegistry,
    ) -> Result<Self, IngestError> {
        let descriptor = providers.embedding.descriptor();
        let chunking = ChunkingConfig::resolve(&settings.chunking, descriptor.max_input_tokens)?;
        let chunker = Chunker::new(chunking, providers.embedding.token_counter());
        let entities = EntityExtractor::new(settings, Some(providers.generation.clone()))
            .map_err(|error| IngestError::InvalidArgument(format!("entity patterns: {error}")))?;

        let mut extractor = TextExtractor::new(&settings.limits);
        match OcrExtractor::from_settings(&settings.ocr)? {
            Some(ocr) => extractor = extractor.with_ocr(ocr, settings.ocr.strategy),
            None if settings.ocr.strategy == ExtractionStrategy::ForceOcr => {
                return Err(IngestError::InvalidArgument(
                    "ocr extraction requires an ocr endpoint".to_string(),
                ))
            }
            None => {}
        }

        info!(
            embedding = %descriptor,
            chunk_tokens = chunking.chunk_tokens,
            overlap_tokens = chunking.overlap_tokens,
            ocr = settings.ocr.endpoint.is_some(),
            "orchestrator ready"
        );

        Ok(Self {
            settings: settings.clone(),
            extractor: Arc::new(extractor),
            chunker,
            embedding: providers.embedding,
            generation: providers.generation,
            entities,
            index,
            registry: Arc::new(registry),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn index(&self) -> &V {
        &self.index
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunker.config()
    }

    fn begin_ingestion(&self, contract_id: &str) -> Result<IngestionGuard, IngestError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_flight.insert(contract_id.to_string()) {
            return Err(IngestError::IngestionInProgress(contract_id.to_string()));
        }
        Ok(IngestionGuard {
            in_flight: self.in_flight.clone(),
            contract_id: contract_id.to_string(),
            armed: None,
        })
    }

    /// Ingests one PDF. With `replace_existing` a known contract is re-run from scratch;
    /// without it a known contract is rejected as a duplicate.
    ///
    /// A contract that is already ready stays queryable on its previous vectors while it
    /// is re-run, and stays ready if the re-run fails.
    pub async fn ingest(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        replace_existing: bool,
    ) -> Result<IngestionReport, IngestError> {
        let filename = sanitize_filename(filename)?;
        self.extractor.check_size(&bytes)?;

        let contract_id = contract_id_for(&bytes);
        let mut guard = self.begin_ingestion(&contract_id)?;
        info!(%contract_id, %filename, size_bytes = bytes.len(), stage = %IngestionStage::Received, "ingestion started");

        let previous = self.registry.get(&contract_id).await.ok();
        if previous.is_some() && !replace_existing {
            return Err(IngestError::DuplicateContract(contract_id));
        }
        let refreshing = previous.filter(Contract::is_ready);

        let bytes: Arc<[u8]> = bytes.into();
        let document = {
            let extractor = self.extractor.clone();
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || extractor.extract(&bytes))
                .await
                .map_err(|error| IngestError::Extraction(format!("extraction task failed: {error}")))??
        };

        let contract = Contract {
            contract_id: contract_id.clone(),
            original_filename: filename,
            page_count: document.page_count,
            size_bytes: bytes.len(),
            ingested_at: Utc::now(),
            status: if refreshing.is_some() {
                ContractStatus::Ready
            } else {
                ContractStatus::Pending
            },
            stage: IngestionStage::Extracted,
            failure: None,
            entity_source: refreshing.as_ref().and_then(|ready| ready.entity_source),
            entity_failure: refreshing.and_then(|ready| ready.entity_failure),
        };
        self.registry
            .register(contract, replace_existing)
            .await
            .map_err(|error| match error {
                StoreError::DuplicateContract(id) => IngestError::DuplicateContract(id),
                other => IngestError::Store(other),
            })?;
        guard.arm(self.registry.clone());
        info!(%contract_id, page_count = document.page_count, stage = %IngestionStage::Extracted, "contract registered");

        let outcome = self.run_pipeline(&contract_id, &bytes, &document).await;
        let outcome = match outcome {
            Ok(report) => Ok(report),
            Err(error) => {
                let reason = error.to_string();
                match self.registry.mark_failed(&contract_id, reason.clone()).await {
                    Ok(failed) => {
                        let last_completed = failed
                            .failure
                            .as_ref()
                            .map_or(failed.stage, |failure| failure.last_completed);
                        warn!(
                            %contract_id,
                            %last_completed,
                            still_ready = failed.is_ready(),
                            %reason,
                            "ingestion failed"
                        );
                        Err(IngestError::Failed {
                            last_completed,
                            reason,
                        })
                    }
                    Err(store_error) => {
                        warn!(%contract_id, %reason, %store_error, "ingestion failed and could not be recorded");
                        Err(error)
                    }
                }
            }
        };
        guard.disarm();
        outcome
    }

    async fn run_pipeline(
        &self,
        contract_id: &str,
        bytes: &[u8],
        document: &ExtractedDocument,
    ) -> Result<IngestionReport, IngestError> {
        self.registry.store_source(contract_id, bytes).await?;

        let mut stream = self.chunker.chunks(contract_id, &document.pages);
        let chunks: Vec<Chunk> = stream.by_ref().collect();
        let oversized_segments = stream.oversized_segments();
        if chunks.is_empty() {
            return Err(IngestError::Chunking("document produced no chunks".to_string()));
        }
        self.registry.record_stage(contract_id, IngestionStage::Chunked).await?;
        info!(
            contract_id,
            chunk_count = chunks.len(),
            oversized_segments,
            stage = %IngestionStage::Chunked,
            "document chunked"
        );

        let records = self.embed_chunks(&chunks).await?;
        self.registry.record_stage(contract_id, IngestionStage::Embedded).await?;
        debug!(contract_id, stage = %IngestionStage::Embedded, "chunks embedded");

        self.index
            .upsert(contract_id, self.embedding.descriptor(), records)
            .await?;
        self.registry.record_stage(contract_id, IngestionStage::Indexed).await?;
        debug!(contract_id, stage = %IngestionStage::Indexed, "chunks indexed");

        let (entities, source, failure) = self.entities.extract(&document.full_text()).await.into_parts();
        self.registry
            .attach_entities(contract_id, &entities, source, failure)
            .await?;
        self.registry
            .record_stage(contract_id, IngestionStage::EntitiesExtracted)
            .await?;

        let contract = self.registry.record_stage(contract_id, IngestionStage::Ready).await?;
        info!(
            contract_id,
            entity_count = entities.len(),
            stage = %IngestionStage::Ready,
            "ingestion complete"
        );

        Ok(IngestionReport {
            contract,
            entities,
            chunk_count: chunks.len(),
            oversized_segments,
        })
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<EmbeddingRecord>, IngestError> {
        let policy = RetryPolicy::for_embedding(&self.settings.retry);
        let batch_size = self.settings.providers.embedding_batch_size.max(1);
        let descriptor = self.embedding.descriptor();
        let mut records = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = policy
                .run("embed_chunks", || self.embedding.embed(&texts))
                .await
                .and_then(|vectors| check_embeddings(descriptor, texts.len(), vectors))
                .map_err(|error| IngestError::EmbeddingUnavailable(error.to_string()))?;

            records.extend(
                batch
                    .iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| EmbeddingRecord::from_chunk(chunk, vector)),
            );
        }

        Ok(records)
    }

    pub async fn ask(&self, contract_id: &str, question: &str) -> Result<QaAnswer, QueryError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(QueryError::InvalidArgument("question is empty".to_string()));
        }
        validate_contract_id(contract_id)?;

        let contract = self.registry.get(contract_id).await.map_err(not_found)?;
        if !contract.is_ready() {
            return Err(QueryError::ContractNotReady(contract_id.to_string()));
        }

        if self.settings.retrieval.entity_routing {
            if let Some(kind) = entity_question_kind(question) {
                let entities = self.registry.entities(contract_id).await.map_err(not_found)?;
                debug!(contract_id, %kind, "question answered from stored entities");
                return Ok(entity_answer(contract_id, question, kind, &entities));
            }
        }

        let active = self.embedding.descriptor();
        let indexed = self
            .index
            .descriptor(contract_id)
            .await?
            .ok_or_else(|| QueryError::ContractNotReady(contract_id.to_string()))?;
        if !indexed.is_compatible_with(active) {
            return Err(QueryError::ProviderMismatch {
                indexed: indexed.to_string(),
                active: active.to_string(),
            });
        }

        let question_texts = vec![question.to_string()];
        let vector = RetryPolicy::for_embedding(&self.settings.retry)
            .run("embed_question", || self.embedding.embed(&question_texts))
            .await
            .and_then(|vectors| check_embeddings(active, 1, vectors))
            .map_err(|error| QueryError::EmbeddingUnavailable(error.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::EmbeddingUnavailable("no vector for question".to_string()))?;

        let retrieval = self.settings.retrieval;
        let hits: Vec<ScoredChunk> = self
            .index
            .query(contract_id, &vector, retrieval.top_k.max(1))
            .await?
            .into_iter()
            .filter(|hit| hit.score >= retrieval.min_similarity)
            .collect();

        if hits.is_empty() {
            info!(contract_id, min_similarity = retrieval.min_similarity, "no grounding above similarity floor");
            return Ok(QaAnswer {
                answer_id: Uuid::new_v4(),
                contract_id: contract_id.to_string(),
                question: question.to_string(),
                answer: INSUFFICIENT_GROUNDING.to_string(),
                grounded: false,
                citations: Vec::new(),
                usage: None,
            });
        }

        let citations: Vec<Citation> = hits.into_iter().map(Citation::from).collect();
        let (prompt, context) = answer_prompt(question, &citations);
        let generation = RetryPolicy::for_generation(&self.settings.retry)
            .run("generate_answer", || self.generation.generate(&prompt, &context))
            .await
            .map_err(|error| match error {
                ProviderError::Timeout(_) => QueryError::GenerationTimeout(error.to_string()),
                other => QueryError::GenerationUnavailable(other.to_string()),
            })?;

        info!(contract_id, citations = citations.len(), "question answered");
        Ok(QaAnswer {
            answer_id: Uuid::new_v4(),
            contract_id: contract_id.to_string(),
            question: question.to_string(),
            answer: generation.text.trim().to_string(),
            grounded: true,
            citations,
            usage: generation.usage,
        })
    }

    pub async fn list_contracts(&self) -> Vec<Contract> {
        self.registry.list().await
    }

    pub async fn contract(&self, contract_id: &str) -> Result<Contract, QueryError> {
        self.registry.get(contract_id).await.map_err(not_found)
    }

    pub async fn contract_entities(&self, contract_id: &str) -> Result<Vec<Entity>, QueryError> {
        self.registry.entities(contract_id).await.map_err(not_found)
    }

    /// Deletes a contract's vectors and registry entry.
    pub async fn remove_contract(&self, contract_id: &str) -> Result<Contract, IngestError> {
        validate_contract_id(contract_id)?;
        let _guard = self.begin_ingestion(contract_id)?;
        if !self.registry.exists(contract_id).await {
            return Err(StoreError::NotFound(contract_id.to_string()).into());
        }

        self.index.delete(contract_id).await?;
        let removed = self.registry.remove(contract_id).await?;
        info!(contract_id, "contract deleted");
        Ok(removed)
    }
}

fn not_found(error: StoreError) -> QueryError {
    match error {
        StoreError::NotFound(id) => QueryError::NotFound(id),
        other => QueryError::Store(other),
    }
}

/// Numbered excerpts with page markers, followed by the question.
fn answer_prompt(question: &str, citations: &[Citation]) -> (Prompt, Vec<ContextPassage>) {
    let context = citations
        .iter()
        .enumerate()
        .map(|(position, citation)| ContextPassage {
            marker: format!("[{}] ({})", position + 1, citation.page_label()),
            text: citation.excerpt.clone(),
        })
        .collect();

    let prompt = Prompt {
        system: ANSWER_SYSTEM.to_string(),
        instruction: format!("Question: {question}"),
    };
    (prompt, context)
}

fn entity_question_kind(question: &str) -> Option<EntityKind> {
    let lowered = question.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let asks = |terms: &[&str]| words.iter().any(|word| terms.contains(word));

    if asks(&["who", "party", "parties"]) {
        Some(EntityKind::Party)
    } else if asks(&["when", "date", "dates"]) {
        Some(EntityKind::Date)
    } else {
        None
    }
}

fn entity_answer(contract_id: &str, question: &str, kind: EntityKind, entities: &[Entity]) -> QaAnswer {
    let matching: Vec<&Entity> = entities.iter().filter(|entity| entity.kind == kind).collect();
    let label = match kind {
        EntityKind::Party => "parties",
        EntityKind::Date => "dates",
        EntityKind::MonetaryValue => "monetary values",
    };

    let (answer, grounded) = if matching.is_empty() {
        (format!("No {label} were identified in this contract."), false)
    } else {
        let listed = matching
            .iter()
            .map(|entity| match &entity.normalized {
                Some(normalized) if *normalized != entity.text => {
                    format!("{} ({normalized})", entity.text)
                }
                _ => entity.text.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        (format!("The {label} identified in this contract are: {listed}."), true)
    };

    QaAnswer {
        answer_id: Uuid::new_v4(),
        contract_id: contract_id.to_string(),
        question: question.to_string(),
        answer,
        grounded,
        citations: Vec::new(),
        usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(chunk_index: usize, page_start: u32, page_end: u32, excerpt: &str) -> Citation {
        Citation {
            chunk_index,
            page_start,
            page_end,
            excerpt: excerpt.to_string(),
            score: 0.9,
        }
    }

    #[test]
    fn prompt_numbers_excerpts_with_page_markers() {
        let citations = vec![
            citation(3, 2, 2, "Confidential Information means"),
            citation(7, 2, 3, "The term of this Agreement"),
        ];
        let (prompt, context) = answer_prompt("How long does the agreement last?", &citations);

        assert_eq!(context[0].marker, "[1] (page 2)");
        assert_eq!(context[1].marker, "[2] (pages 2-3)");
        assert_eq!(context[1].text, "The term of this Agreement");
        assert_eq!(prompt.instruction, "Question: How long does the agreement last?");
        assert!(prompt.system.contains("only the numbered"));
    }

    #[test]
    fn entity_questions_are_recognised_by_whole_words() {
        assert_eq!(entity_question_kind("Who signed this?"), Some(EntityKind::Party));
        assert_eq!(entity_question_kind("List the parties"), Some(EntityKind::Party));
        assert_eq!(entity_question_kind("When does it expire?"), Some(EntityKind::Date));
        assert_eq!(entity_question_kind("Is the whole fee refundable?"), None);
        assert_eq!(entity_question_kind("What is the governing law?"), None);
    }

    #[test]
    fn entity_answers_list_normalized_values() {
        let entities = vec![
            Entity {
                kind: EntityKind::Date,
                text: "January 15, 2024".to_string(),
                normalized: Some("2024-01-15".to_string()),
            },
            Entity {
                kind: EntityKind::Party,
                text: "Acme Corp".to_string(),
                normalized: None,
            },
        ];

        let dates = entity_answer("c", "When?", EntityKind::Date, &entities);
        assert!(dates.grounded);
        assert_eq!(
            dates.answer,
            "The dates identified in this contract are: January 15, 2024 (2024-01-15)."
        );

        let money = entity_answer("c", "How much?", EntityKind::MonetaryValue, &entities);
        assert!(!money.grounded);
        assert_eq!(money.answer, "No monetary values were identified in this contract.");
    }
}
