#![allow(dead_code)]

use async_trait::async_trait;
use contract_qa_core::{
    ContextPassage, ContractRegistry, EmbeddingProvider, FileVectorIndex, Generation,
    GenerationProvider, ProviderDescriptor, ProviderError, ProviderMode, ProviderPair, Prompt,
    QaOrchestrator, Settings, TokenUsage,
};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const NDA_PAGES: [&str; 3] = [
    "MUTUAL NON-DISCLOSURE AGREEMENT. This Agreement is entered into on January 15, 2024 \
     between Acme Corp and Beta Industries LLC. The parties wish to exchange confidential \
     information about a potential business relationship.",
    "Confidential information means any technical or business information disclosed by either \
     party. The receiving party shall protect confidential information with reasonable care and \
     shall not disclose it to any third party.",
    "The receiving party shall return all confidential materials within thirty days of a written \
     request. This Agreement remains in effect until January 15, 2026. Signed by the authorized \
     representatives of each party.",
];

pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 10.into()]),
                Operation::new("Td", vec![36.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

pub fn nda_pdf() -> Vec<u8> {
    pdf_with_pages(&NDA_PAGES)
}

const VOCABULARY: [&str; 16] = [
    "confidential",
    "information",
    "party",
    "parties",
    "receiving",
    "disclose",
    "materials",
    "return",
    "agreement",
    "business",
    "technical",
    "care",
    "request",
    "representatives",
    "signed",
    "effect",
];

/// Bag-of-words embedder over a fixed contract vocabulary; unknown words embed to nothing.
pub struct VocabularyEmbedder {
    descriptor: ProviderDescriptor,
    pub calls: AtomicUsize,
    fail: bool,
    stall: bool,
}

impl VocabularyEmbedder {
    pub fn new(model: &str) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                mode: ProviderMode::Local,
                model: model.to_string(),
                dimensions: VOCABULARY.len(),
                max_input_tokens: 64,
            },
            calls: AtomicUsize::new(0),
            fail: false,
            stall: false,
        }
    }

    pub fn unreachable(model: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(model)
        }
    }

    /// Accepts calls but never answers within any test deadline.
    pub fn stalled(model: &str) -> Self {
        Self {
            stall: true,
            ..Self::new(model)
        }
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; VOCABULARY.len()];
        for word in text
            .to_lowercase()
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            if let Some(position) = VOCABULARY.iter().position(|known| *known == word) {
                vector[position] += 1.0;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        if self.stall {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(texts.iter().map(|text| Self::embed_one(text)).collect())
    }
}

/// How the scripted generator treats question prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    Reply,
    /// Never answers within any test deadline.
    Stall,
    /// Fails every call with a connection error.
    Refuse,
}

/// Answers extraction prompts with fixed JSON and questions by quoting the first marker.
pub struct ScriptedGenerator {
    pub answers: AtomicUsize,
    pub entity_reply: Option<String>,
    pub answer_mode: AnswerMode,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            answers: AtomicUsize::new(0),
            entity_reply: Some(
                r#"{"parties": ["Acme Corp", "Beta Industries LLC"], "dates": ["January 15, 2024"], "monetary_values": []}"#
                    .to_string(),
            ),
            answer_mode: AnswerMode::Reply,
        }
    }

    pub fn answering(answer_mode: AnswerMode) -> Self {
        Self {
            answer_mode,
            ..Self::new()
        }
    }

    /// Rejects extraction prompts so the pattern fallback runs.
    pub fn without_entities() -> Self {
        Self {
            entity_reply: None,
            ..Self::new()
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _prompt: &Prompt,
        context: &[ContextPassage],
    ) -> Result<Generation, ProviderError> {
        if context.is_empty() {
            return match &self.entity_reply {
                Some(reply) => Ok(Generation {
                    text: reply.clone(),
                    usage: None,
                }),
                None => Err(ProviderError::Status {
                    code: 404,
                    details: "model not found".to_string(),
                }),
            };
        }

        self.answers.fetch_add(1, Ordering::SeqCst);
        match self.answer_mode {
            AnswerMode::Reply => {}
            AnswerMode::Stall => {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            AnswerMode::Refuse => {
                return Err(ProviderError::Transport("connection refused".to_string()));
            }
        }
        Ok(Generation {
            text: format!("The receiving party must use reasonable care {}", context[0].marker),
            usage: Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 12,
            }),
        })
    }
}

pub fn test_settings(data_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.storage.data_dir = data_dir.to_path_buf();
    settings.retry.max_attempts = 2;
    settings.retry.initial_backoff = Duration::from_millis(1);
    settings.retry.max_backoff = Duration::from_millis(2);
    settings.retry.embedding_deadline = Duration::from_secs(5);
    settings.retry.generation_deadline = Duration::from_secs(5);
    settings
}

pub fn providers(
    embedding: Arc<dyn EmbeddingProvider>,
    generation: Arc<dyn GenerationProvider>,
) -> ProviderPair {
    ProviderPair {
        embedding,
        generation,
    }
}

pub async fn open_orchestrator(
    settings: &Settings,
    pair: ProviderPair,
) -> QaOrchestrator<FileVectorIndex> {
    let index = FileVectorIndex::open(settings.storage.index_dir()).await.unwrap();
    let registry = ContractRegistry::open(settings.storage.registry_dir()).await.unwrap();
    QaOrchestrator::new(settings, pair, index, registry).unwrap()
}
