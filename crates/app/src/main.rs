use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use contract_qa_core::{
    build_providers, discover_pdf_files, ContractRegistry, ExtractionStrategy, FileVectorIndex,
    ProviderMode, QaOrchestrator, Settings,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "contract-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the contract registry and vector index
    #[arg(long, env = "CONTRACT_QA_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Which provider pair serves embeddings and generation
    #[arg(long, env = "CONTRACT_QA_PROVIDER", value_enum, default_value_t = Mode::Local)]
    provider: Mode,

    /// Local text-embeddings-inference base URL
    #[arg(long, env = "CONTRACT_QA_EMBEDDING_URL", default_value = "http://localhost:8504")]
    embedding_url: String,

    /// Local Ollama base URL
    #[arg(long, env = "CONTRACT_QA_GENERATION_URL", default_value = "http://localhost:11434")]
    generation_url: String,

    /// OpenAI-compatible API base URL for remote mode
    #[arg(long, env = "CONTRACT_QA_REMOTE_URL", default_value = "https://api.openai.com/v1/")]
    remote_url: String,

    /// API key for remote mode
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Embedding model override for the selected provider
    #[arg(long, env = "CONTRACT_QA_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Vector size of the embedding model override
    #[arg(long, env = "CONTRACT_QA_EMBEDDING_DIMENSIONS")]
    embedding_dimensions: Option<usize>,

    /// Input token limit of the embedding model override
    #[arg(long, env = "CONTRACT_QA_EMBEDDING_MAX_TOKENS")]
    embedding_max_tokens: Option<usize>,

    /// Generation model override for the selected provider
    #[arg(long, env = "CONTRACT_QA_GENERATION_MODEL")]
    generation_model: Option<String>,

    /// Largest accepted PDF, in MiB
    #[arg(long, env = "CONTRACT_QA_MAX_PDF_MB", default_value = "25")]
    max_pdf_mb: usize,

    /// Largest accepted page count
    #[arg(long, env = "CONTRACT_QA_MAX_PAGES", default_value = "100")]
    max_pages: usize,

    /// Fixed chunk size in tokens instead of a fraction of the model limit
    #[arg(long, env = "CONTRACT_QA_CHUNK_TOKENS")]
    chunk_tokens: Option<usize>,

    /// Fixed overlap in tokens instead of a fraction of the chunk size
    #[arg(long, env = "CONTRACT_QA_OVERLAP_TOKENS")]
    overlap_tokens: Option<usize>,

    /// Excerpts retrieved per question
    #[arg(long, env = "CONTRACT_QA_TOP_K", default_value = "4")]
    top_k: usize,

    /// Cosine similarity below which excerpts are not used as grounding
    #[arg(long, env = "CONTRACT_QA_MIN_SIMILARITY", default_value = "0.2")]
    min_similarity: f32,

    /// Answer party and date questions from extracted entities
    #[arg(long, env = "CONTRACT_QA_ENTITY_ROUTING", default_value_t = false)]
    entity_routing: bool,

    /// Per-request HTTP timeout in seconds
    #[arg(long, env = "CONTRACT_QA_REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Multimodal OCR endpoint for scanned or unparseable PDFs
    #[arg(long, env = "CONTRACT_QA_OCR_URL")]
    ocr_url: Option<String>,

    /// Bearer token for the OCR endpoint
    #[arg(long, env = "CONTRACT_QA_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    /// OCR request timeout in seconds
    #[arg(long, env = "CONTRACT_QA_OCR_TIMEOUT", default_value = "120")]
    ocr_timeout_secs: u64,

    /// How page text is obtained
    #[arg(long, env = "CONTRACT_QA_EXTRACTION", value_enum, default_value_t = Extraction::Auto)]
    extraction: Extraction,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Local,
    Remote,
}

#[derive(Clone, Copy, ValueEnum)]
enum Extraction {
    /// Text layer, with OCR for thin or unreadable text when an OCR endpoint is set
    Auto,
    Text,
    Ocr,
}

impl From<Extraction> for ExtractionStrategy {
    fn from(value: Extraction) -> Self {
        match value {
            Extraction::Auto => ExtractionStrategy::Auto,
            Extraction::Text => ExtractionStrategy::TextOnly,
            Extraction::Ocr => ExtractionStrategy::ForceOcr,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one contract PDF.
    Ingest {
        /// Path to the PDF.
        #[arg(long)]
        file: PathBuf,
        /// Reject the file if the same contract was ingested before.
        #[arg(long, default_value_t = false)]
        no_replace: bool,
    },
    /// Ingest every PDF under a folder, skipping files that fail.
    IngestFolder {
        /// Folder searched recursively.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Ask a question about one contract.
    Ask {
        /// Contract id as printed by `list`.
        #[arg(long)]
        contract: String,
        /// Question text.
        #[arg(long)]
        question: String,
    },
    /// List ingested contracts, newest first.
    List,
    /// Show one contract with its extracted entities.
    Show {
        #[arg(long)]
        contract: String,
    },
    /// Delete a contract and its vectors.
    Delete {
        #[arg(long)]
        contract: String,
    },
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.storage.data_dir = self.data_dir.clone();
        settings.limits.max_pdf_bytes = self.max_pdf_mb.saturating_mul(1024 * 1024);
        settings.limits.max_pages = self.max_pages;
        settings.chunking.chunk_tokens = self.chunk_tokens;
        settings.chunking.overlap_tokens = self.overlap_tokens;
        settings.retrieval.top_k = self.top_k;
        settings.retrieval.min_similarity = self.min_similarity;
        settings.retrieval.entity_routing = self.entity_routing;
        settings.providers.request_timeout = Duration::from_secs(self.request_timeout_secs);
        settings.ocr.endpoint = self.ocr_url.clone();
        settings.ocr.api_key = self.ocr_api_key.clone();
        settings.ocr.timeout = Duration::from_secs(self.ocr_timeout_secs);
        settings.ocr.strategy = self.extraction.into();

        let providers = &mut settings.providers;
        providers.local.embedding_url = self.embedding_url.clone();
        providers.local.generation_url = self.generation_url.clone();
        providers.remote.base_url = self.remote_url.clone();
        providers.remote.api_key = self.api_key.clone();

        match self.provider {
            Mode::Local => {
                providers.mode = ProviderMode::Local;
                let local = &mut providers.local;
                if let Some(model) = &self.embedding_model {
                    local.embedding_model = model.clone();
                }
                if let Some(dimensions) = self.embedding_dimensions {
                    local.embedding_dimensions = dimensions;
                }
                if let Some(max_tokens) = self.embedding_max_tokens {
                    local.embedding_max_input_tokens = max_tokens;
                }
                if let Some(model) = &self.generation_model {
                    local.generation_model = model.clone();
                }
            }
            Mode::Remote => {
                providers.mode = ProviderMode::Remote;
                let remote = &mut providers.remote;
                if let Some(model) = &self.embedding_model {
                    remote.embedding_model = model.clone();
                }
                if let Some(dimensions) = self.embedding_dimensions {
                    remote.embedding_dimensions = dimensions;
                }
                if let Some(max_tokens) = self.embedding_max_tokens {
                    remote.embedding_max_input_tokens = max_tokens;
                }
                if let Some(model) = &self.generation_model {
                    remote.generation_model = model.clone();
                }
            }
        }

        settings
    }
}

async fn ingest_file(
    orchestrator: &QaOrchestrator<FileVectorIndex>,
    path: &Path,
    replace_existing: bool,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(path).await?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let report = orchestrator.ingest(&filename, bytes, replace_existing).await?;
    let contract = &report.contract;
    println!(
        "{} ready: {} ({} pages, {} chunks, {} entities)",
        contract.contract_id,
        contract.original_filename,
        contract.page_count,
        report.chunk_count,
        report.entities.len()
    );
    if report.oversized_segments > 0 {
        println!("  oversized segments: {}", report.oversized_segments);
    }
    if let Some(reason) = &contract.entity_failure {
        println!("  entity extraction degraded: {reason}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %settings.storage.data_dir.display(),
        "contract-qa boot"
    );

    let providers = build_providers(&settings)?;
    let index = FileVectorIndex::open(settings.storage.index_dir()).await?;
    let registry = ContractRegistry::open(settings.storage.registry_dir()).await?;
    let orchestrator = QaOrchestrator::new(&settings, providers, index, registry)?;

    match cli.command {
        Command::Ingest { file, no_replace } => {
            ingest_file(&orchestrator, &file, !no_replace).await?;
        }
        Command::IngestFolder { folder } => {
            let files = discover_pdf_files(&folder);
            if files.is_empty() {
                anyhow::bail!("no pdf files found in {}", folder.display());
            }

            let mut skipped = 0usize;
            for path in &files {
                if let Err(error) = ingest_file(&orchestrator, path, true).await {
                    skipped += 1;
                    warn!(path = %path.display(), reason = %error, "skipped pdf");
                }
            }

            println!(
                "{} of {} pdf(s) ingested at {}",
                files.len() - skipped,
                files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Ask { contract, question } => {
            let answer = orchestrator.ask(&contract, &question).await?;

            println!("{}", answer.answer);
            if !answer.grounded {
                println!("(not grounded in retrieved excerpts)");
            }
            for (position, citation) in answer.citations.iter().enumerate() {
                println!(
                    "[{}] {} score={:.4} chunk={}",
                    position + 1,
                    citation.page_label(),
                    citation.score,
                    citation.chunk_index
                );
                println!("  {}", citation.excerpt);
            }
            if let Some(usage) = answer.usage {
                info!(
                    answer_id = %answer.answer_id,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "token usage"
                );
            }
        }
        Command::List => {
            let contracts = orchestrator.list_contracts().await;
            if contracts.is_empty() {
                println!("no contracts ingested");
            }
            for contract in contracts {
                println!(
                    "{} {:?} {} pages={} ingested_at={}",
                    contract.contract_id,
                    contract.status,
                    contract.original_filename,
                    contract.page_count,
                    contract.ingested_at.to_rfc3339()
                );
            }
        }
        Command::Show { contract } => {
            let record = orchestrator.contract(&contract).await?;
            println!("contract: {}", record.contract_id);
            println!("  file: {}", record.original_filename);
            println!("  pages: {}  size: {} bytes", record.page_count, record.size_bytes);
            println!("  status: {:?}  stage: {}", record.status, record.stage);
            if let Some(failure) = &record.failure {
                println!(
                    "  failed after {}: {} ({})",
                    failure.last_completed,
                    failure.reason,
                    failure.failed_at.to_rfc3339()
                );
            }

            for entity in orchestrator.contract_entities(&contract).await? {
                match &entity.normalized {
                    Some(normalized) => println!("  {}: {} [{}]", entity.kind, entity.text, normalized),
                    None => println!("  {}: {}", entity.kind, entity.text),
                }
            }
        }
        Command::Delete { contract } => {
            let removed = orchestrator.remove_contract(&contract).await?;
            println!("deleted {} ({})", removed.contract_id, removed.original_filename);
        }
    }

    Ok(())
}
