use crate::config::{ExtractionStrategy, Limits, OcrSettings};
use crate::error::{IngestError, ProviderError};
use crate::models::PageText;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Average characters per page below which a document is probably a scan.
const SCANNED_PAGE_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub page_count: usize,
    pub pages: Vec<PageText>,
}

impl ExtractedDocument {
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn average_page_chars(&self) -> usize {
        let total: usize = self.pages.iter().map(|page| page.text.len()).sum();
        total / self.page_count.max(1)
    }

    fn looks_scanned(&self) -> bool {
        self.average_page_chars() < SCANNED_PAGE_CHARS
    }
}

pub trait PdfExtractor {
    fn extract_pages(&self, bytes: &[u8], max_pages: usize) -> Result<ExtractedDocument, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, bytes: &[u8], max_pages: usize) -> Result<ExtractedDocument, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::Extraction(error.to_string()))?;

        if document.trailer.get(b"Encrypt").is_ok() {
            return Err(IngestError::Extraction("pdf is encrypted".to_string()));
        }

        let page_numbers = document.get_pages();
        if page_numbers.len() > max_pages {
            return Err(IngestError::PageLimitExceeded {
                actual: page_numbers.len(),
                limit: max_pages,
            });
        }

        let mut pages = Vec::with_capacity(page_numbers.len());
        for (page_no, _page_id) in page_numbers.iter() {
            let raw = document
                .extract_text(&[*page_no])
                .map_err(|error| IngestError::Extraction(format!("page {page_no}: {error}")))?;

            let text = clean_page_text(&raw);
            if !text.is_empty() {
                pages.push(PageText {
                    number: *page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::Extraction(
                "pdf had no readable page text".to_string(),
            ));
        }

        Ok(ExtractedDocument {
            page_count: page_numbers.len(),
            pages,
        })
    }
}

#[derive(Debug, Serialize)]
struct OcrRequest {
    pdf_base64: String,
}

#[derive(Debug, Default, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    pages: Option<Vec<OcrPage>>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Sends the whole PDF to a multimodal OCR service and reads page text back.
///
/// The service answers either `{"pages": [{"page": 1, "text": ".."}]}` or a single
/// `{"text": ".."}` with pages separated by form feeds. Calls block, so this runs on
/// the blocking pool like the rest of extraction.
pub struct OcrExtractor {
    endpoint: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl OcrExtractor {
    /// `None` when no endpoint is configured.
    pub fn from_settings(settings: &OcrSettings) -> Result<Option<Self>, IngestError> {
        let Some(endpoint) = settings.endpoint.as_deref() else {
            return Ok(None);
        };
        let endpoint = Url::parse(endpoint)
            .map_err(|error| IngestError::InvalidArgument(format!("ocr endpoint {endpoint}: {error}")))?;
        Ok(Some(Self {
            endpoint,
            api_key: settings.api_key.clone(),
            timeout: settings.timeout,
        }))
    }

    fn request(&self, bytes: &[u8]) -> Result<OcrResponse, ProviderError> {
        let client = Client::builder().timeout(self.timeout).build()?;
        let mut request = client.post(self.endpoint.clone()).json(&OcrRequest {
            pdf_base64: STANDARD.encode(bytes),
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                code: status.as_u16(),
                details: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }
}

impl PdfExtractor for OcrExtractor {
    fn extract_pages(&self, bytes: &[u8], max_pages: usize) -> Result<ExtractedDocument, IngestError> {
        let response = self
            .request(bytes)
            .map_err(|error| IngestError::Extraction(format!("ocr request to {}: {error}", self.endpoint)))?;
        let document = ocr_document(response)?;
        if document.page_count > max_pages {
            return Err(IngestError::PageLimitExceeded {
                actual: document.page_count,
                limit: max_pages,
            });
        }
        info!(
            page_count = document.page_count,
            text_pages = document.pages.len(),
            "pdf text recognized by ocr"
        );
        Ok(document)
    }
}

fn ocr_document(response: OcrResponse) -> Result<ExtractedDocument, IngestError> {
    let listed: Vec<(u32, String)> = match (response.pages, response.text) {
        (Some(pages), _) if pages.iter().any(|page| page.text.is_some()) => pages
            .into_iter()
            .enumerate()
            .filter_map(|(position, page)| {
                let number = page.page.unwrap_or(position as u32 + 1);
                page.text.map(|text| (number, text))
            })
            .collect(),
        (_, Some(text)) => text
            .split('\u{000C}')
            .enumerate()
            .map(|(position, text)| (position as u32 + 1, text.to_string()))
            .collect(),
        _ => Vec::new(),
    };

    let page_count = listed.iter().map(|(number, _)| *number as usize).max().unwrap_or(0);
    let mut pages: Vec<PageText> = listed
        .into_iter()
        .filter_map(|(number, raw)| {
            let text = clean_page_text(&raw);
            (!text.is_empty()).then_some(PageText { number, text })
        })
        .collect();
    pages.sort_by_key(|page| page.number);

    if pages.is_empty() {
        return Err(IngestError::Extraction(
            "ocr response had no readable page text".to_string(),
        ));
    }
    Ok(ExtractedDocument { page_count, pages })
}

/// Size- and page-bounded front door for turning untrusted PDF bytes into page text.
pub struct TextExtractor<E = LopdfExtractor> {
    limits: Limits,
    inner: E,
    ocr: Option<Box<dyn PdfExtractor + Send + Sync>>,
    strategy: ExtractionStrategy,
}

impl TextExtractor<LopdfExtractor> {
    pub fn new(limits: &Limits) -> Self {
        Self::with_extractor(limits, LopdfExtractor)
    }
}

impl<E: PdfExtractor> TextExtractor<E> {
    pub fn with_extractor(limits: &Limits, inner: E) -> Self {
        Self {
            limits: *limits,
            inner,
            ocr: None,
            strategy: ExtractionStrategy::TextOnly,
        }
    }

    /// Adds an OCR extractor used according to `strategy`.
    pub fn with_ocr<O>(mut self, ocr: O, strategy: ExtractionStrategy) -> Self
    where
        O: PdfExtractor + Send + Sync + 'static,
    {
        self.ocr = Some(Box::new(ocr));
        self.strategy = strategy;
        self
    }

    /// Rejects oversized input before any parsing happens.
    pub fn check_size(&self, bytes: &[u8]) -> Result<(), IngestError> {
        if bytes.len() > self.limits.max_pdf_bytes {
            return Err(IngestError::SizeExceeded {
                actual: bytes.len(),
                limit: self.limits.max_pdf_bytes,
            });
        }
        Ok(())
    }

    pub fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, IngestError> {
        self.check_size(bytes)?;
        let max_pages = self.limits.max_pages;
        let document = match (&self.ocr, self.strategy) {
            (Some(ocr), ExtractionStrategy::ForceOcr) => ocr.extract_pages(bytes, max_pages)?,
            (Some(ocr), ExtractionStrategy::Auto) => self.extract_with_fallback(bytes, ocr.as_ref())?,
            (None, ExtractionStrategy::ForceOcr) => {
                return Err(IngestError::Extraction(
                    "ocr extraction requested but no ocr service is configured".to_string(),
                ))
            }
            _ => {
                let document = self.inner.extract_pages(bytes, max_pages)?;
                if document.looks_scanned() {
                    warn!(
                        page_count = document.page_count,
                        average_chars = document.average_page_chars(),
                        "little text per page, document may be scanned"
                    );
                }
                document
            }
        };

        debug!(
            page_count = document.page_count,
            text_pages = document.pages.len(),
            "pdf text extracted"
        );
        Ok(document)
    }

    /// Text layer first. Unreadable or thin text goes to OCR; limits never do.
    fn extract_with_fallback(
        &self,
        bytes: &[u8],
        ocr: &(dyn PdfExtractor + Send + Sync),
    ) -> Result<ExtractedDocument, IngestError> {
        let max_pages = self.limits.max_pages;
        match self.inner.extract_pages(bytes, max_pages) {
            Ok(document) if !document.looks_scanned() => Ok(document),
            Ok(document) => {
                warn!(
                    page_count = document.page_count,
                    average_chars = document.average_page_chars(),
                    "little text per page, falling back to ocr"
                );
                match ocr.extract_pages(bytes, max_pages) {
                    Ok(recognized) if recognized.average_page_chars() > document.average_page_chars() => {
                        Ok(recognized)
                    }
                    Ok(_) => Ok(document),
                    Err(error @ IngestError::PageLimitExceeded { .. }) => Err(error),
                    Err(error) => {
                        warn!(%error, "ocr fallback failed, keeping the text layer");
                        Ok(document)
                    }
                }
            }
            Err(IngestError::Extraction(reason)) => {
                warn!(%reason, "text layer unreadable, falling back to ocr");
                ocr.extract_pages(bytes, max_pages).map_err(|error| match error {
                    IngestError::Extraction(ocr_reason) => {
                        IngestError::Extraction(format!("{reason}; ocr fallback failed: {ocr_reason}"))
                    }
                    other => other,
                })
            }
            Err(other) => Err(other),
        }
    }
}

/// Rejoins words hyphenated across line breaks and collapses whitespace inside each line.
pub fn clean_page_text(raw: &str) -> String {
    let mut joined = String::with_capacity(raw.len());
    let mut lines = raw.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();
        let continues = lines
            .peek()
            .is_some_and(|next| next.starts_with(char::is_alphanumeric));
        match trimmed.strip_suffix('-') {
            Some(stem) if continues && stem.ends_with(char::is_alphanumeric) => joined.push_str(stem),
            _ => {
                joined.push_str(line);
                joined.push('\n');
            }
        }
    }

    joined
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
