//! Best-effort extraction of parties, dates and monetary values.
//!
//! The generation provider is asked for a JSON object first. When no provider is
//! reachable the deterministic pattern matcher takes over. Output that cannot be
//! parsed degrades to an empty list with a reason; it never fails ingestion.

use crate::config::Settings;
use crate::generation::{GenerationProvider, Prompt};
use crate::models::{Entity, EntityKind, EntitySource};
use crate::retry::RetryPolicy;
use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|October|November|December|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sept|Sep|Oct|Nov|Dec";
const AMOUNT: &str = r"(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{1,2})?";
const MAX_PARTY_CHARS: usize = 80;

const EXTRACTION_SYSTEM: &str =
    "You extract structured data from legal contracts. Reply with a single JSON object and nothing else.";

#[derive(Debug, Clone, PartialEq)]
pub enum EntityExtraction {
    Extracted {
        entities: Vec<Entity>,
        source: EntitySource,
    },
    /// Extraction ran but produced nothing usable; ingestion carries on without entities.
    Degraded { reason: String },
}

impl EntityExtraction {
    pub fn entities(&self) -> &[Entity] {
        match self {
            EntityExtraction::Extracted { entities, .. } => entities,
            EntityExtraction::Degraded { .. } => &[],
        }
    }

    pub fn into_parts(self) -> (Vec<Entity>, Option<EntitySource>, Option<String>) {
        match self {
            EntityExtraction::Extracted { entities, source } => (entities, Some(source), None),
            EntityExtraction::Degraded { reason } => (Vec::new(), None, Some(reason)),
        }
    }
}

pub struct EntityExtractor {
    generation: Option<Arc<dyn GenerationProvider>>,
    patterns: EntityPatterns,
    retry: RetryPolicy,
    max_text_chars: usize,
}

impl EntityExtractor {
    pub fn new(
        settings: &Settings,
        generation: Option<Arc<dyn GenerationProvider>>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            generation: generation.filter(|_| settings.entities.use_generation),
            patterns: EntityPatterns::new()?,
            retry: RetryPolicy::for_generation(&settings.retry),
            max_text_chars: settings.entities.max_text_chars,
        })
    }

    pub fn patterns(&self) -> &EntityPatterns {
        &self.patterns
    }

    pub async fn extract(&self, full_text: &str) -> EntityExtraction {
        let text = truncate_chars(full_text, self.max_text_chars);

        let Some(generation) = &self.generation else {
            return self.from_patterns(text);
        };

        let prompt = extraction_prompt(text);
        let result = self
            .retry
            .run("extract_entities", || generation.generate(&prompt, &[]))
            .await;

        match result {
            Ok(output) => match parse_model_entities(&output.text) {
                Ok(entities) => {
                    debug!(count = entities.len(), "entities extracted by generation provider");
                    EntityExtraction::Extracted {
                        entities,
                        source: EntitySource::Generation,
                    }
                }
                Err(reason) => {
                    warn!(%reason, "entity extraction output unusable");
                    EntityExtraction::Degraded { reason }
                }
            },
            Err(error) => {
                warn!(%error, "generation provider unreachable, using pattern extraction");
                self.from_patterns(text)
            }
        }
    }

    fn from_patterns(&self, text: &str) -> EntityExtraction {
        let entities = self.patterns.extract(text);
        debug!(count = entities.len(), "entities extracted by patterns");
        EntityExtraction::Extracted {
            entities,
            source: EntitySource::Pattern,
        }
    }
}

fn extraction_prompt(text: &str) -> Prompt {
    Prompt {
        system: EXTRACTION_SYSTEM.to_string(),
        instruction: format!(
            "List every contracting party, every date and every monetary amount in the contract below.\n\
             Respond with JSON of the form {{\"parties\": [], \"dates\": [], \"monetary_values\": []}} \
             where each list holds strings copied verbatim from the text.\n\nContract:\n{text}"
        ),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModelEntities {
    #[serde(default)]
    parties: Vec<Value>,
    #[serde(default)]
    dates: Vec<Value>,
    #[serde(default)]
    monetary_values: Vec<Value>,
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(map) => ["text", "name", "value", "date", "amount"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))?,
        _ => return None,
    };
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Reads the JSON object between the first `{` and the last `}` of a model reply.
pub fn parse_model_entities(output: &str) -> Result<Vec<Entity>, String> {
    let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) else {
        return Err("no JSON object in model output".to_string());
    };
    if end < start {
        return Err("no JSON object in model output".to_string());
    }

    let parsed: ModelEntities = serde_json::from_str(&output[start..=end])
        .map_err(|error| format!("malformed entity JSON: {error}"))?;

    let parties = parsed.parties.iter().filter_map(value_text).map(|text| Entity {
        kind: EntityKind::Party,
        text,
        normalized: None,
    });
    let dates = parsed.dates.iter().filter_map(value_text).map(|text| Entity {
        kind: EntityKind::Date,
        normalized: normalize_date(&text),
        text,
    });
    let money = parsed
        .monetary_values
        .iter()
        .filter_map(value_text)
        .map(|text| Entity {
            kind: EntityKind::MonetaryValue,
            normalized: normalize_money(&text),
            text,
        });

    Ok(dedup_entities(parties.chain(dates).chain(money)))
}

/// Keeps the first occurrence of each (kind, surface text) pair.
pub fn dedup_entities(entities: impl IntoIterator<Item = Entity>) -> Vec<Entity> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|entity| seen.insert((entity.kind, entity.text.clone())))
        .collect()
}

/// Parses common contract date spellings into `YYYY-MM-DD`.
pub fn normalize_date(surface: &str) -> Option<String> {
    let cleaned: Vec<String> = surface
        .replace(',', " ")
        .split_whitespace()
        .filter(|token| !token.eq_ignore_ascii_case("day") && !token.eq_ignore_ascii_case("of"))
        .map(|token| {
            let numeric = token.starts_with(|ch: char| ch.is_ascii_digit());
            if numeric && !token.contains(|ch: char| ch == '/' || ch == '-') {
                token.trim_end_matches(|ch: char| ch.is_ascii_alphabetic()).to_string()
            } else {
                token.trim_end_matches('.').to_string()
            }
        })
        .collect();
    let cleaned = cleaned.join(" ");

    ["%B %d %Y", "%d %B %Y", "%Y-%m-%d", "%m/%d/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&cleaned, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Renders an amount as `<CUR> <amount>` with thousands separators removed.
pub fn normalize_money(surface: &str) -> Option<String> {
    let lowered = surface.to_lowercase();
    let currency = if surface.contains('$') || lowered.contains("usd") || lowered.contains("dollar") {
        "USD"
    } else if surface.contains('€') || lowered.contains("eur") {
        "EUR"
    } else if surface.contains('£') || lowered.contains("gbp") || lowered.contains("pound") {
        "GBP"
    } else {
        return None;
    };

    let start = surface.find(|ch: char| ch.is_ascii_digit())?;
    let amount: String = surface[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == ',' || *ch == '.')
        .filter(|ch| *ch != ',')
        .collect();
    let amount = amount.trim_end_matches('.');

    Some(format!("{currency} {amount}"))
}

/// Compiled patterns for the deterministic fallback.
pub struct EntityPatterns {
    dates: Vec<Regex>,
    money: Vec<Regex>,
    corporate_party: Regex,
    between_parties: Regex,
}

impl EntityPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            dates: vec![
                Regex::new(&format!(
                    r"\b(?:{MONTHS})\.?\s+\d{{1,2}}(?:st|nd|rd|th)?,?\s+\d{{4}}\b"
                ))?,
                Regex::new(&format!(
                    r"\b\d{{1,2}}(?:st|nd|rd|th)?\s+(?:day\s+of\s+)?(?:{MONTHS})\.?,?\s+\d{{4}}\b"
                ))?,
                Regex::new(r"\b\d{4}-\d{2}-\d{2}\b")?,
                Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b")?,
            ],
            money: vec![
                Regex::new(&format!(r"[$€£]\s?{AMOUNT}"))?,
                Regex::new(&format!(r"\b(?:USD|EUR|GBP)\s?{AMOUNT}"))?,
                Regex::new(&format!(
                    r"\b{AMOUNT}\s*(?i:usd|eur|gbp|dollars?|euros?|pounds?)\b"
                ))?,
            ],
            corporate_party: Regex::new(
                r"\b(?:[A-Z][\w&'\-]*\s+){0,4}[A-Z][\w&'\-]*,?\s+(?:Inc|LLC|Ltd|Limited|Corp|Corporation|Company|GmbH|LLP|PLC|AG)\b",
            )?,
            between_parties: Regex::new(
                r"(?i:between)\s+([A-Z][\w&.,'\- ]{1,80}?)\s*(?:\([^)]*\)\s*)?,?\s+and\s+([A-Z][\w&.'\- ]{1,80}?)\s*(?:\(|[,;\n]|\.(?:\s|$)|$)",
            )?,
        })
    }

    /// Parties, then dates, then monetary values, each in document order.
    pub fn extract(&self, text: &str) -> Vec<Entity> {
        let mut parties: Vec<(usize, String)> = self
            .corporate_party
            .find_iter(text)
            .map(|found| (found.start(), found.as_str().to_string()))
            .collect();
        for captures in self.between_parties.captures_iter(text) {
            for group in [captures.get(1), captures.get(2)].into_iter().flatten() {
                let name = group.as_str().trim().trim_end_matches(',').trim();
                if name.len() >= 2 && name.chars().count() <= MAX_PARTY_CHARS {
                    parties.push((group.start(), name.to_string()));
                }
            }
        }
        parties.sort_by_key(|(start, _)| *start);

        let parties = parties.into_iter().map(|(_, text)| Entity {
            kind: EntityKind::Party,
            text: text.split_whitespace().collect::<Vec<_>>().join(" "),
            normalized: None,
        });
        let dates = non_overlapping(&self.dates, text).into_iter().map(|surface| Entity {
            kind: EntityKind::Date,
            normalized: normalize_date(surface),
            text: surface.to_string(),
        });
        let money = non_overlapping(&self.money, text).into_iter().map(|surface| Entity {
            kind: EntityKind::MonetaryValue,
            normalized: normalize_money(surface),
            text: surface.to_string(),
        });

        dedup_entities(parties.chain(dates).chain(money))
    }
}

/// Matches of all patterns in document order; earlier patterns win overlapping spans.
fn non_overlapping<'t>(patterns: &[Regex], text: &'t str) -> Vec<&'t str> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for pattern in patterns {
        for found in pattern.find_iter(text) {
            let overlaps = spans
                .iter()
                .any(|(start, end)| found.start() < *end && *start < found.end());
            if !overlaps {
                spans.push((found.start(), found.end()));
            }
        }
    }
    spans.sort_unstable();
    spans.into_iter().map(|(start, end)| &text[start..end]).collect()
}
