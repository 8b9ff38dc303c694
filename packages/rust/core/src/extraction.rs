//! Named-entity extraction from generated article text.
//!
//! The primary extractor asks a chat model for a JSON array of entities. If
//! that fails for any reason, [`extract_wiki_links`] scans the text for
//! `[[Entity]]` markers so the pipeline always has something to link.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pedia_llm::{ChatModel, ChatRequest};
use pedia_shared::{EntityType, ExtractedEntity, PediaError, PipelinePolicy, Result, normalize_name};

/// Cap applied by the wiki-link fallback.
pub const FALLBACK_MAX_ENTITIES: usize = 15;

/// Relevance assigned when the model omits one.
const DEFAULT_RELEVANCE: f64 = 0.5;

const EXTRACTION_MAX_TOKENS: u32 = 2048;

const EXTRACT_SYSTEM_PROMPT: &str = "You extract named entities from an encyclopedic text.

## ENTITY TYPES

- PERSON: people (proper names)
- ORGANIZATION: companies, institutions, groups
- LOCATION: geographic places
- EVENT: historical or current events
- CONCEPT: abstract concepts, theories
- WORK: works (books, films, etc.)
- OTHER: other important entities

## OUTPUT FORMAT

Return a JSON array:
[
  { \"name\": \"Entity name\", \"type\": \"TYPE\", \"relevance\": 0.9 }
]

## RULES

- Relevance between 0.1 and 1.0 (1.0 = central to the subject)
- At most 20 entities
- Normalize names (\"Elon Musk\", not \"Mr. Musk\")
- Ignore generic entities (\"thing\", \"person\")";

/// Which extractor produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Llm,
    WikiLinks,
}

/// A primary entity extractor.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, content: &str) -> Result<Vec<ExtractedEntity>>;
}

/// Extractor backed by a chat model.
pub struct LlmEntityExtractor {
    model: Arc<dyn ChatModel>,
}

impl LlmEntityExtractor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl EntityExtractor for LlmEntityExtractor {
    async fn extract(&self, content: &str) -> Result<Vec<ExtractedEntity>> {
        let request = ChatRequest::new(
            EXTRACT_SYSTEM_PROMPT,
            format!("Extract the named entities from the following text:\n\n{content}"),
            EXTRACTION_MAX_TOKENS,
        );
        let text = self.model.complete(&request).await?;
        parse_llm_entities(&text)
    }
}

/// Run the primary extractor, falling back to wiki links on any failure.
///
/// The result is deduplicated by normalized name, ranked by relevance and
/// capped. Never fails.
pub async fn extract_with_fallback(
    extractor: &dyn EntityExtractor,
    content: &str,
    policy: &PipelinePolicy,
) -> (Vec<ExtractedEntity>, ExtractionMethod) {
    match extractor.extract(content).await {
        Ok(entities) => {
            debug!(count = entities.len(), "model extraction succeeded");
            (
                rank_entities(entities, policy.max_extracted_entities),
                ExtractionMethod::Llm,
            )
        }
        Err(e) => {
            warn!(error = %e, "entity extraction failed, using wiki-link fallback");
            let entities =
                extract_wiki_links(content, FALLBACK_MAX_ENTITIES, policy.fallback_relevance);
            (entities, ExtractionMethod::WikiLinks)
        }
    }
}

/// Scan `content` for `[[Entity]]` markers.
///
/// Each distinct name (case-insensitive) becomes an OTHER entity with the
/// given relevance. Names must be 2..=99 characters.
pub fn extract_wiki_links(content: &str, max: usize, relevance: f64) -> Vec<ExtractedEntity> {
    static WIKI_LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("valid regex"));

    let mut seen = std::collections::HashSet::new();
    let mut entities = Vec::new();

    for cap in WIKI_LINK_RE.captures_iter(content) {
        if entities.len() >= max {
            break;
        }
        let name = cap[1].trim();
        let len = name.chars().count();
        if len <= 1 || len >= 100 {
            continue;
        }
        if seen.insert(normalize_name(name)) {
            entities.push(ExtractedEntity {
                name: name.to_string(),
                entity_type: EntityType::Other,
                relevance,
            });
        }
    }
    entities
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    entity_type: Option<String>,
    #[serde(default)]
    relevance: Option<f64>,
}

/// Parse the first JSON array found in a model response.
pub fn parse_llm_entities(text: &str) -> Result<Vec<ExtractedEntity>> {
    static ARRAY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[[\s\S]*\]").expect("valid regex"));

    let array = ARRAY_RE
        .find(text)
        .ok_or_else(|| PediaError::parse("no JSON array in extraction response"))?;

    let raw: Vec<RawEntity> = serde_json::from_str(array.as_str())
        .map_err(|e| PediaError::parse(format!("extraction response: {e}")))?;

    Ok(raw
        .into_iter()
        .filter(|e| !e.name.trim().is_empty())
        .map(|e| ExtractedEntity {
            name: e.name.trim().to_string(),
            entity_type: e
                .entity_type
                .as_deref()
                .map(EntityType::parse_lenient)
                .unwrap_or(EntityType::Other),
            relevance: match e.relevance {
                Some(r) if r.is_finite() => r.clamp(0.0, 1.0),
                _ => DEFAULT_RELEVANCE,
            },
        })
        .collect())
}

/// Deduplicate by normalized name (keeping the most relevant sighting),
/// sort by relevance descending and keep at most `max`.
pub fn rank_entities(entities: Vec<ExtractedEntity>, max: usize) -> Vec<ExtractedEntity> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ExtractedEntity> = Vec::with_capacity(entities.len());

    for entity in entities {
        let key = normalize_name(&entity.name);
        if key.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                if entity.relevance > unique[i].relevance {
                    unique[i] = entity;
                }
            }
            None => {
                index.insert(key, unique.len());
                unique.push(entity);
            }
        }
    }

    // Stable: ties keep extraction order.
    unique.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    unique.truncate(max);
    unique
}
