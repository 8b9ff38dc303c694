//! The article generation path: search → analyze → generate → extract.
//!
//! Shared by user-initiated generation and the enrichment stage; the only
//! difference between the two is the [`ProgressSink`] passed in.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument, warn};

use pedia_llm::{ChatModel, ChatRequest, SearchHit, WebSearch};
use pedia_shared::{
    ExtractedEntity, PediaError, PipelinePolicy, Result, Source, normalize_name, slugify,
};

use crate::extraction::{EntityExtractor, extract_with_fallback};
use crate::progress::{GenerationStep, ProgressSink};

const MIN_QUERY_CHARS: usize = 2;
const MAX_QUERY_CHARS: usize = 500;

const GENERATION_MAX_TOKENS: u32 = 4096;

/// Characters of each search hit quoted in the prompt.
const PROMPT_SNIPPET_CHARS: usize = 300;

/// Characters of each search hit kept as the stored source snippet.
const SOURCE_SNIPPET_CHARS: usize = 500;

/// Entities reported to the progress sink.
const REPORTED_ENTITIES: usize = 10;

const GENERATE_SYSTEM_PROMPT: &str = "You are a neutral, factual encyclopedia writer. You write Wikipedia-style articles.

## STRICT RULES

1. Absolute neutrality: no opinion, no bias. Prefer \"according to X\" over direct claims.
2. Cited sources: every important fact names its source.
3. Clear structure: Markdown with H2 and H3 headers.
4. Internal links: use the [[Entity]] notation to link to other encyclopedia pages.
5. Factual: no speculation, only verifiable facts.

## OUTPUT FORMAT

# {Title}

{2-3 sentence introduction summarizing the subject}

## History

## Characteristics

## Impact and influence

## See also

- [[Related entity 1]]
- [[Related entity 2]]

## INSTRUCTIONS

- At most 2000 words
- Use the web search results provided
- Create [[Entity]] links to the important concepts mentioned";

/// Output of one generation run, before persistence.
#[derive(Debug, Clone)]
pub struct GeneratedArticle {
    pub content: String,
    pub entities: Vec<ExtractedEntity>,
    pub sources: Vec<Source>,
}

/// Anything that can turn a query into an article.
#[async_trait]
pub trait ArticleGenerator: Send + Sync {
    async fn generate(&self, query: &str, progress: &dyn ProgressSink)
    -> Result<GeneratedArticle>;
}

/// Trim and bound-check a user query.
pub fn validate_query(query: &str) -> Result<&str> {
    let trimmed = query.trim();
    let len = trimmed.chars().count();
    if len == 0 {
        return Err(PediaError::validation("query cannot be empty"));
    }
    if len < MIN_QUERY_CHARS {
        return Err(PediaError::validation(format!(
            "query too short (min {MIN_QUERY_CHARS} characters)"
        )));
    }
    if len > MAX_QUERY_CHARS {
        return Err(PediaError::validation(format!(
            "query too long (max {MAX_QUERY_CHARS} characters)"
        )));
    }
    Ok(trimmed)
}

/// Slug of the article covering `name`. Enrichment and linking both derive
/// existence checks from this, so they always agree.
pub fn article_slug(name: &str) -> String {
    slugify(&normalize_name(name))
}

/// Validate a user query and derive its article slug, before any I/O.
pub fn query_slug(query: &str) -> Result<String> {
    let slug = article_slug(validate_query(query)?);
    if slug.is_empty() {
        return Err(PediaError::validation(
            "query has no letters or digits to build an article slug from",
        ));
    }
    Ok(slug)
}

/// Display title for an entity-named article: first character upper-cased.
pub fn entity_title(name: &str) -> String {
    let name = name.trim();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Title for a user-initiated article: the first H1 of the generated text,
/// else the query itself.
pub fn title_from_content(content: &str, query: &str) -> String {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| entity_title(query))
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Build the user turn of the generation prompt.
fn build_generation_prompt(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("Write a complete encyclopedic article about: \"{query}\"");
    }

    let sources = hits
        .iter()
        .enumerate()
        .map(|(i, h)| {
            format!(
                "{}. [{}]({}): {}...",
                i + 1,
                h.title,
                h.url,
                truncate_chars(&h.content, PROMPT_SNIPPET_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Write a complete encyclopedic article about: \"{query}\"\n\n## Available sources\n\n{sources}"
    )
}

/// The production generator: optional web search, a chat model and an
/// entity extractor.
pub struct Generator {
    model: Arc<dyn ChatModel>,
    search: Option<Arc<dyn WebSearch>>,
    extractor: Arc<dyn EntityExtractor>,
    policy: PipelinePolicy,
    max_search_results: u32,
}

impl Generator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        search: Option<Arc<dyn WebSearch>>,
        extractor: Arc<dyn EntityExtractor>,
        policy: PipelinePolicy,
        max_search_results: u32,
    ) -> Self {
        Self {
            model,
            search,
            extractor,
            policy,
            max_search_results,
        }
    }

    async fn search_step(&self, query: &str, progress: &dyn ProgressSink) -> Vec<SearchHit> {
        progress.step_start(GenerationStep::Search, "searching the web");

        let Some(search) = &self.search else {
            progress.step_complete(GenerationStep::Search);
            return Vec::new();
        };

        match search.search(query, self.max_search_results).await {
            Ok(hits) => {
                progress.step_complete(GenerationStep::Search);
                hits
            }
            Err(e) => {
                warn!(error = %e, "web search failed, generating without sources");
                progress.step_error(GenerationStep::Search, "web search failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ArticleGenerator for Generator {
    #[instrument(skip_all, fields(query = %query))]
    async fn generate(
        &self,
        query: &str,
        progress: &dyn ProgressSink,
    ) -> Result<GeneratedArticle> {
        let query = validate_query(query)?;

        // --- Search ---
        let hits = self.search_step(query, progress).await;

        // --- Analyze ---
        progress.step_start(GenerationStep::Analyze, "analyzing sources");
        let sources: Vec<Source> = hits
            .iter()
            .map(|h| Source {
                title: h.title.clone(),
                url: h.url.clone(),
                snippet: truncate_chars(&h.content, SOURCE_SNIPPET_CHARS),
            })
            .collect();
        let prompt = build_generation_prompt(query, &hits);
        progress.step_complete(GenerationStep::Analyze);

        // --- Generate ---
        progress.step_start(GenerationStep::Generate, "writing the article");
        let request = ChatRequest::new(GENERATE_SYSTEM_PROMPT, prompt, GENERATION_MAX_TOKENS);
        let content = match self.model.complete(&request).await {
            Ok(text) => text,
            Err(e) => {
                progress.step_error(GenerationStep::Generate, &e.to_string());
                return Err(PediaError::Generation(format!("{query}: {e}")));
            }
        };
        progress.content(&content);
        progress.step_complete(GenerationStep::Generate);

        // --- Extract ---
        progress.step_start(GenerationStep::Extract, "extracting entities");
        let (entities, method) =
            extract_with_fallback(self.extractor.as_ref(), &content, &self.policy).await;
        for entity in entities.iter().take(REPORTED_ENTITIES) {
            progress.entity_found(entity);
        }
        progress.step_complete(GenerationStep::Extract);

        info!(
            model = self.model.model(),
            sources = sources.len(),
            entities = entities.len(),
            ?method,
            chars = content.len(),
            "article generated"
        );

        Ok(GeneratedArticle {
            content,
            entities,
            sources,
        })
    }
}
