//! HTTP clients for article generation: a chat-completions model and a web
//! search provider, each behind an async trait so the pipeline can be driven
//! by fakes in tests.

mod openrouter;
mod search;

use async_trait::async_trait;
use pedia_shared::{PediaError, Result};
use serde::{Deserialize, Serialize};

pub use openrouter::OpenRouterClient;
pub use search::TavilyClient;

/// One prompt for a chat model: a system instruction and a single user turn.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens,
        }
    }
}

/// A text-completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, for logging.
    fn model(&self) -> &str;

    /// Run one completion and return the assistant text.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// A single web search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: f64,
}

/// A web search backend.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>>;
}

/// Read an API key from the named env var.
pub(crate) fn api_key_from_env(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

/// Validate a configured base URL and strip any trailing slash.
pub(crate) fn normalize_base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| PediaError::config(format!("invalid base URL {raw:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PediaError::config(format!(
            "base URL must be http(s), got {raw:?}"
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_validated() {
        assert_eq!(
            normalize_base_url("https://openrouter.ai/api/v1/").unwrap(),
            "https://openrouter.ai/api/v1"
        );
        assert!(normalize_base_url("not a url").is_err());
        assert!(normalize_base_url("ftp://example.com").is_err());
    }
}
