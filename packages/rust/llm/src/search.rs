//! Tavily web search client.

use std::time::Duration;

use async_trait::async_trait;
use pedia_shared::{AppConfig, PediaError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{SearchHit, WebSearch, api_key_from_env, normalize_base_url};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw-content fallback is truncated to this many characters.
const MAX_RAW_CONTENT_CHARS: usize = 1000;

#[derive(Serialize)]
struct WireRequest<'a> {
    query: &'a str,
    max_results: u32,
    search_depth: &'static str,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    results: Vec<WireResult>,
}

#[derive(Deserialize)]
struct WireResult {
    title: String,
    url: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    raw_content: Option<String>,
    #[serde(default)]
    score: f64,
}

pub struct TavilyClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl TavilyClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|e| PediaError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            api_key: api_key.into(),
        })
    }

    /// Build from the `[search]` section. Returns `Ok(None)` when no key is
    /// set, in which case generation runs without web sources.
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>> {
        let section = &config.search;
        match api_key_from_env(&section.api_key_env) {
            Some(key) => Ok(Some(Self::new(&section.base_url, key)?)),
            None => {
                warn!(
                    env = %section.api_key_env,
                    "search API key not set, articles will be generated without web sources"
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>> {
        let url = format!("{}/search", self.base_url);
        debug!(query, max_results, "web search");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&WireRequest {
                query,
                max_results,
                search_depth: "basic",
                include_answer: false,
                include_raw_content: true,
            })
            .send()
            .await
            .map_err(|e| PediaError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PediaError::Network(format!(
                "search failed: HTTP {status}"
            )));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| PediaError::parse(format!("search response: {e}")))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| {
                let content = match r.content.filter(|c| !c.is_empty()) {
                    Some(c) => c,
                    None => r
                        .raw_content
                        .unwrap_or_default()
                        .chars()
                        .take(MAX_RAW_CONTENT_CHARS)
                        .collect(),
                };
                SearchHit {
                    title: r.title,
                    url: r.url,
                    content,
                    score: r.score,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn search_maps_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(serde_json::json!({
                "query": "Paris",
                "max_results": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "query": "Paris",
                "results": [
                    { "title": "Paris", "url": "https://a.example/paris", "content": "Capital of France.", "score": 0.9 },
                    { "title": "Paris (raw)", "url": "https://b.example/paris", "raw_content": "Raw page text.", "score": 0.5 }
                ]
            })))
            .mount(&server)
            .await;

        let client = TavilyClient::new(&server.uri(), "tvly-test").unwrap();
        let hits = client.search("Paris", 2).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "Capital of France.");
        assert_eq!(hits[1].content, "Raw page text.");
        assert!((hits[0].score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn search_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TavilyClient::new(&server.uri(), "tvly-test").unwrap();
        assert!(matches!(
            client.search("Paris", 5).await,
            Err(PediaError::Network(_))
        ));
    }

    #[test]
    fn missing_key_disables_search() {
        let mut config = AppConfig::default();
        config.search.api_key_env = "PEDIA_TEST_NO_SUCH_SEARCH_KEY".into();
        assert!(TavilyClient::from_config(&config).unwrap().is_none());
    }
}
