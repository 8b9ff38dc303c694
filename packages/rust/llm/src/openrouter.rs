//! OpenRouter-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use pedia_shared::{AppConfig, PediaError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ChatModel, ChatRequest, api_key_from_env, normalize_base_url};

const APP_TITLE: &str = "pedia";

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat client for any OpenAI-style `/chat/completions` endpoint.
pub struct OpenRouterClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PediaError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from the `[openrouter]` config section, reading the key from its env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let section = &config.openrouter;
        let api_key = api_key_from_env(&section.api_key_env).ok_or_else(|| {
            PediaError::config(format!(
                "OpenRouter API key not found. Set the {} environment variable.",
                section.api_key_env
            ))
        })?;

        Self::new(
            &section.base_url,
            api_key,
            section.default_model.clone(),
            Duration::from_secs(section.timeout_secs),
        )
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, max_tokens = request.max_tokens, "chat completion request");

        let body = WireRequest {
            model: &self.model,
            messages: [
                WireMessage {
                    role: "system",
                    content: &request.system,
                },
                WireMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", APP_TITLE)
            .json(&body)
            .send()
            .await
            .map_err(|e| PediaError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PediaError::Network(format!(
                "chat completion failed (HTTP {status}): {error_text}"
            )));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| PediaError::parse(format!("chat completion response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| PediaError::Generation("model returned no content".into()))
    }
}
