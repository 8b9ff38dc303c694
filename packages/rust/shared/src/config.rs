//! Application configuration for Pedia.
//!
//! User config lives at `~/.pedia/pedia.toml`. Every field has a default, so a
//! missing file (or a partial one) resolves to a complete [`AppConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PediaError, Result};
use crate::types::EntityType;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pedia.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pedia";

// ---------------------------------------------------------------------------
// Config structs (matching pedia.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    /// Growth-rate controls for the enrichment loop.
    #[serde(default)]
    pub policy: PipelinePolicy,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.pedia/pedia.db".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for generation and extraction.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Base URL of the chat-completions API.
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_url(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_timeout() -> u64 {
    120
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Name of the env var holding the search API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    /// Base URL of the search API.
    #[serde(default = "default_search_url")]
    pub base_url: String,

    /// Number of results fed into generation.
    #[serde(default = "default_search_results")]
    pub max_results: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            base_url: default_search_url(),
            max_results: default_search_results(),
        }
    }
}

fn default_search_key_env() -> String {
    "TAVILY_API_KEY".into()
}
fn default_search_url() -> String {
    "https://api.tavily.com".into()
}
fn default_search_results() -> u32 {
    5
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// When false every enqueue is a logged no-op and no workers start.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long an idle worker sleeps before polling its queue again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    500
}

/// `[policy]` section: the knobs that decide how fast the corpus grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePolicy {
    /// Entity types that may trigger article generation.
    #[serde(default = "default_enrich_types")]
    pub enrich_types: Vec<EntityType>,

    /// Minimum extraction relevance for an entity to trigger generation.
    #[serde(default = "default_min_relevance")]
    pub min_relevance_for_enrich: f64,

    /// Maximum enrichment jobs one linking job may enqueue.
    #[serde(default = "default_max_enrich")]
    pub max_enrich_per_link: usize,

    /// Maximum co-occurrence pairs written per article.
    #[serde(default = "default_max_pairs")]
    pub max_relation_pairs: usize,

    /// Maximum entities kept from one extraction.
    #[serde(default = "default_max_extracted")]
    pub max_extracted_entities: usize,

    /// Relevance assigned to entities found by the fallback extractor.
    #[serde(default = "default_fallback_relevance")]
    pub fallback_relevance: f64,

    /// Deepest enrichment generation allowed (user articles are depth 0).
    #[serde(default = "default_max_depth")]
    pub max_generation_depth: u32,

    /// Stop enriching once this many articles are published (0 = unlimited).
    #[serde(default)]
    pub max_corpus_size: u64,

    /// Enqueue a single-article verify job when linking finishes.
    #[serde(default = "default_true")]
    pub verify_after_link: bool,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            enrich_types: default_enrich_types(),
            min_relevance_for_enrich: default_min_relevance(),
            max_enrich_per_link: default_max_enrich(),
            max_relation_pairs: default_max_pairs(),
            max_extracted_entities: default_max_extracted(),
            fallback_relevance: default_fallback_relevance(),
            max_generation_depth: default_max_depth(),
            max_corpus_size: 0,
            verify_after_link: true,
        }
    }
}

impl PipelinePolicy {
    /// Whether an entity of this type and relevance qualifies for generation.
    pub fn is_salient(&self, entity_type: EntityType, relevance: f64) -> bool {
        self.enrich_types.contains(&entity_type) && relevance >= self.min_relevance_for_enrich
    }
}

fn default_enrich_types() -> Vec<EntityType> {
    vec![
        EntityType::Person,
        EntityType::Organization,
        EntityType::Location,
        EntityType::Event,
    ]
}
fn default_min_relevance() -> f64 {
    0.7
}
fn default_max_enrich() -> usize {
    5
}
fn default_max_pairs() -> usize {
    50
}
fn default_max_extracted() -> usize {
    20
}
fn default_fallback_relevance() -> f64 {
    0.7
}
fn default_max_depth() -> u32 {
    3
}

/// Per-queue worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum jobs processed simultaneously by this process.
    pub concurrency: usize,
    /// Lease duration; the lease is renewed at half this interval.
    pub lease_ms: u64,
    /// Total attempts before a job is marked failed.
    pub attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub backoff_ms: u64,
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// `[workers.*]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_extract_worker")]
    pub extract: WorkerConfig,
    #[serde(default = "default_link_worker")]
    pub link: WorkerConfig,
    #[serde(default = "default_enrich_worker")]
    pub enrich: WorkerConfig,
    #[serde(default = "default_verify_worker")]
    pub verify: WorkerConfig,
    #[serde(default)]
    pub enrich_rate_limit: RateLimitConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            extract: default_extract_worker(),
            link: default_link_worker(),
            enrich: default_enrich_worker(),
            verify: default_verify_worker(),
            enrich_rate_limit: RateLimitConfig::default(),
        }
    }
}

fn default_extract_worker() -> WorkerConfig {
    WorkerConfig {
        concurrency: 3,
        lease_ms: 60_000,
        attempts: 3,
        backoff_ms: 2_000,
    }
}
fn default_link_worker() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        lease_ms: 90_000,
        attempts: 3,
        backoff_ms: 2_000,
    }
}
fn default_enrich_worker() -> WorkerConfig {
    WorkerConfig {
        concurrency: 1,
        lease_ms: 180_000,
        attempts: 2,
        backoff_ms: 5_000,
    }
}
fn default_verify_worker() -> WorkerConfig {
    WorkerConfig {
        concurrency: 1,
        lease_ms: 120_000,
        attempts: 2,
        backoff_ms: 5_000,
    }
}

/// `[workers.enrich_rate_limit]`: at most `max` jobs per rolling `window_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_max")]
    pub max: usize,
    #[serde(default = "default_rate_window")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rate_max(),
            window_ms: default_rate_window(),
        }
    }
}

fn default_rate_max() -> usize {
    10
}
fn default_rate_window() -> u64 {
    60_000
}

/// `[verify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Entities examined per article in a single-article run.
    #[serde(default = "default_verify_entities")]
    pub max_entities_per_article: usize,

    /// Predictions kept per seed entity.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Predictions scoring below this are never written.
    #[serde(default = "default_min_score")]
    pub min_prediction_score: f64,

    /// Articles covered by one full-scan sweep.
    #[serde(default = "default_full_scan_limit")]
    pub full_scan_limit: u32,

    /// Seconds between periodic sweeps (0 disables the schedule).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_entities_per_article: default_verify_entities(),
            top_k: default_top_k(),
            min_prediction_score: default_min_score(),
            full_scan_limit: default_full_scan_limit(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_verify_entities() -> usize {
    10
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.3
}
fn default_full_scan_limit() -> u32 {
    50
}
fn default_sweep_interval() -> u64 {
    3_600
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of cached graph query results.
    #[serde(default = "default_graph_ttl")]
    pub graph_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            graph_ttl_secs: default_graph_ttl(),
        }
    }
}

fn default_graph_ttl() -> u64 {
    1_800
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pedia/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| PediaError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pedia/pedia.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PediaError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PediaError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PediaError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| PediaError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PediaError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve the database path, expanding a leading `~/`.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = config.database.path.as_str();
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| PediaError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(PediaError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("min_relevance_for_enrich"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.policy.max_enrich_per_link, 5);
        assert_eq!(parsed.workers.enrich.concurrency, 1);
        assert_eq!(parsed.workers.extract.concurrency, 3);
        assert_eq!(parsed.policy.enrich_types.len(), 4);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[policy]
min_relevance_for_enrich = 0.9
max_corpus_size = 500

[queue]
enabled = false
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.policy.min_relevance_for_enrich, 0.9);
        assert_eq!(config.policy.max_corpus_size, 500);
        assert_eq!(config.policy.max_relation_pairs, 50);
        assert!(!config.queue.enabled);
        assert_eq!(config.verify.top_k, 5);
        assert_eq!(config.workers.link.lease_ms, 90_000);
    }

    #[test]
    fn enrich_types_use_upper_case_names() {
        let toml_str = r#"
[policy]
enrich_types = ["PERSON", "WORK"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(
            config.policy.enrich_types,
            vec![EntityType::Person, EntityType::Work]
        );
    }

    #[test]
    fn salience_requires_type_and_relevance() {
        let policy = PipelinePolicy::default();
        assert!(policy.is_salient(EntityType::Person, 0.7));
        assert!(!policy.is_salient(EntityType::Person, 0.69));
        assert!(!policy.is_salient(EntityType::Concept, 0.95));
    }

    #[test]
    fn relative_db_path_is_kept() {
        let mut config = AppConfig::default();
        config.database.path = "var/pedia.db".into();
        assert_eq!(resolve_db_path(&config).unwrap(), PathBuf::from("var/pedia.db"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "PEDIA_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
