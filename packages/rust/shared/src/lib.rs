//! Shared types, error model, and configuration for Pedia.
//!
//! This crate is the foundation depended on by all other Pedia crates.
//! It provides:
//! - [`PediaError`], the unified error type
//! - Domain types ([`Article`], [`Entity`], [`EntityRelation`], [`ExtractedEntity`])
//! - Configuration ([`AppConfig`], [`PipelinePolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, DatabaseConfig, OpenRouterConfig, PipelinePolicy, QueueConfig,
    RateLimitConfig, SearchConfig, VerifyConfig, WorkerConfig, WorkersConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, resolve_db_path,
    validate_api_key,
};
pub use error::{PediaError, Result};
pub use types::{
    Article, ArticleEntity, ArticleStatus, Entity, EntityRelation, EntityType, ExtractedEntity,
    RELATED_TO, Source, normalize_name, slugify,
};
