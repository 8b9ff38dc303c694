//! Progress reporting for article generation.

use pedia_shared::{Article, ExtractedEntity};

/// The phases of one generation run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStep {
    Search,
    Analyze,
    Generate,
    Extract,
}

impl GenerationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Analyze => "analyze",
            Self::Generate => "generate",
            Self::Extract => "extract",
        }
    }
}

/// Receives progress events from the generation path.
///
/// Interactive callers render these; background stages pass [`SilentProgress`].
pub trait ProgressSink: Send + Sync {
    fn step_start(&self, step: GenerationStep, detail: &str);
    fn step_complete(&self, step: GenerationStep);
    fn step_error(&self, step: GenerationStep, error: &str);
    /// Generated article text.
    fn content(&self, text: &str);
    fn entity_found(&self, entity: &ExtractedEntity);
    /// The article has been persisted.
    fn complete(&self, article: &Article);
    fn error(&self, message: &str);
}

/// No-op progress sink for background and test usage.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn step_start(&self, _step: GenerationStep, _detail: &str) {}
    fn step_complete(&self, _step: GenerationStep) {}
    fn step_error(&self, _step: GenerationStep, _error: &str) {}
    fn content(&self, _text: &str) {}
    fn entity_found(&self, _entity: &ExtractedEntity) {}
    fn complete(&self, _article: &Article) {}
    fn error(&self, _message: &str) {}
}
