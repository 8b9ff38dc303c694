//! Core pipeline and domain logic for Pedia.
//!
//! Articles are generated from a query, then handed to four queued stages:
//! extraction finds entities, linking stores them and their co-occurrence
//! relations and nominates salient ones for enrichment, enrichment writes
//! articles for those entities, and verification repairs missing backlinks
//! and predicts new relations.

pub mod cache;
pub mod extraction;
pub mod generation;
pub mod graph;
pub mod graph_query;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod stages;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{GraphCache, MemoryGraphCache, NoopGraphCache};
pub use extraction::{EntityExtractor, ExtractionMethod, LlmEntityExtractor};
pub use generation::{ArticleGenerator, GeneratedArticle, Generator};
pub use graph_query::{EntityRelations, FullGraph, GraphData, GraphService};
pub use pipeline::{PipelineManager, PipelineStats};
pub use progress::{GenerationStep, ProgressSink, SilentProgress};
pub use queue::{JobHandle, JobPayload, JobQueue, QueueName, Queues, VerifyJob};
pub use stages::VerifyReport;
