use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use pedia_shared::{PipelinePolicy, Result};
use pedia_storage::NewArticle;

use crate::cache::GraphCache;
use crate::generation::{ArticleGenerator, article_slug, entity_title};
use crate::progress::SilentProgress;
use crate::queue::{EnrichJob, ExtractJob, JobPayload, JobQueue, QueueName};
use crate::stages::Stage;
use crate::store::ContentStore;

#[derive(Debug, Clone, Serialize)]
pub struct EnrichOutput {
    pub entity_id: String,
    pub entity_name: String,
    pub slug: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<String>,
    pub extract_enqueued: bool,
}

impl EnrichOutput {
    fn skipped(job: &EnrichJob, slug: String, reason: &str, article_id: Option<String>) -> Self {
        Self {
            entity_id: job.entity_id.clone(),
            entity_name: job.entity_name.clone(),
            slug,
            skipped: true,
            reason: Some(reason.to_string()),
            article_id,
            extract_enqueued: false,
        }
    }
}

/// Generates an article for a salient entity and feeds it back into extraction.
pub struct EnrichStage {
    store: Arc<dyn ContentStore>,
    generator: Arc<dyn ArticleGenerator>,
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn GraphCache>,
    policy: PipelinePolicy,
}

impl EnrichStage {
    pub fn new(
        store: Arc<dyn ContentStore>,
        generator: Arc<dyn ArticleGenerator>,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn GraphCache>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            store,
            generator,
            queue,
            cache,
            policy,
        }
    }
}

#[async_trait]
impl Stage for EnrichStage {
    const QUEUE: QueueName = QueueName::Enrich;
    type Job = EnrichJob;
    type Output = EnrichOutput;

    #[instrument(skip_all, fields(entity = %job.entity_name, depth = job.depth))]
    async fn handle(&self, job: EnrichJob) -> Result<EnrichOutput> {
        let slug = article_slug(&job.entity_name);
        if slug.is_empty() {
            warn!("entity name yields no article slug, skipping");
            return Ok(EnrichOutput::skipped(&job, slug, "entity name has no slug", None));
        }

        // Checked before any generation work: several articles may have
        // nominated this entity concurrently.
        if let Some(existing) = self.store.find_published_by_slug(&slug).await? {
            info!(%slug, "article already exists, skipping");
            return Ok(EnrichOutput::skipped(
                &job,
                slug,
                "article already exists",
                Some(existing.id),
            ));
        }

        if job.depth > self.policy.max_generation_depth {
            info!(max = self.policy.max_generation_depth, "generation depth limit reached, skipping");
            return Ok(EnrichOutput::skipped(&job, slug, "generation depth limit reached", None));
        }

        if self.policy.max_corpus_size > 0 {
            let published = self.store.count_published().await?;
            if published >= self.policy.max_corpus_size {
                info!(published, "corpus size limit reached, skipping");
                return Ok(EnrichOutput::skipped(&job, slug, "corpus size limit reached", None));
            }
        }

        let query = format!(
            "{} ({})",
            job.entity_name,
            job.entity_type.as_str().to_lowercase()
        );
        let generated = self.generator.generate(&query, &SilentProgress).await?;

        let title = entity_title(&job.entity_name);
        let article = self
            .store
            .persist_generated_article(&NewArticle {
                slug: &slug,
                title: &title,
                content: &generated.content,
                entities: &generated.entities,
                sources: &generated.sources,
            })
            .await?;

        self.cache.invalidate_graph();

        let handle = self
            .queue
            .enqueue(JobPayload::Extract(ExtractJob {
                article_id: article.id.clone(),
                content: generated.content,
                depth: job.depth,
            }))
            .await?;

        info!(article_id = %article.id, %slug, "enrichment article published");
        Ok(EnrichOutput {
            entity_id: job.entity_id,
            entity_name: job.entity_name,
            slug,
            skipped: false,
            reason: None,
            article_id: Some(article.id),
            extract_enqueued: handle.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedia_shared::EntityType;

    use crate::cache::NoopGraphCache;
    use crate::testing::{
        RecordingQueue, ScriptedGenerator, extracted, published_article, test_storage,
    };

    fn france_job() -> EnrichJob {
        EnrichJob {
            entity_id: "e-france".into(),
            entity_name: "France".into(),
            entity_type: EntityType::Location,
            depth: 1,
        }
    }

    fn generator() -> Arc<ScriptedGenerator> {
        Arc::new(ScriptedGenerator::new(
            "# France\n\n[[Paris]] is its capital.",
            vec![extracted("Paris", EntityType::Location, 0.9)],
        ))
    }

    #[tokio::test]
    async fn second_run_is_skipped() {
        let storage = Arc::new(test_storage().await);
        let generator = generator();
        let queue = Arc::new(RecordingQueue::default());
        let stage = EnrichStage::new(
            storage.clone(),
            generator.clone(),
            queue.clone(),
            Arc::new(NoopGraphCache),
            PipelinePolicy::default(),
        );

        let first = stage.handle(france_job()).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.slug, "france");
        assert!(first.extract_enqueued);
        assert_eq!(generator.queries.lock().unwrap()[0], "France (location)");

        let second = stage.handle(france_job()).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.article_id, first.article_id);

        assert_eq!(generator.call_count(), 1);
        assert_eq!(storage.count_published().await.unwrap(), 1);
        assert_eq!(queue.count(QueueName::Extract), 1);
    }

    #[tokio::test]
    async fn persists_article_entities_and_sources() {
        let storage = Arc::new(test_storage().await);
        let queue = Arc::new(RecordingQueue::default());
        let stage = EnrichStage::new(
            storage.clone(),
            generator(),
            queue.clone(),
            Arc::new(NoopGraphCache),
            PipelinePolicy::default(),
        );

        let output = stage
            .handle(EnrichJob {
                entity_name: "marie curie".into(),
                entity_type: EntityType::Person,
                ..france_job()
            })
            .await
            .unwrap();

        let article = storage
            .find_published_by_slug("marie-curie")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(article.title, "Marie curie");
        assert_eq!(Some(article.id.clone()), output.article_id);
        assert_eq!(storage.article_entities(&article.id).await.unwrap().len(), 1);
        assert_eq!(storage.article_sources(&article.id).await.unwrap().len(), 1);

        match &queue.jobs()[0] {
            JobPayload::Extract(job) => {
                assert_eq!(job.article_id, article.id);
                assert_eq!(job.depth, 1);
            }
            other => panic!("expected extract job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_latin_entity_gets_an_article() {
        let storage = Arc::new(test_storage().await);
        let generator = generator();
        let stage = EnrichStage::new(
            storage.clone(),
            generator.clone(),
            Arc::new(RecordingQueue::default()),
            Arc::new(NoopGraphCache),
            PipelinePolicy::default(),
        );
        let job = EnrichJob {
            entity_name: "Москва".into(),
            ..france_job()
        };

        let first = stage.handle(job.clone()).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.slug, "москва");

        let second = stage.handle(job).await.unwrap();
        assert!(second.skipped);
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn unsluggable_name_skips_without_generation() {
        let storage = Arc::new(test_storage().await);
        let generator = generator();
        let stage = EnrichStage::new(
            storage.clone(),
            generator.clone(),
            Arc::new(RecordingQueue::default()),
            Arc::new(NoopGraphCache),
            PipelinePolicy::default(),
        );

        let output = stage
            .handle(EnrichJob {
                entity_name: "***".into(),
                ..france_job()
            })
            .await
            .unwrap();
        assert!(output.skipped);
        assert_eq!(output.reason.as_deref(), Some("entity name has no slug"));
        assert_eq!(generator.call_count(), 0);
        assert_eq!(storage.count_published().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn generation_failure_is_retryable_error() {
        let storage = Arc::new(test_storage().await);
        let queue = Arc::new(RecordingQueue::default());
        let stage = EnrichStage::new(
            storage.clone(),
            Arc::new(ScriptedGenerator::failing()),
            queue.clone(),
            Arc::new(NoopGraphCache),
            PipelinePolicy::default(),
        );

        assert!(stage.handle(france_job()).await.is_err());
        assert_eq!(storage.count_published().await.unwrap(), 0);
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn corpus_limit_skips_generation() {
        let storage = Arc::new(test_storage().await);
        published_article(&storage, "existing").await;
        let generator = generator();
        let stage = EnrichStage::new(
            storage,
            generator.clone(),
            Arc::new(RecordingQueue::default()),
            Arc::new(NoopGraphCache),
            PipelinePolicy {
                max_corpus_size: 1,
                ..PipelinePolicy::default()
            },
        );

        let output = stage.handle(france_job()).await.unwrap();
        assert!(output.skipped);
        assert_eq!(output.reason.as_deref(), Some("corpus size limit reached"));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn depth_limit_skips_generation() {
        let storage = Arc::new(test_storage().await);
        let generator = generator();
        let stage = EnrichStage::new(
            storage,
            generator.clone(),
            Arc::new(RecordingQueue::default()),
            Arc::new(NoopGraphCache),
            PipelinePolicy::default(),
        );

        let output = stage
            .handle(EnrichJob {
                depth: 4,
                ..france_job()
            })
            .await
            .unwrap();
        assert!(output.skipped);
        assert_eq!(generator.call_count(), 0);
    }
}
