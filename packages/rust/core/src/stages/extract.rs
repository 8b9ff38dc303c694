use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

use pedia_shared::{PipelinePolicy, Result};

use crate::extraction::{EntityExtractor, ExtractionMethod, extract_with_fallback};
use crate::queue::{ExtractJob, JobPayload, JobQueue, LinkJob, QueueName};
use crate::stages::Stage;

#[derive(Debug, Clone, Serialize)]
pub struct ExtractOutput {
    pub article_id: String,
    pub entity_count: usize,
    pub method: ExtractionMethod,
    pub link_job_id: Option<String>,
}

/// Extracts entities from article text and hands them to linking.
pub struct ExtractStage {
    extractor: Arc<dyn EntityExtractor>,
    queue: Arc<dyn JobQueue>,
    policy: PipelinePolicy,
}

impl ExtractStage {
    pub fn new(
        extractor: Arc<dyn EntityExtractor>,
        queue: Arc<dyn JobQueue>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            extractor,
            queue,
            policy,
        }
    }
}

#[async_trait]
impl Stage for ExtractStage {
    const QUEUE: QueueName = QueueName::Extract;
    type Job = ExtractJob;
    type Output = ExtractOutput;

    #[instrument(skip_all, fields(article_id = %job.article_id, depth = job.depth))]
    async fn handle(&self, job: ExtractJob) -> Result<ExtractOutput> {
        let (entities, method) =
            extract_with_fallback(self.extractor.as_ref(), &job.content, &self.policy).await;
        let entity_count = entities.len();

        let handle = self
            .queue
            .enqueue(JobPayload::Link(LinkJob {
                article_id: job.article_id.clone(),
                entities,
                depth: job.depth,
            }))
            .await?;

        info!(entity_count, ?method, "extraction complete");
        Ok(ExtractOutput {
            article_id: job.article_id,
            entity_count,
            method,
            link_job_id: handle.map(|h| h.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedia_shared::{EntityType, ExtractedEntity, PediaError};

    use crate::testing::{RecordingQueue, extracted};

    struct Fixed(Vec<ExtractedEntity>);

    #[async_trait]
    impl EntityExtractor for Fixed {
        async fn extract(&self, _content: &str) -> Result<Vec<ExtractedEntity>> {
            Ok(self.0.clone())
        }
    }

    struct Down;

    #[async_trait]
    impl EntityExtractor for Down {
        async fn extract(&self, _content: &str) -> Result<Vec<ExtractedEntity>> {
            Err(PediaError::Network("timeout".into()))
        }
    }

    fn job(content: &str) -> ExtractJob {
        ExtractJob {
            article_id: "a1".into(),
            content: content.into(),
            depth: 1,
        }
    }

    #[tokio::test]
    async fn enqueues_one_link_job_with_all_entities() {
        let queue = Arc::new(RecordingQueue::default());
        let stage = ExtractStage::new(
            Arc::new(Fixed(vec![
                extracted("Paris", EntityType::Location, 0.9),
                extracted("France", EntityType::Location, 0.8),
            ])),
            queue.clone(),
            PipelinePolicy::default(),
        );

        let output = stage.handle(job("text")).await.unwrap();
        assert_eq!(output.entity_count, 2);
        assert_eq!(output.method, ExtractionMethod::Llm);
        assert!(output.link_job_id.is_some());

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        match &jobs[0] {
            JobPayload::Link(link) => {
                assert_eq!(link.article_id, "a1");
                assert_eq!(link.entities.len(), 2);
                assert_eq!(link.depth, 1);
            }
            other => panic!("expected link job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extractor_failure_degrades_to_wiki_links() {
        let queue = Arc::new(RecordingQueue::default());
        let stage = ExtractStage::new(Arc::new(Down), queue.clone(), PipelinePolicy::default());

        let output = stage
            .handle(job("[[Paris]] lies on the [[Seine]]."))
            .await
            .unwrap();
        assert_eq!(output.method, ExtractionMethod::WikiLinks);
        assert_eq!(output.entity_count, 2);
        assert_eq!(queue.count(QueueName::Link), 1);
    }
}
