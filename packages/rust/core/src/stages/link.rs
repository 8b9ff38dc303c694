use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use pedia_shared::{Entity, ExtractedEntity, PipelinePolicy, RELATED_TO, Result};

use crate::cache::GraphCache;
use crate::generation::article_slug;
use crate::queue::{EnrichJob, JobPayload, JobQueue, LinkJob, QueueName, VerifyJob};
use crate::stages::Stage;
use crate::store::ContentStore;

/// Strength of a newly observed co-occurrence.
pub(crate) const CO_OCCURRENCE_STRENGTH: f64 = 0.5;
/// Strength added when a co-occurrence is seen again.
pub(crate) const CO_OCCURRENCE_INCREMENT: f64 = 0.1;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkOutput {
    pub article_id: String,
    pub entities_linked: usize,
    pub relations_created: usize,
    pub relations_strengthened: usize,
    pub relations_failed: usize,
    pub enrich_enqueued: usize,
    pub verify_enqueued: bool,
}

/// Persists extracted entities, writes co-occurrence relations, and nominates
/// salient uncovered entities for enrichment.
pub struct LinkStage {
    store: Arc<dyn ContentStore>,
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn GraphCache>,
    policy: PipelinePolicy,
}

impl LinkStage {
    pub fn new(
        store: Arc<dyn ContentStore>,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn GraphCache>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            policy,
        }
    }

    /// Upsert each entity and its association with the article. Failures are
    /// skipped; an entity seen twice under different spellings is linked once.
    async fn link_entities<'a>(
        &self,
        article_id: &str,
        extracted: &'a [ExtractedEntity],
    ) -> Vec<(Entity, &'a ExtractedEntity)> {
        let mut seen = HashSet::new();
        let mut linked = Vec::with_capacity(extracted.len());

        for candidate in extracted {
            let entity = match self
                .store
                .upsert_entity(&candidate.name, candidate.entity_type)
                .await
            {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(name = %candidate.name, error = %e, "entity upsert failed, skipping");
                    continue;
                }
            };
            if !seen.insert(entity.id.clone()) {
                continue;
            }
            if let Err(e) = self
                .store
                .link_article_entity(article_id, &entity.id, candidate.relevance)
                .await
            {
                warn!(entity_id = %entity.id, error = %e, "article link failed, skipping");
                continue;
            }
            linked.push((entity, candidate));
        }
        linked
    }

    /// Write RELATED_TO for the first `max_relation_pairs` unordered pairs.
    async fn link_pairs(&self, linked: &[(Entity, &ExtractedEntity)], output: &mut LinkOutput) {
        let pairs = (0..linked.len())
            .flat_map(|i| ((i + 1)..linked.len()).map(move |j| (i, j)))
            .take(self.policy.max_relation_pairs);

        for (i, j) in pairs {
            let (from, to) = (&linked[i].0, &linked[j].0);
            match self
                .store
                .upsert_relation(
                    &from.id,
                    &to.id,
                    RELATED_TO,
                    CO_OCCURRENCE_STRENGTH,
                    CO_OCCURRENCE_INCREMENT,
                )
                .await
            {
                Ok(upsert) if upsert.created => output.relations_created += 1,
                Ok(_) => output.relations_strengthened += 1,
                Err(e) => {
                    output.relations_failed += 1;
                    warn!(from = %from.id, to = %to.id, error = %e, "relation upsert failed, skipping");
                }
            }
        }
    }

    /// Whether the recursion breakers allow nominating anything from an
    /// article at `depth`.
    async fn enrichment_allowed(&self, depth: u32) -> Result<bool> {
        if depth + 1 > self.policy.max_generation_depth {
            info!(depth, max = self.policy.max_generation_depth, "generation depth limit reached");
            return Ok(false);
        }
        if self.policy.max_corpus_size > 0 {
            let published = self.store.count_published().await?;
            if published >= self.policy.max_corpus_size {
                info!(published, max = self.policy.max_corpus_size, "corpus size limit reached");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn nominate(
        &self,
        linked: &[(Entity, &ExtractedEntity)],
        depth: u32,
    ) -> Result<usize> {
        let salient = linked
            .iter()
            .filter(|(_, x)| self.policy.is_salient(x.entity_type, x.relevance))
            .take(self.policy.max_enrich_per_link);

        let mut enqueued = 0;
        for (entity, extracted) in salient {
            let slug = article_slug(&entity.normalized_name);
            if slug.is_empty() {
                debug!(name = %entity.name, "entity name yields no slug, not nominating");
                continue;
            }
            if self.store.find_published_by_slug(&slug).await?.is_some() {
                debug!(%slug, "article exists, not nominating");
                continue;
            }
            let handle = self
                .queue
                .enqueue(JobPayload::Enrich(EnrichJob {
                    entity_id: entity.id.clone(),
                    entity_name: entity.name.clone(),
                    entity_type: extracted.entity_type,
                    depth: depth + 1,
                }))
                .await?;
            if handle.is_some() {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl Stage for LinkStage {
    const QUEUE: QueueName = QueueName::Link;
    type Job = LinkJob;
    type Output = LinkOutput;

    #[instrument(skip_all, fields(article_id = %job.article_id, entities = job.entities.len()))]
    async fn handle(&self, job: LinkJob) -> Result<LinkOutput> {
        let mut output = LinkOutput {
            article_id: job.article_id.clone(),
            ..Default::default()
        };

        let linked = self.link_entities(&job.article_id, &job.entities).await;
        output.entities_linked = linked.len();

        self.link_pairs(&linked, &mut output).await;

        if self.enrichment_allowed(job.depth).await? {
            output.enrich_enqueued = self.nominate(&linked, job.depth).await?;
        }

        self.cache.invalidate_graph();

        if self.policy.verify_after_link && !linked.is_empty() {
            output.verify_enqueued = self
                .queue
                .enqueue(JobPayload::Verify(VerifyJob::Article {
                    article_id: job.article_id.clone(),
                }))
                .await?
                .is_some();
        }

        info!(
            entities = output.entities_linked,
            created = output.relations_created,
            strengthened = output.relations_strengthened,
            failed = output.relations_failed,
            enrich = output.enrich_enqueued,
            "linking complete"
        );
        Ok(output)
    }
}
