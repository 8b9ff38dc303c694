use std::ops::AddAssign;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use pedia_shared::{RELATED_TO, Result, VerifyConfig};

use crate::cache::GraphCache;
use crate::graph::{find_missing_backlinks, neighbors, predict_links};
use crate::queue::{QueueName, VerifyJob};
use crate::stages::Stage;
use crate::stages::link::{CO_OCCURRENCE_INCREMENT, CO_OCCURRENCE_STRENGTH};
use crate::store::ContentStore;

/// Added to a predicted relation that already exists.
const PREDICTION_CONFIRMATION: f64 = 0.05;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub articles_checked: usize,
    pub entities_checked: usize,
    pub backlinks_created: usize,
    pub backlinks_strengthened: usize,
    pub predictions_created: usize,
    pub predictions_strengthened: usize,
    /// Relation writes that failed and were skipped.
    pub relations_failed: usize,
}

impl VerifyReport {
    fn writes(&self) -> usize {
        self.backlinks_created
            + self.backlinks_strengthened
            + self.predictions_created
            + self.predictions_strengthened
    }
}

impl AddAssign for VerifyReport {
    fn add_assign(&mut self, other: Self) {
        self.articles_checked += other.articles_checked;
        self.entities_checked += other.entities_checked;
        self.backlinks_created += other.backlinks_created;
        self.backlinks_strengthened += other.backlinks_strengthened;
        self.predictions_created += other.predictions_created;
        self.predictions_strengthened += other.predictions_strengthened;
        self.relations_failed += other.relations_failed;
    }
}

/// Repairs missing backlinks and writes common-neighbor predictions.
pub struct VerifyStage {
    store: Arc<dyn ContentStore>,
    cache: Arc<dyn GraphCache>,
    config: VerifyConfig,
}

impl VerifyStage {
    pub fn new(
        store: Arc<dyn ContentStore>,
        cache: Arc<dyn GraphCache>,
        config: VerifyConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Verify the highest-relevance entities of one article.
    #[instrument(skip(self))]
    pub async fn verify_article(&self, article_id: &str) -> Result<VerifyReport> {
        let mut report = VerifyReport {
            articles_checked: 1,
            ..VerifyReport::default()
        };

        let entity_ids: Vec<String> = self
            .store
            .article_entities(article_id)
            .await?
            .into_iter()
            .take(self.config.max_entities_per_article)
            .map(|ae| ae.entity.id)
            .collect();
        if entity_ids.is_empty() {
            debug!("article has no entities");
            return Ok(report);
        }
        report.entities_checked = entity_ids.len();

        // Predictions first: the backlink pass then mirrors them as well.
        for seed in &entity_ids {
            self.predict_for_seed(seed, &mut report).await?;
        }

        let relations = self.store.relations_touching(&entity_ids).await?;
        for missing in find_missing_backlinks(&relations) {
            let written = self
                .write_relation(
                    &missing.from_entity_id,
                    &missing.to_entity_id,
                    &missing.relation_type,
                    CO_OCCURRENCE_STRENGTH,
                    CO_OCCURRENCE_INCREMENT,
                    &mut report,
                )
                .await;
            match written {
                Some(true) => report.backlinks_created += 1,
                Some(false) => report.backlinks_strengthened += 1,
                None => {}
            }
        }

        if report.writes() > 0 {
            self.cache.invalidate_graph();
        }
        Ok(report)
    }

    async fn predict_for_seed(&self, seed: &str, report: &mut VerifyReport) -> Result<()> {
        let seed_relations = self
            .store
            .relations_touching(&[seed.to_string()])
            .await?;
        let neighbor_set = neighbors(seed, &seed_relations);
        if neighbor_set.is_empty() {
            return Ok(());
        }
        let neighbor_ids: Vec<String> = neighbor_set.iter().cloned().collect();
        let neighborhood = self.store.relations_touching(&neighbor_ids).await?;

        for prediction in predict_links(seed, &neighbor_set, &neighborhood, self.config.top_k) {
            if prediction.score < self.config.min_prediction_score {
                continue;
            }
            debug!(
                seed = %seed,
                candidate = %prediction.entity_id,
                score = prediction.score,
                common = prediction.common_neighbors,
                "link predicted"
            );
            let written = self
                .write_relation(
                    seed,
                    &prediction.entity_id,
                    RELATED_TO,
                    prediction.score,
                    PREDICTION_CONFIRMATION,
                    report,
                )
                .await;
            match written {
                Some(true) => report.predictions_created += 1,
                Some(false) => report.predictions_strengthened += 1,
                None => {}
            }
        }
        Ok(())
    }

    /// Upsert one relation. Returns whether it was created, or `None` if the
    /// write failed; failures are counted and never abort the batch.
    async fn write_relation(
        &self,
        from: &str,
        to: &str,
        relation_type: &str,
        create_strength: f64,
        increment: f64,
        report: &mut VerifyReport,
    ) -> Option<bool> {
        match self
            .store
            .upsert_relation(from, to, relation_type, create_strength, increment)
            .await
        {
            Ok(upsert) => Some(upsert.created),
            Err(e) => {
                report.relations_failed += 1;
                warn!(%from, %to, error = %e, "relation upsert failed, skipping");
                None
            }
        }
    }

    /// Verify the `limit` most recently updated published articles.
    ///
    /// A failing article is logged and skipped.
    #[instrument(skip(self))]
    pub async fn full_scan(&self, limit: u32) -> Result<VerifyReport> {
        let articles = self.store.list_recent_published(limit).await?;
        let mut report = VerifyReport::default();

        for article in &articles {
            match self.verify_article(&article.id).await {
                Ok(r) => report += r,
                Err(e) => warn!(article_id = %article.id, error = %e, "verification failed, skipping"),
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Stage for VerifyStage {
    const QUEUE: QueueName = QueueName::Verify;
    type Job = VerifyJob;
    type Output = VerifyReport;

    async fn handle(&self, job: VerifyJob) -> Result<VerifyReport> {
        let report = match job {
            VerifyJob::Article { article_id } => self.verify_article(&article_id).await?,
            VerifyJob::FullScan { limit } => self.full_scan(limit).await?,
        };
        info!(
            articles = report.articles_checked,
            backlinks = report.backlinks_created,
            predictions = report.predictions_created,
            failed = report.relations_failed,
            "verification complete"
        );
        Ok(report)
    }
}
