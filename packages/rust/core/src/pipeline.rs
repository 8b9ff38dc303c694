//! Pipeline wiring: the synchronous generate path, the four stage workers
//! and the periodic verification sweep.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, instrument, warn};

use pedia_shared::{AppConfig, Article, Result};
use pedia_storage::{JobCounts, NewArticle, Storage};

use crate::cache::GraphCache;
use crate::extraction::EntityExtractor;
use crate::generation::{ArticleGenerator, query_slug, title_from_content};
use crate::progress::ProgressSink;
use crate::queue::{ExtractJob, JobPayload, JobQueue, QueueName, Queues, VerifyJob};
use crate::stages::{EnrichStage, ExtractStage, LinkStage, VerifyStage};
use crate::worker::{WorkerHandle, WorkerOptions, spawn_worker};

/// Completed jobs older than this are pruned by the sweep.
const COMPLETED_JOB_RETENTION_MS: u64 = 60 * 60 * 1000;

/// Job counts of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue: QueueName,
    #[serde(flatten)]
    pub counts: JobCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub queues: Vec<QueueStats>,
    pub workers_running: bool,
}

/// Owns the collaborators and the running workers.
pub struct PipelineManager {
    storage: Arc<Storage>,
    queues: Arc<Queues>,
    cache: Arc<dyn GraphCache>,
    generator: Arc<dyn ArticleGenerator>,
    extractor: Arc<dyn EntityExtractor>,
    config: AppConfig,
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
    sweep: Option<JoinHandle<()>>,
}

impl PipelineManager {
    pub fn new(
        storage: Arc<Storage>,
        generator: Arc<dyn ArticleGenerator>,
        extractor: Arc<dyn EntityExtractor>,
        cache: Arc<dyn GraphCache>,
        config: AppConfig,
    ) -> Self {
        let queues = if config.queue.enabled {
            Queues::new(storage.clone(), config.workers.clone())
        } else {
            Queues::disabled()
        };
        Self {
            storage,
            queues: Arc::new(queues),
            cache,
            generator,
            extractor,
            config,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
            sweep: None,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().any(|w| !w.is_finished())
    }

    /// Spawn one worker pool per queue and, if configured, the sweep task.
    pub fn start(&mut self) {
        if !self.queues.is_enabled() {
            warn!("job queue disabled, pipeline workers not started");
            return;
        }
        if !self.workers.is_empty() {
            warn!("pipeline already started");
            return;
        }

        let policy = self.config.policy.clone();
        let workers = &self.config.workers;
        let poll_ms = self.config.queue.poll_interval_ms;
        let queue: Arc<dyn JobQueue> = self.queues.clone();
        let store = self.storage.clone();

        let extract = ExtractStage::new(self.extractor.clone(), queue.clone(), policy.clone());
        let link = LinkStage::new(
            store.clone(),
            queue.clone(),
            self.cache.clone(),
            policy.clone(),
        );
        let enrich = EnrichStage::new(
            store.clone(),
            self.generator.clone(),
            queue.clone(),
            self.cache.clone(),
            policy,
        );
        let verify = VerifyStage::new(store, self.cache.clone(), self.config.verify.clone());

        self.workers = vec![
            spawn_worker(
                Arc::new(extract),
                self.storage.clone(),
                WorkerOptions::from_config(&workers.extract, poll_ms),
                self.shutdown.child_token(),
            ),
            spawn_worker(
                Arc::new(link),
                self.storage.clone(),
                WorkerOptions::from_config(&workers.link, poll_ms),
                self.shutdown.child_token(),
            ),
            spawn_worker(
                Arc::new(enrich),
                self.storage.clone(),
                WorkerOptions::from_config(&workers.enrich, poll_ms)
                    .with_rate_limit(workers.enrich_rate_limit.clone()),
                self.shutdown.child_token(),
            ),
            spawn_worker(
                Arc::new(verify),
                self.storage.clone(),
                WorkerOptions::from_config(&workers.verify, poll_ms),
                self.shutdown.child_token(),
            ),
        ];

        let interval = self.config.verify.sweep_interval_secs;
        if interval > 0 {
            let task = sweep_loop(
                self.queues.clone(),
                self.storage.clone(),
                Duration::from_secs(interval),
                self.config.verify.full_scan_limit,
                self.shutdown.child_token(),
            );
            self.sweep = Some(tokio::spawn(task.instrument(info_span!("sweep"))));
        }

        info!(workers = self.workers.len(), sweep_interval_secs = interval, "pipeline started");
    }

    /// Stop claiming jobs and wait for in-flight ones to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        for worker in self.workers.drain(..) {
            worker.join().await;
        }
        if let Some(sweep) = self.sweep.take() {
            if let Err(e) = sweep.await {
                error!(error = %e, "verification sweep task panicked");
            }
        }
        info!("pipeline stopped");
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let mut queues = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            queues.push(QueueStats {
                queue,
                counts: self.storage.job_counts(queue.as_str()).await?,
            });
        }
        Ok(PipelineStats {
            queues,
            workers_running: self.is_running(),
        })
    }

    /// Generate, persist and publish an article for a user query, then hand
    /// it to the asynchronous pipeline.
    ///
    /// Queue trouble is logged and never fails the call.
    #[instrument(skip(self, progress))]
    pub async fn generate_and_publish(
        &self,
        query: &str,
        progress: &dyn ProgressSink,
    ) -> Result<Article> {
        let slug = match query_slug(query) {
            Ok(slug) => slug,
            Err(e) => {
                progress.error(&e.to_string());
                return Err(e);
            }
        };

        let generated = match self.generator.generate(query, progress).await {
            Ok(generated) => generated,
            Err(e) => {
                progress.error(&e.to_string());
                return Err(e);
            }
        };

        let title = title_from_content(&generated.content, query);
        let article = match self
            .storage
            .persist_generated_article(&NewArticle {
                slug: &slug,
                title: &title,
                content: &generated.content,
                entities: &generated.entities,
                sources: &generated.sources,
            })
            .await
        {
            Ok(article) => article,
            Err(e) => {
                progress.error(&e.to_string());
                return Err(e);
            }
        };

        self.cache.invalidate_graph();
        progress.complete(&article);

        let job = JobPayload::Extract(ExtractJob {
            article_id: article.id.clone(),
            content: generated.content,
            depth: 0,
        });
        match self.queues.enqueue(job).await {
            Ok(Some(handle)) => info!(job_id = %handle.id, "extraction enqueued"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to enqueue extraction"),
        }

        info!(article_id = %article.id, %slug, "article published");
        Ok(article)
    }
}

async fn sweep_loop(
    queues: Arc<Queues>,
    storage: Arc<Storage>,
    every: Duration,
    limit: u32,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = queues
            .enqueue(JobPayload::Verify(VerifyJob::FullScan { limit }))
            .await
        {
            warn!(error = %e, "failed to enqueue verification sweep");
        }
        match storage.prune_completed_jobs(COMPLETED_JOB_RETENTION_MS).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "pruned completed jobs"),
            Err(e) => warn!(error = %e, "job pruning failed"),
        }
    }
}
