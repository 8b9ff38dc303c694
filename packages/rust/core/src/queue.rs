//! Typed job payloads and the enqueue facade over the durable job table.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use pedia_shared::{EntityType, ExtractedEntity, PediaError, Result, WorkerConfig, WorkersConfig};
use pedia_storage::{NewJob, Storage};

/// The four pipeline queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Extract,
    Link,
    Enrich,
    Verify,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [Self::Extract, Self::Link, Self::Enrich, Self::Verify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Link => "link",
            Self::Enrich => "enrich",
            Self::Verify => "verify",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Extract entities from a freshly written article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractJob {
    pub article_id: String,
    pub content: String,
    /// Generation depth of the article (0 = user-initiated).
    #[serde(default)]
    pub depth: u32,
}

/// Persist and interlink the entities extracted from an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkJob {
    pub article_id: String,
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub depth: u32,
}

/// Generate an article for a salient entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichJob {
    pub entity_id: String,
    pub entity_name: String,
    pub entity_type: EntityType,
    /// Depth the generated article will have.
    #[serde(default)]
    pub depth: u32,
}

/// Repair and extend the relation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VerifyJob {
    /// One article's entities.
    Article { article_id: String },
    /// The most recently updated published articles.
    FullScan { limit: u32 },
}

/// Any pipeline job, tagged by the queue it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Extract(ExtractJob),
    Link(LinkJob),
    Enrich(EnrichJob),
    Verify(VerifyJob),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Extract(_) => QueueName::Extract,
            Self::Link(_) => QueueName::Link,
            Self::Enrich(_) => QueueName::Enrich,
            Self::Verify(_) => QueueName::Verify,
        }
    }

    /// Key under which concurrent enqueues of the same work collapse.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Self::Extract(job) => Some(format!(
                "extract:{}:{}",
                job.article_id,
                content_digest(&job.content)
            )),
            Self::Link(_) => None,
            Self::Enrich(job) => Some(format!("enrich:{}", job.entity_id)),
            Self::Verify(VerifyJob::Article { article_id }) => {
                Some(format!("verify:article:{article_id}"))
            }
            Self::Verify(VerifyJob::FullScan { .. }) => Some("verify:full-scan".into()),
        }
    }

    /// Serialize the inner job (without the queue tag).
    pub fn to_json(&self) -> Result<String> {
        let encoded = match self {
            Self::Extract(job) => serde_json::to_string(job),
            Self::Link(job) => serde_json::to_string(job),
            Self::Enrich(job) => serde_json::to_string(job),
            Self::Verify(job) => serde_json::to_string(job),
        };
        encoded.map_err(|e| PediaError::Queue(format!("encode {} job: {e}", self.queue())))
    }
}

/// Short SHA-256 hex digest of article content.
fn content_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Queue facade
// ---------------------------------------------------------------------------

/// Handle to an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub queue: QueueName,
    /// An equivalent job was already waiting or running.
    pub deduplicated: bool,
}

/// Enqueue side of the job queue.
///
/// `Ok(None)` means the queue is unavailable; callers must carry on.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload) -> Result<Option<JobHandle>>;
}

/// Retry policy attached to each job at enqueue time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            attempts: worker.attempts,
            backoff_ms: worker.backoff_ms,
        }
    }
}

/// [`JobQueue`] over the durable job table.
pub struct Queues {
    storage: Option<Arc<Storage>>,
    workers: WorkersConfig,
}

impl Queues {
    pub fn new(storage: Arc<Storage>, workers: WorkersConfig) -> Self {
        Self {
            storage: Some(storage),
            workers,
        }
    }

    /// A queue that accepts nothing: every enqueue logs a warning and
    /// returns `None`.
    pub fn disabled() -> Self {
        Self {
            storage: None,
            workers: WorkersConfig::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    fn retry_policy(&self, queue: QueueName) -> RetryPolicy {
        match queue {
            QueueName::Extract => (&self.workers.extract).into(),
            QueueName::Link => (&self.workers.link).into(),
            QueueName::Enrich => (&self.workers.enrich).into(),
            QueueName::Verify => (&self.workers.verify).into(),
        }
    }
}

#[async_trait]
impl JobQueue for Queues {
    async fn enqueue(&self, payload: JobPayload) -> Result<Option<JobHandle>> {
        let queue = payload.queue();
        let Some(storage) = &self.storage else {
            warn!(%queue, "job queue disabled, job dropped");
            return Ok(None);
        };

        let retry = self.retry_policy(queue);
        let body = payload.to_json()?;
        let dedup_key = payload.dedup_key();

        let enqueued = storage
            .enqueue_job(&NewJob {
                queue: queue.as_str(),
                payload: &body,
                max_attempts: retry.attempts,
                backoff_ms: retry.backoff_ms,
                dedup_key: dedup_key.as_deref(),
            })
            .await?;

        debug!(%queue, job_id = %enqueued.id, deduplicated = enqueued.deduplicated, "job enqueued");
        Ok(Some(JobHandle {
            id: enqueued.id,
            queue,
            deduplicated: enqueued.deduplicated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;

    #[test]
    fn verify_job_is_tagged() {
        let json = serde_json::to_string(&VerifyJob::FullScan { limit: 50 }).unwrap();
        assert_eq!(json, r#"{"mode":"full_scan","limit":50}"#);

        let parsed: VerifyJob =
            serde_json::from_str(r#"{"mode":"article","article_id":"a1"}"#).unwrap();
        assert_eq!(
            parsed,
            VerifyJob::Article {
                article_id: "a1".into()
            }
        );
    }

    #[test]
    fn depth_defaults_to_zero() {
        let job: ExtractJob =
            serde_json::from_str(r#"{"article_id":"a1","content":"text"}"#).unwrap();
        assert_eq!(job.depth, 0);
    }

    #[test]
    fn dedup_keys() {
        let enrich = JobPayload::Enrich(EnrichJob {
            entity_id: "e1".into(),
            entity_name: "France".into(),
            entity_type: EntityType::Location,
            depth: 1,
        });
        assert_eq!(enrich.dedup_key().as_deref(), Some("enrich:e1"));

        let a = JobPayload::Extract(ExtractJob {
            article_id: "a1".into(),
            content: "one".into(),
            depth: 0,
        });
        let b = JobPayload::Extract(ExtractJob {
            article_id: "a1".into(),
            content: "two".into(),
            depth: 0,
        });
        assert_ne!(a.dedup_key(), b.dedup_key());

        let link = JobPayload::Link(LinkJob {
            article_id: "a1".into(),
            entities: vec![],
            depth: 0,
        });
        assert!(link.dedup_key().is_none());
    }

    #[tokio::test]
    async fn disabled_queue_returns_none() {
        let queues = Queues::disabled();
        assert!(!queues.is_enabled());
        let handle = queues
            .enqueue(JobPayload::Verify(VerifyJob::FullScan { limit: 10 }))
            .await
            .unwrap();
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn enqueue_uses_queue_retry_policy() {
        let storage = Arc::new(test_storage().await);
        let queues = Queues::new(storage.clone(), WorkersConfig::default());

        let payload = JobPayload::Enrich(EnrichJob {
            entity_id: "e1".into(),
            entity_name: "France".into(),
            entity_type: EntityType::Location,
            depth: 1,
        });
        let first = queues.enqueue(payload.clone()).await.unwrap().unwrap();
        let second = queues.enqueue(payload).await.unwrap().unwrap();
        assert_eq!(first.queue, QueueName::Enrich);
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);

        let claimed = storage.claim_job("enrich", 60_000).await.unwrap().unwrap();
        assert_eq!(claimed.max_attempts, 2);
        let job: EnrichJob = serde_json::from_str(&claimed.payload).unwrap();
        assert_eq!(job.entity_name, "France");
    }
}
