//! In-crate fakes of the pipeline collaborators.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use pedia_shared::{
    Article, ArticleEntity, ArticleStatus, Entity, EntityRelation, EntityType, ExtractedEntity,
    PediaError, Result, Source,
};
use pedia_storage::{NewArticle, RelationUpsert, Storage};

use crate::generation::{ArticleGenerator, GeneratedArticle};
use crate::progress::ProgressSink;
use crate::queue::{JobHandle, JobPayload, JobQueue, QueueName};
use crate::store::ContentStore;

/// Fresh temp-file storage.
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("pedia_core_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// Insert a PUBLISHED article at `slug`.
pub(crate) async fn published_article(storage: &Storage, slug: &str) -> Article {
    storage
        .upsert_article(slug, slug, "existing article", ArticleStatus::Published)
        .await
        .expect("insert article")
}

pub(crate) fn extracted(name: &str, entity_type: EntityType, relevance: f64) -> ExtractedEntity {
    ExtractedEntity {
        name: name.into(),
        entity_type,
        relevance,
    }
}

/// Queue that records every payload instead of persisting it.
#[derive(Default)]
pub(crate) struct RecordingQueue {
    jobs: Mutex<Vec<JobPayload>>,
}

impl RecordingQueue {
    pub(crate) fn jobs(&self) -> Vec<JobPayload> {
        self.jobs.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, queue: QueueName) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.queue() == queue)
            .count()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<Option<JobHandle>> {
        let queue = payload.queue();
        self.jobs.lock().unwrap().push(payload);
        Ok(Some(JobHandle {
            id: Uuid::now_v7().to_string(),
            queue,
            deduplicated: false,
        }))
    }
}

/// Generator returning a fixed article and counting calls.
pub(crate) struct ScriptedGenerator {
    content: String,
    entities: Vec<ExtractedEntity>,
    fail: bool,
    pub(crate) calls: AtomicUsize,
    pub(crate) queries: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub(crate) fn new(content: &str, entities: Vec<ExtractedEntity>) -> Self {
        Self {
            content: content.into(),
            entities,
            fail: false,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("", Vec::new())
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArticleGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        query: &str,
        _progress: &dyn ProgressSink,
    ) -> Result<GeneratedArticle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(PediaError::Generation("scripted failure".into()));
        }
        Ok(GeneratedArticle {
            content: self.content.clone(),
            entities: self.entities.clone(),
            sources: vec![Source {
                title: "Example".into(),
                url: "https://example.org".into(),
                snippet: String::new(),
            }],
        })
    }
}

/// Store wrapper whose Nth relation upsert (1-based) fails.
pub(crate) struct FailingStore {
    pub(crate) inner: Storage,
    fail_on_relation: usize,
    relation_calls: AtomicUsize,
}

impl FailingStore {
    pub(crate) fn new(inner: Storage, fail_on_relation: usize) -> Self {
        Self {
            inner,
            fail_on_relation,
            relation_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ContentStore for FailingStore {
    async fn find_published_by_slug(&self, slug: &str) -> Result<Option<Article>> {
        self.inner.find_published_by_slug(slug).await
    }

    async fn list_recent_published(&self, limit: u32) -> Result<Vec<Article>> {
        self.inner.list_recent_published(limit).await
    }

    async fn count_published(&self) -> Result<u64> {
        self.inner.count_published().await
    }

    async fn upsert_entity(&self, name: &str, entity_type: EntityType) -> Result<Entity> {
        self.inner.upsert_entity(name, entity_type).await
    }

    async fn link_article_entity(
        &self,
        article_id: &str,
        entity_id: &str,
        relevance: f64,
    ) -> Result<()> {
        self.inner
            .link_article_entity(article_id, entity_id, relevance)
            .await
    }

    async fn article_entities(&self, article_id: &str) -> Result<Vec<ArticleEntity>> {
        self.inner.article_entities(article_id).await
    }

    async fn upsert_relation(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        relation_type: &str,
        create_strength: f64,
        increment: f64,
    ) -> Result<RelationUpsert> {
        let call = self.relation_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_relation {
            return Err(PediaError::Storage(format!("injected failure on upsert #{call}")));
        }
        self.inner
            .upsert_relation(
                from_entity_id,
                to_entity_id,
                relation_type,
                create_strength,
                increment,
            )
            .await
    }

    async fn relations_touching(&self, entity_ids: &[String]) -> Result<Vec<EntityRelation>> {
        self.inner.relations_touching(entity_ids).await
    }

    async fn persist_generated_article(&self, article: &NewArticle<'_>) -> Result<Article> {
        self.inner.persist_generated_article(article).await
    }
}
