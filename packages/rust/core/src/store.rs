//! The content-store seam used by the pipeline stages.
//!
//! [`Storage`] is the only production implementation; the trait exists so
//! stage tests can wrap it and inject failures.

use async_trait::async_trait;

use pedia_shared::{Article, ArticleEntity, Entity, EntityRelation, EntityType, Result};
use pedia_storage::{NewArticle, RelationUpsert, Storage};

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_published_by_slug(&self, slug: &str) -> Result<Option<Article>>;
    async fn list_recent_published(&self, limit: u32) -> Result<Vec<Article>>;
    async fn count_published(&self) -> Result<u64>;
    async fn upsert_entity(&self, name: &str, entity_type: EntityType) -> Result<Entity>;
    async fn link_article_entity(
        &self,
        article_id: &str,
        entity_id: &str,
        relevance: f64,
    ) -> Result<()>;
    async fn article_entities(&self, article_id: &str) -> Result<Vec<ArticleEntity>>;
    async fn upsert_relation(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        relation_type: &str,
        create_strength: f64,
        increment: f64,
    ) -> Result<RelationUpsert>;
    async fn relations_touching(&self, entity_ids: &[String]) -> Result<Vec<EntityRelation>>;
    async fn persist_generated_article(&self, article: &NewArticle<'_>) -> Result<Article>;
}

#[async_trait]
impl ContentStore for Storage {
    async fn find_published_by_slug(&self, slug: &str) -> Result<Option<Article>> {
        Storage::find_published_by_slug(self, slug).await
    }

    async fn list_recent_published(&self, limit: u32) -> Result<Vec<Article>> {
        Storage::list_recent_published(self, limit).await
    }

    async fn count_published(&self) -> Result<u64> {
        Storage::count_published(self).await
    }

    async fn upsert_entity(&self, name: &str, entity_type: EntityType) -> Result<Entity> {
        Storage::upsert_entity(self, name, entity_type).await
    }

    async fn link_article_entity(
        &self,
        article_id: &str,
        entity_id: &str,
        relevance: f64,
    ) -> Result<()> {
        Storage::link_article_entity(self, article_id, entity_id, relevance).await
    }

    async fn article_entities(&self, article_id: &str) -> Result<Vec<ArticleEntity>> {
        Storage::article_entities(self, article_id).await
    }

    async fn upsert_relation(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        relation_type: &str,
        create_strength: f64,
        increment: f64,
    ) -> Result<RelationUpsert> {
        Storage::upsert_relation(
            self,
            from_entity_id,
            to_entity_id,
            relation_type,
            create_strength,
            increment,
        )
        .await
    }

    async fn relations_touching(&self, entity_ids: &[String]) -> Result<Vec<EntityRelation>> {
        Storage::relations_touching(self, entity_ids).await
    }

    async fn persist_generated_article(&self, article: &NewArticle<'_>) -> Result<Article> {
        Storage::persist_generated_article(self, article).await
    }
}
