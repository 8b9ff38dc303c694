//! libSQL storage layer: the Pedia content store.
//!
//! The [`Storage`] struct wraps a libSQL database holding articles, entities,
//! article↔entity associations, directed entity relations, article sources,
//! and the durable job table (see [`jobs`]).
//!
//! Every write is an upsert keyed by a unique constraint. The pipeline takes
//! no locks of its own; concurrent writers to the same key are merged by the
//! database.

mod jobs;
mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params, params_from_iter};
use pedia_shared::{
    Article, ArticleEntity, ArticleStatus, Entity, EntityRelation, EntityType, ExtractedEntity,
    PediaError, Result, Source, normalize_name,
};
use uuid::Uuid;

pub use jobs::{EnqueuedJob, FailOutcome, JobCounts, JobRecord, NewJob, retry_delay_ms};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ARTICLE_COLUMNS: &str = "id, slug, title, content, status, created_at, updated_at";

const UPSERT_ENTITY_UPDATE_TYPE: &str = "INSERT INTO entities (id, name, normalized_name, type, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(normalized_name) DO UPDATE SET type = excluded.type
     RETURNING id, name, normalized_name, type";

const UPSERT_ENTITY_KEEP_TYPE: &str = "INSERT INTO entities (id, name, normalized_name, type, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(normalized_name) DO UPDATE SET type = entities.type
     RETURNING id, name, normalized_name, type";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Outcome of a relation upsert.
#[derive(Debug, Clone)]
pub struct RelationUpsert {
    /// The row after the write.
    pub relation: EntityRelation,
    /// `true` if the row was inserted, `false` if an existing row was incremented.
    pub created: bool,
}

/// Everything produced by one generation run, persisted atomically.
#[derive(Debug, Clone)]
pub struct NewArticle<'a> {
    pub slug: &'a str,
    pub title: &'a str,
    pub content: &'a str,
    pub entities: &'a [ExtractedEntity],
    pub sources: &'a [Source],
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PediaError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = connect(&db)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (graph queries, stats).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = connect(&db)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    PediaError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PediaError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Articles
    // -----------------------------------------------------------------------

    /// Insert or update an article keyed by slug.
    pub async fn upsert_article(
        &self,
        slug: &str,
        title: &str,
        content: &str,
        status: ArticleStatus,
    ) -> Result<Article> {
        self.check_writable()?;
        upsert_article_on(&self.conn, slug, title, content, status).await
    }

    /// Get an article by ID.
    pub async fn get_article(&self, id: &str) -> Result<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?1");
        let mut rows = self.conn.query(&sql, params![id]).await.map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_article(&row)?)),
            None => Ok(None),
        }
    }

    /// Find the PUBLISHED article at `slug`, if any.
    pub async fn find_published_by_slug(&self, slug: &str) -> Result<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE slug = ?1 AND status = ?2");
        let mut rows = self
            .conn
            .query(&sql, params![slug, ArticleStatus::Published.as_str()])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_article(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated PUBLISHED articles.
    pub async fn list_recent_published(&self, limit: u32) -> Result<Vec<Article>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE status = ?1
             ORDER BY updated_at DESC LIMIT ?2"
        );
        let rows = self
            .conn
            .query(&sql, params![ArticleStatus::Published.as_str(), limit])
            .await
            .map_err(db_err)?;
        collect_rows(rows, row_to_article).await
    }

    /// PUBLISHED articles, newest first, paginated.
    pub async fn list_published(&self, limit: u32, offset: u32) -> Result<Vec<Article>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE status = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        );
        let rows = self
            .conn
            .query(&sql, params![ArticleStatus::Published.as_str(), limit, offset])
            .await
            .map_err(db_err)?;
        collect_rows(rows, row_to_article).await
    }

    /// Number of PUBLISHED articles.
    pub async fn count_published(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM articles WHERE status = ?1",
            ArticleStatus::Published.as_str(),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Upsert by normalized name: create if absent, else update the type only.
    pub async fn upsert_entity(&self, name: &str, entity_type: EntityType) -> Result<Entity> {
        self.check_writable()?;
        upsert_entity_on(&self.conn, UPSERT_ENTITY_UPDATE_TYPE, name, entity_type).await
    }

    /// Get an entity by ID.
    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, type FROM entities WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_entity(&row)?)),
            None => Ok(None),
        }
    }

    /// Entities, newest first, paginated.
    pub async fn list_entities(&self, limit: u32, offset: u32) -> Result<Vec<Entity>> {
        let rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, type FROM entities
                 ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                params![limit, offset],
            )
            .await
            .map_err(db_err)?;
        collect_rows(rows, row_to_entity).await
    }

    /// Total number of entities.
    pub async fn count_entities(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM entities", params![])
            .await
            .map_err(db_err)?;
        first_count(&mut rows).await
    }

    // -----------------------------------------------------------------------
    // Article ↔ entity associations
    // -----------------------------------------------------------------------

    /// Associate an entity with an article. Relevance is overwritten on re-link.
    pub async fn link_article_entity(
        &self,
        article_id: &str,
        entity_id: &str,
        relevance: f64,
    ) -> Result<()> {
        self.check_writable()?;
        link_article_entity_on(&self.conn, article_id, entity_id, relevance).await
    }

    /// Entities linked to an article, most relevant first.
    pub async fn article_entities(&self, article_id: &str) -> Result<Vec<ArticleEntity>> {
        let rows = self
            .conn
            .query(
                "SELECT ae.article_id, e.id, e.name, e.normalized_name, e.type, ae.relevance
                 FROM article_entities ae
                 JOIN entities e ON e.id = ae.entity_id
                 WHERE ae.article_id = ?1
                 ORDER BY ae.relevance DESC, e.normalized_name",
                params![article_id],
            )
            .await
            .map_err(db_err)?;

        collect_rows(rows, |row| {
            Ok(ArticleEntity {
                article_id: row.get::<String>(0).map_err(db_err)?,
                entity: Entity {
                    id: row.get::<String>(1).map_err(db_err)?,
                    name: row.get::<String>(2).map_err(db_err)?,
                    normalized_name: row.get::<String>(3).map_err(db_err)?,
                    entity_type: parse_entity_type(&row.get::<String>(4).map_err(db_err)?)?,
                },
                relevance: row.get::<f64>(5).map_err(db_err)?,
            })
        })
        .await
    }

    /// Every `(article_id, entity_id)` pair.
    pub async fn all_article_entity_pairs(&self) -> Result<Vec<(String, String)>> {
        let rows = self
            .conn
            .query("SELECT article_id, entity_id FROM article_entities", params![])
            .await
            .map_err(db_err)?;
        collect_rows(rows, |row| {
            Ok((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<String>(1).map_err(db_err)?,
            ))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Entity relations
    // -----------------------------------------------------------------------

    /// Upsert a directed relation: insert at `create_strength`, or add
    /// `increment` to the strength of the existing `(from, to, type)` row.
    pub async fn upsert_relation(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        relation_type: &str,
        create_strength: f64,
        increment: f64,
    ) -> Result<RelationUpsert> {
        self.check_writable()?;
        if from_entity_id == to_entity_id {
            return Err(PediaError::validation(format!(
                "refusing self-relation on entity {from_entity_id}"
            )));
        }

        let new_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "INSERT INTO entity_relations (id, from_entity_id, to_entity_id, type, strength, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(from_entity_id, to_entity_id, type) DO UPDATE SET
                   strength = entity_relations.strength + ?7,
                   updated_at = ?6
                 RETURNING id, from_entity_id, to_entity_id, type, strength",
                params![
                    new_id.as_str(),
                    from_entity_id,
                    to_entity_id,
                    relation_type,
                    create_strength,
                    now.as_str(),
                    increment,
                ],
            )
            .await
            .map_err(db_err)?;

        let row = rows
            .next()
            .await
            .map_err(db_err)?
            .ok_or_else(|| PediaError::Storage("relation upsert returned no row".into()))?;
        let relation = row_to_relation(&row)?;
        let created = relation.id == new_id;
        Ok(RelationUpsert { relation, created })
    }

    /// Look up one directed relation.
    pub async fn find_relation(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        relation_type: &str,
    ) -> Result<Option<EntityRelation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, from_entity_id, to_entity_id, type, strength FROM entity_relations
                 WHERE from_entity_id = ?1 AND to_entity_id = ?2 AND type = ?3",
                params![from_entity_id, to_entity_id, relation_type],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_relation(&row)?)),
            None => Ok(None),
        }
    }

    /// Every relation with either endpoint in `entity_ids`.
    pub async fn relations_touching(&self, entity_ids: &[String]) -> Result<Vec<EntityRelation>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=entity_ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, from_entity_id, to_entity_id, type, strength FROM entity_relations
             WHERE from_entity_id IN ({placeholders}) OR to_entity_id IN ({placeholders})
             ORDER BY id"
        );

        let rows = self
            .conn
            .query(&sql, params_from_iter(entity_ids.iter().map(String::as_str)))
            .await
            .map_err(db_err)?;
        collect_rows(rows, row_to_relation).await
    }

    /// Every relation in the graph.
    pub async fn all_relations(&self) -> Result<Vec<EntityRelation>> {
        let rows = self
            .conn
            .query(
                "SELECT id, from_entity_id, to_entity_id, type, strength FROM entity_relations ORDER BY id",
                params![],
            )
            .await
            .map_err(db_err)?;
        collect_rows(rows, row_to_relation).await
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Sources recorded for an article.
    pub async fn article_sources(&self, article_id: &str) -> Result<Vec<Source>> {
        let rows = self
            .conn
            .query(
                "SELECT title, url, snippet FROM sources WHERE article_id = ?1 ORDER BY id",
                params![article_id],
            )
            .await
            .map_err(db_err)?;
        collect_rows(rows, |row| {
            Ok(Source {
                title: row.get::<String>(0).map_err(db_err)?,
                url: row.get::<String>(1).map_err(db_err)?,
                snippet: row.get::<String>(2).unwrap_or_default(),
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Atomic persistence of a generated article
    // -----------------------------------------------------------------------

    /// Persist a generated article with its entities and sources in one
    /// transaction. Either everything is written or nothing is.
    ///
    /// Runs on a dedicated connection so statements issued concurrently on the
    /// shared handle cannot land inside the transaction.
    pub async fn persist_generated_article(&self, article: &NewArticle<'_>) -> Result<Article> {
        self.check_writable()?;

        let conn = connect(&self.db)?;
        let tx = conn.transaction().await.map_err(db_err)?;

        match persist_in(&tx, article).await {
            Ok(saved) => {
                tx.commit().await.map_err(db_err)?;
                Ok(saved)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn count(&self, sql: &str, arg: &str) -> Result<u64> {
        let mut rows = self.conn.query(sql, params![arg]).await.map_err(db_err)?;
        first_count(&mut rows).await
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared by the plain and transactional paths)
// ---------------------------------------------------------------------------

fn connect(db: &Database) -> Result<Connection> {
    let conn = db.connect().map_err(db_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
    Ok(conn)
}

async fn persist_in(conn: &Connection, article: &NewArticle<'_>) -> Result<Article> {
    let saved = upsert_article_on(
        conn,
        article.slug,
        article.title,
        article.content,
        ArticleStatus::Published,
    )
    .await?;

    for extracted in article.entities {
        let entity =
            upsert_entity_on(conn, UPSERT_ENTITY_KEEP_TYPE, &extracted.name, extracted.entity_type)
                .await?;
        link_article_entity_on(conn, &saved.id, &entity.id, extracted.relevance).await?;
    }

    conn.execute("DELETE FROM sources WHERE article_id = ?1", params![saved.id.as_str()])
        .await
        .map_err(db_err)?;
    for source in article.sources {
        conn.execute(
            "INSERT INTO sources (article_id, title, url, snippet) VALUES (?1, ?2, ?3, ?4)",
            params![
                saved.id.as_str(),
                source.title.as_str(),
                source.url.as_str(),
                source.snippet.as_str()
            ],
        )
        .await
        .map_err(db_err)?;
    }

    Ok(saved)
}

async fn upsert_article_on(
    conn: &Connection,
    slug: &str,
    title: &str,
    content: &str,
    status: ArticleStatus,
) -> Result<Article> {
    if slug.is_empty() {
        return Err(PediaError::validation("article slug is empty"));
    }

    let id = Uuid::now_v7().to_string();
    let now = Utc::now().to_rfc3339();
    let sql = format!(
        "INSERT INTO articles (id, slug, title, content, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(slug) DO UPDATE SET
           content = excluded.content,
           status = excluded.status,
           updated_at = excluded.updated_at
         RETURNING {ARTICLE_COLUMNS}"
    );
    let mut rows = conn
        .query(
            &sql,
            params![id.as_str(), slug, title, content, status.as_str(), now.as_str()],
        )
        .await
        .map_err(db_err)?;

    let row = rows
        .next()
        .await
        .map_err(db_err)?
        .ok_or_else(|| PediaError::Storage("article upsert returned no row".into()))?;
    row_to_article(&row)
}

async fn upsert_entity_on(
    conn: &Connection,
    sql: &str,
    name: &str,
    entity_type: EntityType,
) -> Result<Entity> {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        return Err(PediaError::validation("entity name is empty"));
    }

    let id = Uuid::now_v7().to_string();
    let now = Utc::now().to_rfc3339();
    let mut rows = conn
        .query(
            sql,
            params![
                id.as_str(),
                name.trim(),
                normalized.as_str(),
                entity_type.as_str(),
                now.as_str()
            ],
        )
        .await
        .map_err(db_err)?;

    let row = rows
        .next()
        .await
        .map_err(db_err)?
        .ok_or_else(|| PediaError::Storage("entity upsert returned no row".into()))?;
    row_to_entity(&row)
}

async fn link_article_entity_on(
    conn: &Connection,
    article_id: &str,
    entity_id: &str,
    relevance: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO article_entities (article_id, entity_id, relevance)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(article_id, entity_id) DO UPDATE SET relevance = excluded.relevance",
        params![article_id, entity_id, relevance],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> PediaError {
    PediaError::Storage(e.to_string())
}

async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: impl Fn(&libsql::Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(map(&row)?);
    }
    Ok(results)
}

async fn first_count(rows: &mut libsql::Rows) -> Result<u64> {
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
        None => Ok(0),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PediaError::Storage(format!("invalid date: {e}")))
}

fn parse_entity_type(s: &str) -> Result<EntityType> {
    s.parse().map_err(PediaError::Storage)
}

fn row_to_article(row: &libsql::Row) -> Result<Article> {
    Ok(Article {
        id: row.get::<String>(0).map_err(db_err)?,
        slug: row.get::<String>(1).map_err(db_err)?,
        title: row.get::<String>(2).map_err(db_err)?,
        content: row.get::<String>(3).map_err(db_err)?,
        status: row
            .get::<String>(4)
            .map_err(db_err)?
            .parse()
            .map_err(PediaError::Storage)?,
        created_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

fn row_to_entity(row: &libsql::Row) -> Result<Entity> {
    Ok(Entity {
        id: row.get::<String>(0).map_err(db_err)?,
        name: row.get::<String>(1).map_err(db_err)?,
        normalized_name: row.get::<String>(2).map_err(db_err)?,
        entity_type: parse_entity_type(&row.get::<String>(3).map_err(db_err)?)?,
    })
}

fn row_to_relation(row: &libsql::Row) -> Result<EntityRelation> {
    Ok(EntityRelation {
        id: row.get::<String>(0).map_err(db_err)?,
        from_entity_id: row.get::<String>(1).map_err(db_err)?,
        to_entity_id: row.get::<String>(2).map_err(db_err)?,
        relation_type: row.get::<String>(3).map_err(db_err)?,
        strength: row.get::<f64>(4).map_err(db_err)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pedia_shared::RELATED_TO;

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pedia_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 3);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("pedia_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 3);
    }

    #[tokio::test]
    async fn article_upsert_by_slug() {
        let storage = test_storage().await;
        let first = storage
            .upsert_article("paris", "Paris", "draft text", ArticleStatus::Draft)
            .await
            .expect("insert");
        assert!(storage.find_published_by_slug("paris").await.unwrap().is_none());

        let second = storage
            .upsert_article("paris", "Paris", "final text", ArticleStatus::Published)
            .await
            .expect("update");
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "final text");

        let found = storage.find_published_by_slug("paris").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(storage.count_published().await.unwrap(), 1);
        assert_eq!(storage.list_recent_published(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entity_identity_is_normalized_name() {
        let storage = test_storage().await;
        let a = storage
            .upsert_entity("Marie Curie", EntityType::Other)
            .await
            .unwrap();
        let b = storage
            .upsert_entity("marie curie ", EntityType::Person)
            .await
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.name, "Marie Curie");
        assert_eq!(b.entity_type, EntityType::Person);
        assert_eq!(storage.count_entities().await.unwrap(), 1);

        let found = storage.get_entity(&a.id).await.unwrap().unwrap();
        assert_eq!(found.normalized_name, "marie curie");
    }

    #[tokio::test]
    async fn empty_entity_name_rejected() {
        let storage = test_storage().await;
        let result = storage.upsert_entity("   ", EntityType::Other).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn relevance_is_overwritten_on_relink() {
        let storage = test_storage().await;
        let article = storage
            .upsert_article("a", "A", "text", ArticleStatus::Published)
            .await
            .unwrap();
        let entity = storage.upsert_entity("Paris", EntityType::Location).await.unwrap();

        storage.link_article_entity(&article.id, &entity.id, 0.9).await.unwrap();
        storage.link_article_entity(&article.id, &entity.id, 0.4).await.unwrap();

        let linked = storage.article_entities(&article.id).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert!((linked[0].relevance - 0.4).abs() < 1e-9);
        assert_eq!(storage.all_article_entity_pairs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn relation_upsert_creates_then_increments() {
        let storage = test_storage().await;
        let a = storage.upsert_entity("A", EntityType::Other).await.unwrap();
        let b = storage.upsert_entity("B", EntityType::Other).await.unwrap();

        let first = storage
            .upsert_relation(&a.id, &b.id, RELATED_TO, 0.5, 0.1)
            .await
            .unwrap();
        assert!(first.created);
        assert!((first.relation.strength - 0.5).abs() < 1e-9);

        let second = storage
            .upsert_relation(&a.id, &b.id, RELATED_TO, 0.5, 0.1)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.relation.id, first.relation.id);
        assert!((second.relation.strength - 0.6).abs() < 1e-9);

        // Reverse direction is a distinct row.
        let reverse = storage
            .upsert_relation(&b.id, &a.id, RELATED_TO, 0.5, 0.1)
            .await
            .unwrap();
        assert!(reverse.created);
        assert_eq!(storage.all_relations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn self_relation_rejected() {
        let storage = test_storage().await;
        let a = storage.upsert_entity("A", EntityType::Other).await.unwrap();
        assert!(
            storage
                .upsert_relation(&a.id, &a.id, RELATED_TO, 0.5, 0.1)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn relations_touching_either_direction() {
        let storage = test_storage().await;
        let a = storage.upsert_entity("A", EntityType::Other).await.unwrap();
        let b = storage.upsert_entity("B", EntityType::Other).await.unwrap();
        let c = storage.upsert_entity("C", EntityType::Other).await.unwrap();
        let d = storage.upsert_entity("D", EntityType::Other).await.unwrap();

        storage.upsert_relation(&a.id, &b.id, RELATED_TO, 0.5, 0.1).await.unwrap();
        storage.upsert_relation(&c.id, &a.id, RELATED_TO, 0.5, 0.1).await.unwrap();
        storage.upsert_relation(&c.id, &d.id, RELATED_TO, 0.5, 0.1).await.unwrap();

        let touching_a = storage.relations_touching(&[a.id.clone()]).await.unwrap();
        assert_eq!(touching_a.len(), 2);

        let touching_bd = storage
            .relations_touching(&[b.id.clone(), d.id.clone()])
            .await
            .unwrap();
        assert_eq!(touching_bd.len(), 2);

        assert!(storage.relations_touching(&[]).await.unwrap().is_empty());
        assert!(
            storage
                .find_relation(&b.id, &a.id, RELATED_TO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn persist_generated_article_writes_everything() {
        let storage = test_storage().await;
        let entities = vec![
            ExtractedEntity {
                name: "Paris".into(),
                entity_type: EntityType::Location,
                relevance: 0.9,
            },
            ExtractedEntity {
                name: "Seine".into(),
                entity_type: EntityType::Location,
                relevance: 0.6,
            },
        ];
        let sources = vec![Source {
            title: "Paris - Wikipedia".into(),
            url: "https://en.wikipedia.org/wiki/Paris".into(),
            snippet: "Paris is the capital of France.".into(),
        }];

        let saved = storage
            .persist_generated_article(&NewArticle {
                slug: "paris",
                title: "Paris",
                content: "Paris is a city.",
                entities: &entities,
                sources: &sources,
            })
            .await
            .expect("persist");

        assert_eq!(saved.status, ArticleStatus::Published);
        assert_eq!(storage.article_entities(&saved.id).await.unwrap().len(), 2);
        assert_eq!(storage.article_sources(&saved.id).await.unwrap(), sources);
    }

    #[tokio::test]
    async fn persist_generated_article_is_all_or_nothing() {
        let storage = test_storage().await;
        let entities = vec![
            ExtractedEntity {
                name: "Valid".into(),
                entity_type: EntityType::Concept,
                relevance: 0.8,
            },
            ExtractedEntity {
                name: "  ".into(),
                entity_type: EntityType::Concept,
                relevance: 0.8,
            },
        ];

        let result = storage
            .persist_generated_article(&NewArticle {
                slug: "broken",
                title: "Broken",
                content: "text",
                entities: &entities,
                sources: &[],
            })
            .await;

        assert!(result.is_err());
        assert!(storage.find_published_by_slug("broken").await.unwrap().is_none());
        assert_eq!(storage.count_entities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("pedia_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.upsert_entity("A", EntityType::Other).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.count_entities().await.unwrap(), 1);
        let result = ro.upsert_entity("B", EntityType::Other).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
