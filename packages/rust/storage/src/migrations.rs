//! SQL migration definitions for the Pedia database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Corpus schema: articles, entities, article_entities, entity_relations, sources",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS articles (
    id         TEXT PRIMARY KEY,
    slug       TEXT NOT NULL UNIQUE,
    title      TEXT NOT NULL,
    content    TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_articles_status_updated ON articles(status, updated_at);

-- normalized_name is the identity of an entity
CREATE TABLE IF NOT EXISTS entities (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    normalized_name TEXT NOT NULL UNIQUE,
    type            TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS article_entities (
    article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
    entity_id  TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relevance  REAL NOT NULL,
    PRIMARY KEY (article_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_article_entities_entity ON article_entities(entity_id);

-- Directed: (a, b, T) and (b, a, T) are distinct rows
CREATE TABLE IF NOT EXISTS entity_relations (
    id             TEXT PRIMARY KEY,
    from_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    to_entity_id   TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    type           TEXT NOT NULL,
    strength       REAL NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE(from_entity_id, to_entity_id, type)
);

CREATE INDEX IF NOT EXISTS idx_relations_from ON entity_relations(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_to ON entity_relations(to_entity_id);

CREATE TABLE IF NOT EXISTS sources (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
    title      TEXT NOT NULL,
    url        TEXT NOT NULL,
    snippet    TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_sources_article ON sources(article_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Durable job queue",
            sql: r#"
-- Times are unix milliseconds so due/lease checks compare numerically
CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    queue            TEXT NOT NULL,
    payload          TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    attempts_made    INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    backoff_ms       INTEGER NOT NULL,
    run_at           INTEGER NOT NULL,
    lease_expires_at INTEGER,
    dedup_key        TEXT,
    last_error       TEXT,
    result           TEXT,
    created_at       INTEGER NOT NULL,
    finished_at      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, status, run_at);
CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(dedup_key, status);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "At most one in-flight job per dedup key",
            sql: r#"
UPDATE jobs
   SET status = 'failed', last_error = 'duplicate of an in-flight job', lease_expires_at = NULL
 WHERE dedup_key IS NOT NULL
   AND status IN ('pending', 'active')
   AND id NOT IN (
       SELECT MIN(id) FROM jobs
        WHERE dedup_key IS NOT NULL AND status IN ('pending', 'active')
        GROUP BY dedup_key
   );

DROP INDEX IF EXISTS idx_jobs_dedup;
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_inflight_dedup
    ON jobs(dedup_key) WHERE status IN ('pending', 'active');

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
