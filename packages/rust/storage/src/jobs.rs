//! Durable job table backing the pipeline queues.
//!
//! A job is `pending` until a worker claims it, `active` while its lease is
//! live, and finally `completed` or `failed`. An active job whose lease lapses
//! (worker crashed or stalled) becomes claimable again. Delivery is therefore
//! at-least-once; handlers must be idempotent.

use chrono::Utc;
use libsql::params;
use pedia_shared::{PediaError, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::{Storage, db_err};

/// A job to insert.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub queue: &'a str,
    /// JSON-encoded job payload.
    pub payload: &'a str,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// While a pending or active job holds this key, further enqueues are no-ops.
    pub dedup_key: Option<&'a str>,
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedJob {
    pub id: String,
    /// `true` if an in-flight job with the same dedup key already existed.
    pub deduplicated: bool,
}

/// A claimed job, handed to a worker.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: String,
    /// Attempts including the current one.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled after `delay_ms`.
    Retrying { delay_ms: u64 },
    /// No attempts left.
    Failed,
}

/// Per-status job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Exponential backoff: `base * 2^(attempts_made - 1)`.
pub fn retry_delay_ms(backoff_ms: u64, attempts_made: u32) -> u64 {
    let exponent = attempts_made.saturating_sub(1).min(32);
    backoff_ms.saturating_mul(1u64 << exponent)
}

/// Insert attempts when the in-flight holder of a dedup key keeps finishing
/// between insert and lookup.
const ENQUEUE_RACE_RETRIES: usize = 3;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Storage {
    /// Insert a job, or return the in-flight job already holding its dedup key.
    ///
    /// The partial unique index on `dedup_key` makes concurrent enqueues of
    /// the same key collapse to one row.
    pub async fn enqueue_job(&self, job: &NewJob<'_>) -> Result<EnqueuedJob> {
        self.check_writable()?;

        for _ in 0..ENQUEUE_RACE_RETRIES {
            let id = Uuid::now_v7().to_string();
            let now = now_ms();
            let inserted = self
                .conn
                .execute(
                    "INSERT INTO jobs (id, queue, payload, status, attempts_made, max_attempts,
                                       backoff_ms, run_at, dedup_key, created_at)
                     VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7, ?6)
                     ON CONFLICT DO NOTHING",
                    params![
                        id.as_str(),
                        job.queue,
                        job.payload,
                        job.max_attempts.max(1),
                        job.backoff_ms as i64,
                        now,
                        job.dedup_key
                    ],
                )
                .await
                .map_err(|e| PediaError::Queue(format!("enqueue on {}: {e}", job.queue)))?;

            if inserted > 0 {
                return Ok(EnqueuedJob {
                    id,
                    deduplicated: false,
                });
            }

            let Some(key) = job.dedup_key else {
                return Err(PediaError::Queue(format!(
                    "enqueue on {}: job id collision",
                    job.queue
                )));
            };
            // The holder may finish between the insert and this lookup; if so,
            // the key is free and the insert is retried.
            if let Some(id) = self.in_flight_job_with_key(key).await? {
                return Ok(EnqueuedJob {
                    id,
                    deduplicated: true,
                });
            }
        }

        Err(PediaError::Queue(format!(
            "enqueue on {}: dedup key kept changing hands",
            job.queue
        )))
    }

    async fn in_flight_job_with_key(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM jobs
                 WHERE dedup_key = ?1 AND status IN ('pending', 'active')
                 LIMIT 1",
                params![key],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// Claim the next due job on `queue`, leasing it for `lease_ms`.
    ///
    /// Due means pending with `run_at` in the past, or active with an expired
    /// lease. Active jobs whose lease expired on their final attempt are marked
    /// failed instead of being handed out again.
    pub async fn claim_job(&self, queue: &str, lease_ms: u64) -> Result<Option<JobRecord>> {
        self.check_writable()?;
        let now = now_ms();

        self.conn
            .execute(
                "UPDATE jobs SET status = 'failed', finished_at = ?2, lease_expires_at = NULL,
                                 last_error = 'lease expired on final attempt'
                 WHERE queue = ?1 AND status = 'active' AND lease_expires_at < ?2
                   AND attempts_made >= max_attempts",
                params![queue, now],
            )
            .await
            .map_err(db_err)?;

        let mut rows = self
            .conn
            .query(
                "UPDATE jobs SET status = 'active',
                                 attempts_made = attempts_made + 1,
                                 lease_expires_at = ?3
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE queue = ?1
                       AND ((status = 'pending' AND run_at <= ?2)
                            OR (status = 'active' AND lease_expires_at < ?2))
                     ORDER BY run_at, created_at
                     LIMIT 1
                 )
                 RETURNING id, queue, payload, attempts_made, max_attempts",
                params![queue, now, now + lease_ms as i64],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(JobRecord {
                id: row.get::<String>(0).map_err(db_err)?,
                queue: row.get::<String>(1).map_err(db_err)?,
                payload: row.get::<String>(2).map_err(db_err)?,
                attempts_made: row.get::<u32>(3).map_err(db_err)?,
                max_attempts: row.get::<u32>(4).map_err(db_err)?,
            })),
            None => Ok(None),
        }
    }

    /// Extend the lease of an active job. Returns `false` if the job is no
    /// longer active (completed, failed, or reclaimed).
    pub async fn renew_lease(&self, job_id: &str, lease_ms: u64) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?2 WHERE id = ?1 AND status = 'active'",
                params![job_id, now_ms() + lease_ms as i64],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Mark a job completed, storing its JSON result.
    pub async fn complete_job(&self, job_id: &str, result_json: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE jobs SET status = 'completed', result = ?2, finished_at = ?3,
                                 lease_expires_at = NULL
                 WHERE id = ?1",
                params![job_id, result_json, now_ms()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a failed attempt: reschedule with exponential backoff, or mark
    /// the job failed once its attempts are used up.
    pub async fn fail_job(&self, job_id: &str, error: &str) -> Result<FailOutcome> {
        self.check_writable()?;

        let mut rows = self
            .conn
            .query(
                "SELECT attempts_made, max_attempts, backoff_ms FROM jobs WHERE id = ?1",
                params![job_id],
            )
            .await
            .map_err(db_err)?;
        let row = rows
            .next()
            .await
            .map_err(db_err)?
            .ok_or_else(|| PediaError::NotFound(format!("job {job_id}")))?;
        let attempts_made = row.get::<u32>(0).map_err(db_err)?;
        let max_attempts = row.get::<u32>(1).map_err(db_err)?;
        let backoff_ms = row.get::<i64>(2).map_err(db_err)?.max(0) as u64;

        let now = now_ms();
        if attempts_made < max_attempts {
            let delay_ms = retry_delay_ms(backoff_ms, attempts_made);
            self.conn
                .execute(
                    "UPDATE jobs SET status = 'pending', run_at = ?2, last_error = ?3,
                                     lease_expires_at = NULL
                     WHERE id = ?1",
                    params![job_id, now + delay_ms as i64, error],
                )
                .await
                .map_err(db_err)?;
            Ok(FailOutcome::Retrying { delay_ms })
        } else {
            self.conn
                .execute(
                    "UPDATE jobs SET status = 'failed', last_error = ?2, finished_at = ?3,
                                     lease_expires_at = NULL
                     WHERE id = ?1",
                    params![job_id, error, now],
                )
                .await
                .map_err(db_err)?;
            Ok(FailOutcome::Failed)
        }
    }

    /// Current status of a job, if it exists.
    pub async fn job_status(&self, job_id: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT status FROM jobs WHERE id = ?1", params![job_id])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// Count jobs on `queue` by status.
    pub async fn job_counts(&self, queue: &str) -> Result<JobCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status",
                params![queue],
            )
            .await
            .map_err(db_err)?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status = row.get::<String>(0).map_err(db_err)?;
            let n = row.get::<i64>(1).map_err(db_err)?.max(0) as u64;
            match status.as_str() {
                "pending" => counts.waiting = n,
                "active" => counts.active = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                other => tracing::warn!(status = other, "unknown job status"),
            }
        }
        Ok(counts)
    }

    /// Delete completed jobs that finished more than `older_than_ms` ago.
    /// Failed jobs are kept for inspection.
    pub async fn prune_completed_jobs(&self, older_than_ms: u64) -> Result<u64> {
        self.check_writable()?;
        let cutoff = now_ms() - older_than_ms as i64;
        self.conn
            .execute(
                "DELETE FROM jobs WHERE status = 'completed' AND finished_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_storage;

    fn job<'a>(queue: &'a str, dedup_key: Option<&'a str>) -> NewJob<'a> {
        NewJob {
            queue,
            payload: r#"{"article_id":"a1"}"#,
            max_attempts: 2,
            backoff_ms: 0,
            dedup_key,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(retry_delay_ms(2_000, 1), 2_000);
        assert_eq!(retry_delay_ms(2_000, 2), 4_000);
        assert_eq!(retry_delay_ms(5_000, 3), 20_000);
        assert_eq!(retry_delay_ms(u64::MAX, 10), u64::MAX);
    }

    #[tokio::test]
    async fn claim_complete_lifecycle() {
        let storage = test_storage().await;
        let queued = storage.enqueue_job(&job("extract", None)).await.unwrap();
        assert!(!queued.deduplicated);

        // Other queues do not see it.
        assert!(storage.claim_job("link", 60_000).await.unwrap().is_none());

        let claimed = storage.claim_job("extract", 60_000).await.unwrap().unwrap();
        assert_eq!(claimed.id, queued.id);
        assert_eq!(claimed.attempts_made, 1);
        assert!(storage.claim_job("extract", 60_000).await.unwrap().is_none());

        assert!(storage.renew_lease(&claimed.id, 60_000).await.unwrap());
        storage.complete_job(&claimed.id, r#"{"ok":true}"#).await.unwrap();
        assert!(!storage.renew_lease(&claimed.id, 60_000).await.unwrap());

        let counts = storage.job_counts("extract").await.unwrap();
        assert_eq!(
            counts,
            JobCounts {
                waiting: 0,
                active: 0,
                completed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn failed_attempts_retry_then_fail() {
        let storage = test_storage().await;
        let queued = storage.enqueue_job(&job("enrich", None)).await.unwrap();

        let first = storage.claim_job("enrich", 60_000).await.unwrap().unwrap();
        let outcome = storage.fail_job(&first.id, "boom").await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { delay_ms: 0 });

        let second = storage.claim_job("enrich", 60_000).await.unwrap().unwrap();
        assert_eq!(second.id, queued.id);
        assert_eq!(second.attempts_made, 2);
        let outcome = storage.fail_job(&second.id, "boom again").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        assert!(storage.claim_job("enrich", 60_000).await.unwrap().is_none());
        assert_eq!(
            storage.job_status(&queued.id).await.unwrap().as_deref(),
            Some("failed")
        );
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let storage = test_storage().await;
        let mut delayed = job("link", None);
        delayed.backoff_ms = 60_000;
        storage.enqueue_job(&delayed).await.unwrap();

        let claimed = storage.claim_job("link", 60_000).await.unwrap().unwrap();
        let outcome = storage.fail_job(&claimed.id, "transient").await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { delay_ms: 60_000 });
        assert!(storage.claim_job("link", 60_000).await.unwrap().is_none());
        assert_eq!(storage.job_counts("link").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let storage = test_storage().await;
        let queued = storage.enqueue_job(&job("verify", None)).await.unwrap();

        let first = storage.claim_job("verify", 0).await.unwrap().unwrap();
        assert_eq!(first.id, queued.id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let second = storage.claim_job("verify", 60_000).await.unwrap().unwrap();
        assert_eq!(second.id, queued.id);
        assert_eq!(second.attempts_made, 2);
    }

    #[tokio::test]
    async fn expired_lease_on_final_attempt_fails() {
        let storage = test_storage().await;
        let mut single = job("verify", None);
        single.max_attempts = 1;
        let queued = storage.enqueue_job(&single).await.unwrap();

        storage.claim_job("verify", 0).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(storage.claim_job("verify", 60_000).await.unwrap().is_none());
        assert_eq!(
            storage.job_status(&queued.id).await.unwrap().as_deref(),
            Some("failed")
        );
    }

    #[tokio::test]
    async fn dedup_key_collapses_in_flight_jobs() {
        let storage = test_storage().await;
        let first = storage
            .enqueue_job(&job("enrich", Some("enrich:e1")))
            .await
            .unwrap();
        let second = storage
            .enqueue_job(&job("enrich", Some("enrich:e1")))
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.id, first.id);

        let other = storage
            .enqueue_job(&job("enrich", Some("enrich:e2")))
            .await
            .unwrap();
        assert!(!other.deduplicated);

        // Once finished, the key is free again.
        let claimed = storage.claim_job("enrich", 60_000).await.unwrap().unwrap();
        storage.complete_job(&claimed.id, "{}").await.unwrap();
        let key = if claimed.id == first.id { "enrich:e1" } else { "enrich:e2" };
        let again = storage.enqueue_job(&job("enrich", Some(key))).await.unwrap();
        assert!(!again.deduplicated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_share_one_job() {
        let storage = std::sync::Arc::new(test_storage().await);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..50 {
            for _ in 0..2 {
                let storage = storage.clone();
                tasks.spawn(async move {
                    let key = format!("enrich:e{i}");
                    let queued = storage
                        .enqueue_job(&job("enrich", Some(key.as_str())))
                        .await
                        .unwrap();
                    (i, queued.id)
                });
            }
        }

        let mut ids: std::collections::HashMap<i32, Vec<String>> = Default::default();
        while let Some(joined) = tasks.join_next().await {
            let (i, id) = joined.unwrap();
            ids.entry(i).or_default().push(id);
        }
        assert!(ids.values().all(|pair| pair[0] == pair[1]));
        assert_eq!(storage.job_counts("enrich").await.unwrap().waiting, 50);
    }

    #[tokio::test]
    async fn prune_keeps_recent_and_failed() {
        let storage = test_storage().await;
        storage.enqueue_job(&job("extract", None)).await.unwrap();
        let claimed = storage.claim_job("extract", 60_000).await.unwrap().unwrap();
        storage.complete_job(&claimed.id, "{}").await.unwrap();

        assert_eq!(storage.prune_completed_jobs(3_600_000).await.unwrap(), 0);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(storage.prune_completed_jobs(0).await.unwrap(), 1);
    }
}
