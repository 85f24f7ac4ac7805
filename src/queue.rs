//! Durable job queue (C6): FIFO-per-kind, atomic claim, at-least-once delivery.
//!
//! Grounded on the claim-via-`UPDATE ... RETURNING`-with-rows-affected-check
//! idiom and the retry-on-UNIQUE-collision create loop.

use crate::domain::{Job, JobKind, JobStatus};
use crate::error::{QueueError, Result};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};
use uuid::Uuid;

const MAX_CREATE_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enqueue a new job. Retries a handful of times on a job_id UUID
    /// collision, mirroring the create-retry loop used elsewhere for
    /// generated primary keys.
    pub async fn enqueue(&self, kind: JobKind, payload: &serde_json::Value) -> Result<String> {
        let payload_json = serde_json::to_string(payload).context("failed to serialize job payload")?;

        for attempt in 1..=MAX_CREATE_RETRIES {
            let job_id = Uuid::new_v4().to_string();
            let result = sqlx::query(
                r#"
                INSERT INTO jobs (job_id, kind, payload_json, status, attempts, enqueued_at)
                VALUES (?, ?, ?, 'pending', 0, ?)
                "#,
            )
            .bind(&job_id)
            .bind(kind.as_str())
            .bind(&payload_json)
            .bind(chrono::Utc::now())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    #[cfg(feature = "metrics")]
                    crate::telemetry::metrics::METRICS
                        .jobs_enqueued
                        .with_label_values(&[kind.as_str()])
                        .inc();
                    return Ok(job_id);
                }
                Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("2067") => {
                    if attempt == MAX_CREATE_RETRIES {
                        return Err(QueueError::Database(sqlx::Error::Database(db_err)).into());
                    }
                    continue;
                }
                Err(e) => return Err(QueueError::Database(e).into()),
            }
        }

        unreachable!("loop returns or errors on every iteration")
    }

    /// Atomically claim the oldest pending job among `kinds`, FIFO within
    /// each kind. Returns `None` if nothing is ready.
    pub async fn claim_next(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let placeholders = kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let select_sql = format!(
            "SELECT job_id FROM jobs WHERE status = 'pending' AND kind IN ({placeholders}) \
             ORDER BY enqueued_at ASC LIMIT 1"
        );

        loop {
            let mut query = sqlx::query(&select_sql);
            for kind in kinds {
                query = query.bind(kind.as_str());
            }
            let candidate: Option<String> = query
                .fetch_optional(&self.pool)
                .await
                .context("failed to select next pending job")?
                .map(|row| row.try_get::<String, _>("job_id"))
                .transpose()
                .context("job_id")?;

            let Some(job_id) = candidate else {
                return Ok(None);
            };

            let updated = sqlx::query(
                r#"
                UPDATE jobs SET status = 'in_progress', claimed_at = ?, attempts = attempts + 1
                WHERE job_id = ? AND status = 'pending'
                "#,
            )
            .bind(chrono::Utc::now())
            .bind(&job_id)
            .execute(&self.pool)
            .await
            .context("failed to claim job")?;

            if updated.rows_affected() == 0 {
                // Lost the race to another worker; try the next candidate.
                continue;
            }

            return self.get(&job_id).await;
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT job_id, kind, payload_json, status, attempts, enqueued_at, claimed_at FROM jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch job {job_id}"))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    pub async fn complete(&self, job_id: &str) -> Result<()> {
        let job = self.get(job_id).await?;
        let updated = sqlx::query("UPDATE jobs SET status = 'done' WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to complete job {job_id}"))?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id.to_string()).into());
        }

        #[cfg(feature = "metrics")]
        if let Some(job) = job {
            crate::telemetry::metrics::METRICS
                .jobs_completed
                .with_label_values(&[job.kind.as_str()])
                .inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = job;

        Ok(())
    }

    /// Mark a job failed. `requeue` puts it back to `pending` for another
    /// attempt; otherwise it is terminally `failed`.
    pub async fn fail(&self, job_id: &str, requeue: bool) -> Result<()> {
        let job = self.get(job_id).await?;
        let status = if requeue { "pending" } else { "failed" };
        let updated = sqlx::query("UPDATE jobs SET status = ?, claimed_at = NULL WHERE job_id = ?")
            .bind(status)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark job {job_id} as {status}"))?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id.to_string()).into());
        }

        #[cfg(feature = "metrics")]
        if !requeue {
            if let Some(job) = job {
                crate::telemetry::metrics::METRICS
                    .jobs_failed
                    .with_label_values(&[job.kind.as_str()])
                    .inc();
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = job;

        Ok(())
    }

    /// Reclaim jobs stuck `in_progress` past `stale_after_secs`, returning
    /// them to `pending` for redelivery. Returns the number reclaimed.
    pub async fn reclaim_stale(&self, stale_after_secs: u64) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(stale_after_secs as i64);
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'pending', claimed_at = NULL \
             WHERE status = 'in_progress' AND claimed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("failed to reclaim stale jobs")?;
        Ok(updated.rows_affected())
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let kind_str: String = row.try_get("kind").context("kind")?;
    let status_str: String = row.try_get("status").context("status")?;
    let payload_json: String = row.try_get("payload_json").context("payload_json")?;

    Ok(Job {
        job_id: row.try_get("job_id").context("job_id")?,
        kind: JobKind::parse(&kind_str).with_context(|| format!("invalid job kind: {kind_str}"))?,
        payload: serde_json::from_str(&payload_json).context("invalid job payload json")?,
        status: JobStatus::parse(&status_str)
            .with_context(|| format!("invalid job status: {status_str}"))?,
        attempts: row.try_get("attempts").context("attempts")?,
        enqueued_at: row.try_get("enqueued_at").context("enqueued_at")?,
        claimed_at: row.try_get("claimed_at").ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    async fn setup() -> JobQueue {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        schema::bootstrap(&pool).await.expect("schema bootstrap");
        JobQueue::new(pool)
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trip() {
        let queue = setup().await;
        let payload = serde_json::json!({"group_id": "G"});
        let job_id = queue.enqueue(JobKind::BufferUpdate, &payload).await.unwrap();

        let claimed = queue
            .claim_next(&[JobKind::BufferUpdate])
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(claimed.job_id, job_id);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn claim_respects_fifo_order_within_kind() {
        let queue = setup().await;
        let first = queue
            .enqueue(JobKind::MaybeRespond, &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let _second = queue
            .enqueue(JobKind::MaybeRespond, &serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let claimed = queue.claim_next(&[JobKind::MaybeRespond]).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, first);
    }

    #[tokio::test]
    async fn claim_returns_none_when_empty() {
        let queue = setup().await;
        assert!(queue.claim_next(&[JobKind::SyncRag]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_claimed_job_is_not_claimed_twice() {
        let queue = setup().await;
        queue
            .enqueue(JobKind::HistoryLink, &serde_json::json!({}))
            .await
            .unwrap();
        let first = queue.claim_next(&[JobKind::HistoryLink]).await.unwrap();
        assert!(first.is_some());
        let second = queue.claim_next(&[JobKind::HistoryLink]).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn complete_and_fail_transition_status() {
        let queue = setup().await;
        let job_id = queue
            .enqueue(JobKind::HistorySync, &serde_json::json!({}))
            .await
            .unwrap();
        queue.claim_next(&[JobKind::HistorySync]).await.unwrap();
        queue.complete(&job_id).await.unwrap();
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn fail_with_requeue_makes_job_claimable_again() {
        let queue = setup().await;
        let job_id = queue
            .enqueue(JobKind::BufferUpdate, &serde_json::json!({}))
            .await
            .unwrap();
        queue.claim_next(&[JobKind::BufferUpdate]).await.unwrap();
        queue.fail(&job_id, true).await.unwrap();

        let reclaimed = queue.claim_next(&[JobKind::BufferUpdate]).await.unwrap();
        assert_eq!(reclaimed.unwrap().job_id, job_id);
    }

    #[tokio::test]
    async fn reclaim_stale_returns_abandoned_in_progress_jobs_to_pending() {
        let queue = setup().await;
        let job_id = queue
            .enqueue(JobKind::BufferUpdate, &serde_json::json!({}))
            .await
            .unwrap();
        queue.claim_next(&[JobKind::BufferUpdate]).await.unwrap();

        // Not yet stale: a long staleness window leaves it in_progress.
        let reclaimed = queue.reclaim_stale(3600).await.unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(queue.get(&job_id).await.unwrap().unwrap().status, JobStatus::InProgress);

        // Backdate the claim past a zero-second staleness window and reclaim.
        sqlx::query("UPDATE jobs SET claimed_at = ? WHERE job_id = ?")
            .bind(chrono::Utc::now() - chrono::Duration::seconds(10))
            .bind(&job_id)
            .execute(&queue.pool)
            .await
            .unwrap();

        let reclaimed = queue.reclaim_stale(1).await.unwrap();
        assert_eq!(reclaimed, 1);
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_at.is_none());
    }
}
