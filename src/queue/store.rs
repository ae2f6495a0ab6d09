use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;

use super::job::{backoff_delay, Job, DEFAULT_MAX_ATTEMPTS};

const COMPLETED_RETENTION_HOURS: i64 = 24;
const DEAD_RETENTION_DAYS: i64 = 7;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    name: String,
    data: String,
    attempts: i64,
    max_attempts: i64,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = crate::error::AppError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            data: serde_json::from_str(&row.data)?,
            id: row.id,
            queue: row.queue,
            name: row.name,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            run_at: row.run_at,
            created_at: row.created_at,
        })
    }
}

/// At-least-once job storage on the shared SQLite pool. Claims are
/// lease-based: an active job is invisible to sibling workers until it
/// completes, fails, or stalls past the lease timeout.
#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, data))]
    pub async fn enqueue<T: Serialize>(&self, queue: &str, name: &str, data: &T) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, name, data, status, attempts, max_attempts, run_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(name)
        .bind(serde_json::to_string(data)?)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(queue = queue, job = name, id = %id, "Enqueued job");
        Ok(id)
    }

    /// Atomically claim the oldest due pending job in a queue. The claim
    /// increments the delivery-attempt counter and takes the lease.
    #[tracing::instrument(skip(self))]
    pub async fn claim_next(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'active', locked_at = ?, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND status = 'pending' AND run_at <= ?
                ORDER BY run_at, created_at
                LIMIT 1
            )
            RETURNING id, queue, name, data, attempts, max_attempts, run_at, created_at
            "#,
        )
        .bind(now)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'completed', locked_at = NULL, completed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a failed attempt. Retryable failures with attempts left go back
    /// to pending with exponential backoff; everything else is dead-lettered.
    #[tracing::instrument(skip(self, error))]
    pub async fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<()> {
        if retryable && job.attempts < job.max_attempts {
            let delay = backoff_delay(job.attempts);
            let run_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
            sqlx::query(
                "UPDATE jobs SET status = 'pending', locked_at = NULL, run_at = ?, last_error = ? WHERE id = ?",
            )
            .bind(run_at)
            .bind(error)
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

            tracing::warn!(
                queue = %job.queue,
                job = %job.name,
                id = %job.id,
                attempts = job.attempts,
                delay_secs = delay.as_secs(),
                error = error,
                "Job failed, retry scheduled"
            );
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'dead', locked_at = NULL, completed_at = ?, last_error = ? WHERE id = ?",
            )
            .bind(Utc::now())
            .bind(error)
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

            tracing::error!(
                queue = %job.queue,
                job = %job.name,
                id = %job.id,
                attempts = job.attempts,
                error = error,
                "Job moved to dead letter"
            );
        }

        Ok(())
    }

    /// Return leases held longer than the stall timeout to the pending state.
    /// Their attempt counters keep the earlier claim, so a crash-looping job
    /// still converges on the dead letter.
    #[tracing::instrument(skip(self))]
    pub async fn requeue_stalled(&self, stall_timeout_secs: i64) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(stall_timeout_secs);
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', locked_at = NULL, run_at = ? WHERE status = 'active' AND locked_at < ?",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::warn!(count = requeued, "Requeued stalled jobs");
        }
        Ok(requeued)
    }

    /// Drop completed jobs past the 24 h retention window and dead jobs past
    /// the 7 d window.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<u64> {
        let completed_cutoff = Utc::now() - ChronoDuration::hours(COMPLETED_RETENTION_HOURS);
        let dead_cutoff = Utc::now() - ChronoDuration::days(DEAD_RETENTION_DAYS);

        let completed = sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND completed_at < ?")
            .bind(completed_cutoff)
            .execute(&self.pool)
            .await?;

        let dead = sqlx::query("DELETE FROM jobs WHERE status = 'dead' AND completed_at < ?")
            .bind(dead_cutoff)
            .execute(&self.pool)
            .await?;

        Ok(completed.rows_affected() + dead.rows_affected())
    }

    /// Jobs currently waiting or scheduled in a queue.
    pub async fn pending_count(&self, queue: &str) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn count_in_status(&self, queue: &str, status: &str) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = ?",
        )
        .bind(queue)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{SummaryJobData, JOB_GENERATE, QUEUE_SUMMARY};
    use crate::store::testing::create_test_pool;

    fn payload(pr_id: &str) -> SummaryJobData {
        SummaryJobData {
            pull_request_id: pr_id.to_string(),
            installation_id: 77,
            repo_full_name: "acme/widgets".to_string(),
            number: 7,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let pool = create_test_pool().await;
        let queue = QueueRepository::new(pool);
        queue
            .enqueue(QUEUE_SUMMARY, JOB_GENERATE, &payload("pr-1"))
            .await
            .unwrap();

        let first = queue.claim_next(QUEUE_SUMMARY).await.unwrap();
        assert!(first.is_some());

        // The job is leased; a sibling sees nothing.
        let second = queue.claim_next(QUEUE_SUMMARY).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_increments_attempts() {
        let pool = create_test_pool().await;
        let queue = QueueRepository::new(pool);
        queue
            .enqueue(QUEUE_SUMMARY, JOB_GENERATE, &payload("pr-1"))
            .await
            .unwrap();

        let job = queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.name, JOB_GENERATE);
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_dead_letters() {
        let pool = create_test_pool().await;
        let queue = QueueRepository::new(pool);
        queue
            .enqueue(QUEUE_SUMMARY, JOB_GENERATE, &payload("pr-1"))
            .await
            .unwrap();

        let job = queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();
        queue.fail(&job, "upstream 502", true).await.unwrap();

        // Retry is scheduled in the future, not immediately claimable.
        assert!(queue.claim_next(QUEUE_SUMMARY).await.unwrap().is_none());
        assert_eq!(queue.pending_count(QUEUE_SUMMARY).await.unwrap(), 1);

        // Force the retry due and exhaust remaining attempts.
        sqlx::query("UPDATE jobs SET run_at = ?")
            .bind(Utc::now() - ChronoDuration::seconds(1))
            .execute(queue.pool())
            .await
            .unwrap();
        let job = queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        queue.fail(&job, "upstream 502", true).await.unwrap();

        sqlx::query("UPDATE jobs SET run_at = ?")
            .bind(Utc::now() - ChronoDuration::seconds(1))
            .execute(queue.pool())
            .await
            .unwrap();
        let job = queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        queue.fail(&job, "upstream 502", true).await.unwrap();

        assert_eq!(queue.count_in_status(QUEUE_SUMMARY, "dead").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let pool = create_test_pool().await;
        let queue = QueueRepository::new(pool);
        queue
            .enqueue(QUEUE_SUMMARY, JOB_GENERATE, &payload("pr-1"))
            .await
            .unwrap();

        let job = queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();
        queue.fail(&job, "pr vanished", false).await.unwrap();

        assert_eq!(queue.count_in_status(QUEUE_SUMMARY, "dead").await.unwrap(), 1);
        assert_eq!(queue.pending_count(QUEUE_SUMMARY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued() {
        let pool = create_test_pool().await;
        let queue = QueueRepository::new(pool);
        queue
            .enqueue(QUEUE_SUMMARY, JOB_GENERATE, &payload("pr-1"))
            .await
            .unwrap();

        queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();

        // Age the lease beyond the stall timeout.
        sqlx::query("UPDATE jobs SET locked_at = ?")
            .bind(Utc::now() - ChronoDuration::seconds(600))
            .execute(queue.pool())
            .await
            .unwrap();

        assert_eq!(queue.requeue_stalled(300).await.unwrap(), 1);
        assert!(queue.claim_next(QUEUE_SUMMARY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_honours_retention_windows() {
        let pool = create_test_pool().await;
        let queue = QueueRepository::new(pool);

        let id = queue
            .enqueue(QUEUE_SUMMARY, JOB_GENERATE, &payload("pr-1"))
            .await
            .unwrap();
        let job = queue.claim_next(QUEUE_SUMMARY).await.unwrap().unwrap();
        queue.complete(&job.id).await.unwrap();

        // Fresh completion survives cleanup.
        assert_eq!(queue.cleanup().await.unwrap(), 0);

        sqlx::query("UPDATE jobs SET completed_at = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::hours(25))
            .bind(&id)
            .execute(queue.pool())
            .await
            .unwrap();
        assert_eq!(queue.cleanup().await.unwrap(), 1);
    }

    impl QueueRepository {
        fn pool(&self) -> &SqlitePool {
            &self.pool
        }
    }
}
