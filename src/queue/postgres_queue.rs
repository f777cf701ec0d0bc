use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClaimedJob, EnqueueOptions, JobQueue, QueueCounts};
use crate::clock::exponential_backoff;
use crate::error::ErrorKind;
use crate::models::ScrapeJob;

/// How long a claimed job's lease is held before it is considered
/// stalled and eligible for reclaim (spec §4.E "stall recovery").
const LEASE_DURATION: chrono::Duration = chrono::Duration::minutes(5);
const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(3600);

pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, search_term: &str, opts: EnqueueOptions) -> anyhow::Result<Uuid> {
        let run_at = opts.delay.map(|d| Utc::now() + d);

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO scrape_jobs (
                id, search_term, status, scheduled, attempt, max_attempts,
                priority, run_at, progress_pct, started_at, created_at, updated_at
            )
            VALUES ($1, $2, 'pending', $3, 1, $4, $5, $6, 0, NOW(), NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(search_term)
        .bind(opts.scheduled)
        .bind(opts.attempts)
        .bind(opts.priority)
        .bind(run_at)
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = %id, search_term, scheduled = opts.scheduled, "enqueued job");
        Ok(id)
    }

    async fn fetch(&self, worker_id: &str) -> anyhow::Result<Option<ClaimedJob>> {
        let job: Option<ScrapeJob> = sqlx::query_as(
            r#"
            UPDATE scrape_jobs
            SET status = 'processing',
                worker_id = $1,
                lease_expires_at = NOW() + $2,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM scrape_jobs
                WHERE (status = 'pending' AND (run_at IS NULL OR run_at <= NOW()))
                   OR (status = 'processing' AND lease_expires_at < NOW())
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(LEASE_DURATION)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job.map(|job| ClaimedJob { job }))
    }

    async fn ack(&self, job_id: Uuid, result_count: i32) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = 'completed', result_count = $1, progress_pct = 100,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(result_count)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        info!(job_id = %job_id, result_count, "job completed");
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> anyhow::Result<()> {
        let current: Option<(i32, i32)> =
            sqlx::query_as("SELECT attempt, max_attempts FROM scrape_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((attempt, max_attempts)) = current else {
            warn!(job_id = %job_id, "fail called for unknown job");
            return Ok(());
        };

        if kind.should_retry() && attempt < max_attempts {
            let delay = exponential_backoff(attempt as u32, std::time::Duration::from_secs(2), BACKOFF_CAP);
            sqlx::query(
                r#"
                UPDATE scrape_jobs
                SET status = 'pending',
                    attempt = attempt + 1,
                    error = $1,
                    run_at = NOW() + $2,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    progress_pct = 0,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(error)
            .bind(delay)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            info!(job_id = %job_id, attempt, delay_secs = delay.as_secs(), "job retry scheduled");
        } else {
            sqlx::query(
                r#"
                UPDATE scrape_jobs
                SET status = 'failed', error = $1, completed_at = NOW(), updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            info!(job_id = %job_id, attempt, "job failed permanently");
        }

        Ok(())
    }

    async fn progress(&self, job_id: Uuid, pct: u8) -> anyhow::Result<()> {
        sqlx::query("UPDATE scrape_jobs SET progress_pct = $1, updated_at = NOW() WHERE id = $2")
            .bind(pct as i16)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        debug!(job_id = %job_id, pct, "job progress");
        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE scrape_jobs SET lease_expires_at = NOW() + $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(LEASE_DURATION)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn counts(&self) -> anyhow::Result<QueueCounts> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND (run_at IS NULL OR run_at <= NOW())) AS waiting,
                COUNT(*) FILTER (WHERE status = 'processing') AS active,
                COUNT(*) FILTER (WHERE status = 'pending' AND run_at > NOW()) AS delayed,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM scrape_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueCounts {
            waiting: row.0,
            active: row.1,
            delayed: row.2,
            completed: row.3,
            failed: row.4,
        })
    }

    async fn list_waiting_and_delayed(&self) -> anyhow::Result<Vec<ScrapeJob>> {
        let jobs = sqlx::query_as::<_, ScrapeJob>(
            "SELECT * FROM scrape_jobs WHERE status = 'pending' ORDER BY priority ASC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn has_completed_job(&self, search_term: &str) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM scrape_jobs WHERE search_term = $1 AND status = 'completed')",
        )
        .bind(search_term)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn remove(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM scrape_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM scrape_jobs WHERE status IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<ScrapeJob>> {
        let job = sqlx::query_as::<_, ScrapeJob>("SELECT * FROM scrape_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }
}
