//! Search-term analytics (component I): append-only per-term counters,
//! updated by the worker pool after each job outcome and read by the
//! control surface. Not on the fetch hot path.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::SearchTermStats;

/// The subset of `AnalyticsStore` the worker pool (component F) drives.
/// Split out as a trait so `WorkerPool` can be exercised against a fake
/// in unit tests without a database, the same way `JobQueue` and
/// `PersistenceGateway` are.
#[async_trait]
pub trait AnalyticsRecorder: Send + Sync {
    async fn record_success(&self, search_term: &str, records: i64) -> anyhow::Result<()>;
    async fn record_failure(&self, search_term: &str, error: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct AnalyticsStore {
    pool: PgPool,
}

impl AnalyticsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records a successful run: bumps `success_count` and
    /// `records_yielded`, clears `last_error`.
    pub async fn record_success(&self, search_term: &str, records: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO search_term_stats (search_term, success_count, failure_count, records_yielded, last_run_at)
            VALUES ($1, 1, 0, $2, NOW())
            ON CONFLICT (search_term) DO UPDATE SET
                success_count = search_term_stats.success_count + 1,
                records_yielded = search_term_stats.records_yielded + $2,
                last_error = NULL,
                last_run_at = NOW()
            "#,
        )
        .bind(search_term)
        .bind(records)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed run: bumps `failure_count`, stores `last_error`.
    pub async fn record_failure(&self, search_term: &str, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO search_term_stats (search_term, success_count, failure_count, records_yielded, last_error, last_run_at)
            VALUES ($1, 0, 1, 0, $2, NOW())
            ON CONFLICT (search_term) DO UPDATE SET
                failure_count = search_term_stats.failure_count + 1,
                last_error = $2,
                last_run_at = NOW()
            "#,
        )
        .bind(search_term)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, search_term: &str) -> anyhow::Result<Option<SearchTermStats>> {
        let stats = sqlx::query_as("SELECT * FROM search_term_stats WHERE search_term = $1")
            .bind(search_term)
            .fetch_optional(&self.pool)
            .await?;

        Ok(stats)
    }

    pub async fn all(&self) -> anyhow::Result<Vec<SearchTermStats>> {
        let stats = sqlx::query_as("SELECT * FROM search_term_stats ORDER BY search_term")
            .fetch_all(&self.pool)
            .await?;

        Ok(stats)
    }
}

#[async_trait]
impl AnalyticsRecorder for AnalyticsStore {
    async fn record_success(&self, search_term: &str, records: i64) -> anyhow::Result<()> {
        AnalyticsStore::record_success(self, search_term, records).await
    }

    async fn record_failure(&self, search_term: &str, error: &str) -> anyhow::Result<()> {
        AnalyticsStore::record_failure(self, search_term, error).await
    }
}
