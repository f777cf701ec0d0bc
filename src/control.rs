//! Core control surface (component J): the plain async facade an
//! (out-of-scope) API layer would hold an `Arc<ScraperCore>` to, the
//! same role the teacher's `ServerKernel` plays for its axum handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::analytics::AnalyticsStore;
use crate::error::ControlError;
use crate::models::{Frequency, JobStatus, MonitoredSearch, ScrapeJob, SearchTermStats};
use crate::queue::{EnqueueOptions, JobQueue, QueueCounts};
use crate::token::TokenHealth;

/// View of a job returned by `get_job`, matching spec §4.J's shape.
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: Uuid,
    pub state: JobStatus,
    pub progress_pct: i16,
    pub result_count: Option<i32>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ScrapeJob> for JobView {
    fn from(job: ScrapeJob) -> Self {
        Self {
            id: job.id,
            state: job.status,
            progress_pct: job.progress_pct,
            result_count: job.result_count,
            error: job.error,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Health {
    pub queue: QueueCounts,
    pub token: TokenHealth,
}

pub struct ScraperCoreConfig {
    pub enqueue_cooldown: Duration,
}

impl Default for ScraperCoreConfig {
    fn default() -> Self {
        Self {
            enqueue_cooldown: Duration::from_secs(5),
        }
    }
}

/// Facade over the queue, monitor table, analytics, and token
/// supervisor (spec §4.J).
pub struct ScraperCore {
    queue: Arc<dyn JobQueue>,
    pool: sqlx::PgPool,
    analytics: Arc<AnalyticsStore>,
    tokens: Arc<crate::token::TokenSupervisor>,
    config: ScraperCoreConfig,
    last_enqueued: Mutex<HashMap<String, std::time::Instant>>,
}

impl ScraperCore {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pool: sqlx::PgPool,
        analytics: Arc<AnalyticsStore>,
        tokens: Arc<crate::token::TokenSupervisor>,
        config: ScraperCoreConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            analytics,
            tokens,
            config,
            last_enqueued: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues an ad-hoc scrape, rejecting terms enqueued within the
    /// cooldown window.
    pub async fn enqueue_scrape(&self, term: &str) -> Result<Uuid, ControlError> {
        {
            let mut last = self.last_enqueued.lock().await;
            if let Some(at) = last.get(term) {
                if at.elapsed() < self.config.enqueue_cooldown {
                    return Err(ControlError::EnqueueRateLimited {
                        term: term.to_string(),
                    });
                }
            }
            last.insert(term.to_string(), std::time::Instant::now());
        }

        let id = self
            .queue
            .enqueue(term, EnqueueOptions::default())
            .await
            .map_err(ControlError::Other)?;

        Ok(id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobView>, ControlError> {
        let job = self.queue.get(job_id).await.map_err(ControlError::Other)?;
        Ok(job.map(JobView::from))
    }

    /// Upserts a `MonitoredSearch` for `term` at `frequency`.
    pub async fn add_monitor(&self, term: &str, frequency: Frequency) -> Result<Uuid, ControlError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO monitored_searches (id, search_term, active, frequency, created_at, updated_at)
            VALUES ($1, $2, true, $3, NOW(), NOW())
            ON CONFLICT (search_term) DO UPDATE SET
                active = true,
                frequency = EXCLUDED.frequency,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(term)
        .bind(frequency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ControlError::Persistence(e.into()))?;

        Ok(id)
    }

    pub async fn list_monitors(&self) -> Result<Vec<MonitoredSearch>, ControlError> {
        let monitors = sqlx::query_as("SELECT * FROM monitored_searches ORDER BY search_term")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ControlError::Persistence(e.into()))?;

        Ok(monitors)
    }

    pub async fn health(&self) -> Result<Health, ControlError> {
        let queue = self.queue.counts().await.map_err(ControlError::Other)?;
        Ok(Health {
            queue,
            token: self.tokens.health(),
        })
    }

    pub async fn stats(&self) -> Result<Vec<SearchTermStats>, ControlError> {
        self.analytics.all().await.map_err(ControlError::Other)
    }
}
