//! Queue broker adapter (component E): enqueue/dequeue/ack/retry
//! semantics over the job table, plus inspection of the
//! waiting/active/delayed/completed/failed sets.

mod postgres_queue;

pub use postgres_queue::PostgresJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::ScrapeJob;

/// Options accepted by `enqueue` (spec §4.E).
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub attempts: i32,
    pub backoff_base: Duration,
    pub delay: Option<Duration>,
    pub scheduled: bool,
    pub priority: i16,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(2),
            delay: None,
            scheduled: false,
            priority: 2,
        }
    }
}

/// A job claimed for processing.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: ScrapeJob,
}

/// Counts of jobs in each broker-visible state (spec §4.E inspection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job for `search_term`, returning its id.
    async fn enqueue(&self, search_term: &str, opts: EnqueueOptions) -> anyhow::Result<Uuid>;

    /// Claims up to one ready job for processing (subject to lease
    /// expiry / stall recovery, the broker's concern per spec §4.E).
    async fn fetch(&self, worker_id: &str) -> anyhow::Result<Option<ClaimedJob>>;

    /// Acks a job as successfully completed with `result_count` records.
    async fn ack(&self, job_id: Uuid, result_count: i32) -> anyhow::Result<()>;

    /// Fails a job. If `kind` is retryable and attempts remain, the
    /// broker reinjects it with `delay = backoff_base * 2^(attempt-1)`.
    async fn fail(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> anyhow::Result<()>;

    /// Observational progress report.
    async fn progress(&self, job_id: Uuid, pct: u8) -> anyhow::Result<()>;

    /// Extends a claimed job's lease, signalling it is still in flight.
    async fn heartbeat(&self, job_id: Uuid) -> anyhow::Result<()>;

    /// Counts of jobs in each state.
    async fn counts(&self) -> anyhow::Result<QueueCounts>;

    /// All waiting and delayed jobs (for hygiene sweeps).
    async fn list_waiting_and_delayed(&self) -> anyhow::Result<Vec<ScrapeJob>>;

    /// Whether a search term already has a completed job.
    async fn has_completed_job(&self, search_term: &str) -> anyhow::Result<bool>;

    /// Removes a job by id (used by hygiene de-duplication).
    async fn remove(&self, job_id: Uuid) -> anyhow::Result<()>;

    /// Prunes terminal (completed/failed) rows older than `grace_period`.
    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Fetches a job by id (used by the control surface's `GetJob`).
    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<ScrapeJob>>;
}
