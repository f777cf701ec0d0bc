//! Worker pool (component F): claims jobs from the queue broker, runs
//! them through the token supervisor / fetcher / persistence gateway,
//! and acks or fails them. Mirrors the teacher's `JobWorker` shutdown
//! and per-job heartbeat shape, adapted to one job per poll instead of
//! a batch claim.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::AnalyticsRecorder;
use crate::error::{ErrorKind, FetchError};
use crate::fetcher::UpstreamFetcher;
use crate::models::ScrapeJob;
use crate::queue::JobQueue;
use crate::storage::PersistenceGateway;
use crate::token::TokenSupervisor;

/// Interval between claim attempts when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Interval between lease-renewing heartbeats for an in-flight job.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// How long graceful shutdown waits for in-flight jobs before giving up.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub api_year: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            api_year: "2024".to_string(),
        }
    }
}

/// W concurrent claim/fetch/persist loops over one job queue (spec §4.F).
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    tokens: Arc<TokenSupervisor>,
    fetcher: Arc<UpstreamFetcher>,
    storage: Arc<dyn PersistenceGateway>,
    analytics: Arc<dyn AnalyticsRecorder>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        tokens: Arc<TokenSupervisor>,
        fetcher: Arc<UpstreamFetcher>,
        storage: Arc<dyn PersistenceGateway>,
        analytics: Arc<dyn AnalyticsRecorder>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            tokens,
            fetcher,
            storage,
            analytics,
            config,
        }
    }

    /// Runs `concurrency` worker loops until `shutdown` fires, then waits
    /// up to [`SHUTDOWN_DEADLINE`] for in-flight jobs to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "worker pool starting");

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for index in 0..self.config.concurrency {
            let pool = self.clone();
            let worker_id = format!("worker-{index}");
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.run_one(worker_id, shutdown).await;
            }));
        }

        let joined = future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_DEADLINE, joined).await.is_err() {
            warn!("worker pool shutdown deadline elapsed with jobs still in flight");
        }

        info!("worker pool stopped");
    }

    async fn run_one(&self, worker_id: String, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.queue.fetch(&worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to claim job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(claimed) = claimed else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                continue;
            };

            self.process(claimed.job, &worker_id, &shutdown).await;
        }
    }

    async fn process(&self, job: ScrapeJob, worker_id: &str, shutdown: &CancellationToken) {
        let job_id = job.id;
        info!(job_id = %job_id, worker_id, search_term = %job.search_term, "job claimed");

        if let Err(e) = self.queue.progress(job_id, 10).await {
            warn!(job_id = %job_id, error = %e, "failed to report job progress");
        }

        let job_cancel = shutdown.child_token();
        let heartbeat_queue = self.queue.clone();
        let heartbeat_cancel = job_cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = heartbeat_queue.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let outcome = self.run_job(job_id, &job).await;

        job_cancel.cancel();
        let _ = heartbeat_handle.await;

        match outcome {
            Ok(count) => {
                if let Err(e) = self.queue.progress(job_id, 100).await {
                    warn!(job_id = %job_id, error = %e, "failed to report job progress");
                }
                if let Err(e) = self.queue.ack(job_id, count as i32).await {
                    error!(job_id = %job_id, error = %e, "failed to ack job");
                }
                if let Err(e) = self.analytics.record_success(&job.search_term, count as i64).await {
                    warn!(job_id = %job_id, error = %e, "failed to record analytics success");
                }
                info!(job_id = %job_id, records = count, "job succeeded");
            }
            // Spec §4.F: catch TokenExpired -> token.Refresh(); broker.Fail(job,
            // retryable=true). No persistence/analytics failure write - the job
            // is retried, not terminally failed.
            Err(FetchError::TokenExpired) => {
                warn!(job_id = %job_id, "token expired mid-job, refreshing before retry");
                if let Err(e) = self.tokens.refresh().await {
                    warn!(job_id = %job_id, error = %e, "token refresh after expiry failed");
                }
                if let Err(e) = self
                    .queue
                    .fail(job_id, &FetchError::TokenExpired.to_string(), ErrorKind::Retryable)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to record job retry");
                }
            }
            // Upstream 5xx/409: transient, absorbed by the broker's retry
            // schedule, same no-write treatment as TokenExpired.
            Err(e @ FetchError::UpstreamError(status))
                if (500..600).contains(&status) || status == 409 =>
            {
                warn!(job_id = %job_id, status, "transient upstream error, retrying job");
                if let Err(e) = self.queue.fail(job_id, &e.to_string(), ErrorKind::Retryable).await {
                    error!(job_id = %job_id, error = %e, "failed to record job retry");
                }
            }
            Err(e) => {
                let kind: ErrorKind = (&e).into();
                warn!(job_id = %job_id, error = %e, ?kind, "job failed");
                if let Err(e) = self.queue.fail(job_id, &e.to_string(), kind).await {
                    error!(job_id = %job_id, error = %e, "failed to record job failure");
                }
                if let Err(e) = self.analytics.record_failure(&job.search_term, &e.to_string()).await {
                    warn!(job_id = %job_id, error = %e, "failed to record analytics failure");
                }
            }
        }
    }

    async fn run_job(&self, job_id: uuid::Uuid, job: &ScrapeJob) -> Result<usize, FetchError> {
        let Some(token) = self.tokens.current() else {
            return Err(FetchError::TokenExpired);
        };

        let outcome = self
            .fetcher
            .fetch(&token, &job.search_term, &self.config.api_year)
            .await?;

        debug!(
            search_term = %job.search_term,
            total = outcome.total,
            page_size = outcome.page_size,
            accepted = outcome.records.len(),
            "fetch complete"
        );

        let growth = if outcome.total > 0 {
            ((outcome.records.len() as f64 / outcome.total as f64) * 69.0).round() as u8
        } else {
            69
        };
        if let Err(e) = self.queue.progress(job_id, 30u8.saturating_add(growth.min(69))).await {
            warn!(job_id = %job_id, error = %e, "failed to report job progress");
        }

        let accepted = self
            .storage
            .upsert(&outcome.records, &job.search_term)
            .await
            .map_err(|e| FetchError::Unrecoverable(e.to_string()))?;

        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::models::PropertyRecord;
    use crate::queue::{ClaimedJob, EnqueueOptions, QueueCounts};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeQueue {
        failed: Mutex<Vec<(Uuid, String, ErrorKind)>>,
        acked: Mutex<Vec<(Uuid, i32)>>,
        progress: Mutex<Vec<(Uuid, u8)>>,
    }

    #[async_trait]
    impl JobQueue for FakeQueue {
        async fn enqueue(&self, _: &str, _: EnqueueOptions) -> anyhow::Result<Uuid> {
            unimplemented!()
        }
        async fn fetch(&self, _: &str) -> anyhow::Result<Option<ClaimedJob>> {
            unimplemented!()
        }
        async fn ack(&self, job_id: Uuid, result_count: i32) -> anyhow::Result<()> {
            self.acked.lock().unwrap().push((job_id, result_count));
            Ok(())
        }
        async fn fail(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> anyhow::Result<()> {
            self.failed.lock().unwrap().push((job_id, error.to_string(), kind));
            Ok(())
        }
        async fn progress(&self, job_id: Uuid, pct: u8) -> anyhow::Result<()> {
            self.progress.lock().unwrap().push((job_id, pct));
            Ok(())
        }
        async fn heartbeat(&self, _: Uuid) -> anyhow::Result<()> {
            Ok(())
        }
        async fn counts(&self) -> anyhow::Result<QueueCounts> {
            unimplemented!()
        }
        async fn list_waiting_and_delayed(&self) -> anyhow::Result<Vec<ScrapeJob>> {
            unimplemented!()
        }
        async fn has_completed_job(&self, _: &str) -> anyhow::Result<bool> {
            unimplemented!()
        }
        async fn remove(&self, _: Uuid) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn prune_terminal(&self, _: DateTime<Utc>) -> anyhow::Result<u64> {
            unimplemented!()
        }
        async fn get(&self, _: Uuid) -> anyhow::Result<Option<ScrapeJob>> {
            unimplemented!()
        }
    }

    struct FakeStorage;

    #[async_trait]
    impl PersistenceGateway for FakeStorage {
        async fn upsert(
            &self,
            records: &[PropertyRecord],
            _search_term: &str,
        ) -> Result<usize, PersistenceError> {
            Ok(records.len())
        }
    }

    #[derive(Default)]
    struct FakeAnalytics {
        successes: Mutex<Vec<(String, i64)>>,
        failures: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl AnalyticsRecorder for FakeAnalytics {
        async fn record_success(&self, search_term: &str, records: i64) -> anyhow::Result<()> {
            self.successes.lock().unwrap().push((search_term.to_string(), records));
            Ok(())
        }
        async fn record_failure(&self, search_term: &str, error: &str) -> anyhow::Result<()> {
            self.failures
                .lock()
                .unwrap()
                .push((search_term.to_string(), error.to_string()));
            Ok(())
        }
    }

    async fn token_server_with(token: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": token })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn token_expiry_triggers_synchronous_refresh_and_retry_without_analytics_write() {
        let token_server = token_server_with("fresh-token").await;
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&upstream)
            .await;

        let tokens = Arc::new(TokenSupervisor::new(format!("{}/token", token_server.uri())));
        tokens.refresh().await.unwrap();
        assert_eq!(tokens.health().refresh_count, 1);

        let queue = Arc::new(FakeQueue::default());
        let analytics = Arc::new(FakeAnalytics::default());
        let worker = WorkerPool::new(
            queue.clone(),
            tokens.clone(),
            Arc::new(UpstreamFetcher::new(upstream.uri())),
            Arc::new(FakeStorage),
            analytics.clone(),
            WorkerPoolConfig::default(),
        );

        let job = ScrapeJob::builder().search_term("Acme Trust").build();
        worker.process(job.clone(), "worker-0", &CancellationToken::new()).await;

        // The 401 must trigger a *synchronous* refresh by the worker, not
        // just the independent auto-refresh loop.
        assert_eq!(tokens.health().refresh_count, 2);

        let failed = queue.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, job.id);
        assert_eq!(failed[0].2, ErrorKind::Retryable);

        assert!(analytics.failures.lock().unwrap().is_empty());
        assert!(queue.progress.lock().unwrap().iter().any(|(id, pct)| *id == job.id && *pct == 10));
    }

    #[tokio::test]
    async fn generic_failure_is_recorded_in_analytics_and_job_row() {
        let token_server = token_server_with("fresh-token").await;
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(418))
            .mount(&upstream)
            .await;

        let tokens = Arc::new(TokenSupervisor::new(format!("{}/token", token_server.uri())));
        tokens.refresh().await.unwrap();

        let queue = Arc::new(FakeQueue::default());
        let analytics = Arc::new(FakeAnalytics::default());
        let worker = WorkerPool::new(
            queue.clone(),
            tokens.clone(),
            Arc::new(UpstreamFetcher::new(upstream.uri())),
            Arc::new(FakeStorage),
            analytics.clone(),
            WorkerPoolConfig::default(),
        );

        let job = ScrapeJob::builder().search_term("Acme Trust").build();
        worker.process(job.clone(), "worker-0", &CancellationToken::new()).await;

        let failed = queue.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].2, ErrorKind::NonRetryable);
        assert_eq!(analytics.failures.lock().unwrap().len(), 1);
        // No extra refresh - a non-auth error never touches the token supervisor.
        assert_eq!(tokens.health().refresh_count, 1);
    }

    #[tokio::test]
    async fn successful_job_reports_progress_and_acks() {
        let token_server = token_server_with("fresh-token").await;
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalProperty": {"propertyCount": 1},
                "results": [{"pid": 1, "displayName": "A", "propType": "res", "city": null,
                    "streetPrimary": "1 Main St", "assessedValue": 100, "appraisedValue": 200,
                    "geoID": null, "legalDescription": null}]
            })))
            .mount(&upstream)
            .await;

        let tokens = Arc::new(TokenSupervisor::new(format!("{}/token", token_server.uri())));
        tokens.refresh().await.unwrap();

        let queue = Arc::new(FakeQueue::default());
        let analytics = Arc::new(FakeAnalytics::default());
        let worker = WorkerPool::new(
            queue.clone(),
            tokens.clone(),
            Arc::new(UpstreamFetcher::new(upstream.uri())),
            Arc::new(FakeStorage),
            analytics.clone(),
            WorkerPoolConfig::default(),
        );

        let job = ScrapeJob::builder().search_term("Acme Trust").build();
        worker.process(job.clone(), "worker-0", &CancellationToken::new()).await;

        assert_eq!(queue.acked.lock().unwrap().as_slice(), &[(job.id, 1)]);
        assert_eq!(analytics.successes.lock().unwrap().len(), 1);
        let progress = queue.progress.lock().unwrap();
        assert!(progress.iter().any(|(id, pct)| *id == job.id && *pct == 10));
        assert!(progress.iter().any(|(id, pct)| *id == job.id && *pct == 100));
    }
}
