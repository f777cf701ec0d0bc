//! De-duplication & backlog hygiene (component G): a periodic sweep
//! that keeps at most one non-terminal job per term and prunes stale
//! terminal rows. Grounded on the teacher's periodic-task shape in
//! `kernel/scheduled_tasks.rs` (a `tokio::time::interval` loop guarded
//! by a `CancellationToken`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::queue::JobQueue;

pub struct HygieneConfig {
    pub sweep_interval: Duration,
    pub grace_period: chrono::Duration,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            grace_period: chrono::Duration::hours(24),
        }
    }
}

pub struct HygieneSweeper {
    queue: Arc<dyn JobQueue>,
    config: HygieneConfig,
}

impl HygieneSweeper {
    pub fn new(queue: Arc<dyn JobQueue>, config: HygieneConfig) -> Self {
        Self { queue, config }
    }

    /// Runs the sweep loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "hygiene sweeper starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }

            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "hygiene sweep failed");
            }
        }

        info!("hygiene sweeper stopped");
    }

    /// Runs the five-step sweep described in spec §4.G exactly once.
    pub async fn sweep_once(&self) -> anyhow::Result<()> {
        let waiting = self.queue.list_waiting_and_delayed().await?;

        let mut to_remove: Vec<Uuid> = Vec::new();
        let mut by_term: HashMap<&str, Vec<&crate::models::ScrapeJob>> = HashMap::new();
        for job in &waiting {
            by_term.entry(job.search_term.as_str()).or_default().push(job);
        }

        for (term, mut jobs) in by_term {
            if jobs.len() > 1 {
                // Highest priority wins (lowest numeric value); ties
                // broken by insertion order, which `created_at` proxies.
                jobs.sort_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                });
                for duplicate in &jobs[1..] {
                    debug!(search_term = term, job_id = %duplicate.id, "dropping duplicate backlog entry");
                    to_remove.push(duplicate.id);
                }
            }

            let survivor = jobs[0];
            if !survivor.scheduled && self.queue.has_completed_job(term).await? {
                debug!(search_term = term, job_id = %survivor.id, "dropping already-completed term");
                to_remove.push(survivor.id);
            }
        }

        let removed = to_remove.len();
        for job_id in to_remove {
            self.queue.remove(job_id).await?;
        }

        let cutoff = chrono::Utc::now() - self.config.grace_period;
        let pruned = self.queue.prune_terminal(cutoff).await?;

        info!(removed, pruned, "hygiene sweep complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{JobStatus, ScrapeJob};
    use crate::queue::{ClaimedJob, EnqueueOptions, QueueCounts};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeQueue {
        jobs: Mutex<Vec<ScrapeJob>>,
        removed: Mutex<Vec<Uuid>>,
        pruned_before: Mutex<Option<DateTime<Utc>>>,
    }

    #[async_trait]
    impl JobQueue for FakeQueue {
        async fn enqueue(&self, _: &str, _: EnqueueOptions) -> anyhow::Result<Uuid> {
            unimplemented!()
        }
        async fn fetch(&self, _: &str) -> anyhow::Result<Option<ClaimedJob>> {
            unimplemented!()
        }
        async fn ack(&self, _: Uuid, _: i32) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn fail(&self, _: Uuid, _: &str, _: ErrorKind) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn progress(&self, _: Uuid, _: u8) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn heartbeat(&self, _: Uuid) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn counts(&self) -> anyhow::Result<QueueCounts> {
            unimplemented!()
        }
        async fn list_waiting_and_delayed(&self) -> anyhow::Result<Vec<ScrapeJob>> {
            Ok(self.jobs.lock().unwrap().clone())
        }
        async fn has_completed_job(&self, search_term: &str) -> anyhow::Result<bool> {
            Ok(search_term == "Already Done LLC")
        }
        async fn remove(&self, job_id: Uuid) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(job_id);
            Ok(())
        }
        async fn prune_terminal(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
            *self.pruned_before.lock().unwrap() = Some(older_than);
            Ok(0)
        }
        async fn get(&self, _: Uuid) -> anyhow::Result<Option<ScrapeJob>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn keeps_highest_priority_and_drops_rest() {
        let low_priority = ScrapeJob::builder()
            .search_term("Acme Trust")
            .priority(5i16)
            .build();
        let high_priority = ScrapeJob::builder()
            .search_term("Acme Trust")
            .priority(1i16)
            .build();

        let queue = Arc::new(FakeQueue {
            jobs: Mutex::new(vec![low_priority.clone(), high_priority.clone()]),
            ..Default::default()
        });
        let sweeper = HygieneSweeper::new(queue.clone(), HygieneConfig::default());
        sweeper.sweep_once().await.unwrap();

        let removed = queue.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0], low_priority.id);
    }

    #[tokio::test]
    async fn drops_non_scheduled_duplicate_of_completed_term() {
        let job = ScrapeJob::builder()
            .search_term("Already Done LLC")
            .status(JobStatus::Pending)
            .build();

        let queue = Arc::new(FakeQueue {
            jobs: Mutex::new(vec![job.clone()]),
            ..Default::default()
        });
        let sweeper = HygieneSweeper::new(queue.clone(), HygieneConfig::default());
        sweeper.sweep_once().await.unwrap();

        assert_eq!(queue.removed.lock().unwrap().as_slice(), &[job.id]);
    }

    #[tokio::test]
    async fn keeps_scheduled_job_even_if_term_already_completed() {
        let job = ScrapeJob::builder()
            .search_term("Already Done LLC")
            .scheduled(true)
            .build();

        let queue = Arc::new(FakeQueue {
            jobs: Mutex::new(vec![job.clone()]),
            ..Default::default()
        });
        let sweeper = HygieneSweeper::new(queue.clone(), HygieneConfig::default());
        sweeper.sweep_once().await.unwrap();

        assert!(queue.removed.lock().unwrap().is_empty());
    }
}
