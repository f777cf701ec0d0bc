//! Scheduler (component H): four cron triggers, one per
//! [`Frequency`], each enqueuing `{scheduled: true}` jobs for the
//! active monitored searches due at that cadence. Grounded on the
//! teacher's `kernel/scheduled_tasks.rs` (`tokio-cron-scheduler`
//! `Job::new_async` wired against a shared pool).

use std::sync::Arc;

use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::jittered;
use crate::models::{Frequency, MonitoredSearch};
use crate::queue::{EnqueueOptions, JobQueue};

const JITTER_MAX: std::time::Duration = std::time::Duration::from_secs(60);

/// Starts the four frequency-keyed cron triggers and returns the
/// running scheduler handle; dropping or stopping it cancels them.
pub async fn start_scheduler(
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    for frequency in [
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Monthly,
    ] {
        let pool = pool.clone();
        let queue = queue.clone();
        let job = Job::new_async(frequency.cron_expression(), move |_uuid, _lock| {
            let pool = pool.clone();
            let queue = queue.clone();
            Box::pin(async move {
                if let Err(e) = run_due_searches(&pool, queue, frequency).await {
                    error!(?frequency, error = %e, "scheduled enqueue failed");
                }
            })
        })?;
        scheduler.add(job).await?;
    }

    scheduler.start().await?;
    info!("scheduler started (hourly, daily, weekly, monthly triggers)");
    Ok(scheduler)
}

async fn run_due_searches(
    pool: &PgPool,
    queue: Arc<dyn JobQueue>,
    frequency: Frequency,
) -> anyhow::Result<()> {
    let searches: Vec<MonitoredSearch> = sqlx::query_as(
        "SELECT * FROM monitored_searches WHERE active = true AND frequency = $1",
    )
    .bind(frequency)
    .fetch_all(pool)
    .await?;

    if searches.is_empty() {
        return Ok(());
    }

    info!(?frequency, count = searches.len(), "enqueueing monitored searches");

    for search in searches {
        if let Err(e) = queue.enqueue(&search.search_term, scheduled_enqueue_opts()).await {
            error!(search_term = %search.search_term, error = %e, "failed to enqueue monitored search");
            continue;
        }

        mark_run(pool, search.id, frequency).await?;
    }

    Ok(())
}

/// Options for a scheduler-injected job: jittered in `[0, JITTER_MAX]`
/// so a batch of monitored terms doesn't all become claimable at once
/// (spec §4.H). The jitter desynchronizes job *execution* via `delay`,
/// not the scheduler task itself.
fn scheduled_enqueue_opts() -> EnqueueOptions {
    EnqueueOptions {
        scheduled: true,
        delay: Some(jittered(JITTER_MAX)),
        ..EnqueueOptions::default()
    }
}

async fn mark_run(pool: &PgPool, id: Uuid, frequency: Frequency) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let next_run = frequency.next_run_after(now);

    sqlx::query(
        "UPDATE monitored_searches SET last_run = $1, next_run = $2, updated_at = $1 WHERE id = $3",
    )
    .bind(now)
    .bind(next_run)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}
