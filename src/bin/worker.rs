//! Worker process entrypoint. Grounded on the teacher's
//! `server/main.rs` bootstrap (tracing init, `Config::from_env`,
//! `PgPoolOptions`, `sqlx::migrate!`), adapted from an axum server to a
//! background worker: no HTTP listener, instead the worker pool,
//! scheduler, hygiene sweeper, and token auto-refresh run side by side
//! until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parcelwatch::analytics::AnalyticsStore;
use parcelwatch::cache::Cache;
use parcelwatch::config::Config;
use parcelwatch::fetcher::UpstreamFetcher;
use parcelwatch::hygiene::{HygieneConfig, HygieneSweeper};
use parcelwatch::queue::PostgresJobQueue;
use parcelwatch::scheduler;
use parcelwatch::storage::PostgresGateway;
use parcelwatch::token::TokenSupervisor;
use parcelwatch::worker::{WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,parcelwatch=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting parcelwatch worker");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let cache = Cache::connect(&config.redis_url)
        .await
        .context("failed to connect to cache")?;

    let queue = Arc::new(PostgresJobQueue::new(pool.clone()));
    let storage = Arc::new(PostgresGateway::new(pool.clone(), cache));
    let analytics = Arc::new(AnalyticsStore::new(pool.clone()));
    let tokens = Arc::new(TokenSupervisor::new(config.token_endpoint_url.clone()));
    let fetcher = Arc::new(UpstreamFetcher::new(config.upstream_base_url.clone()));

    tracing::info!("performing initial token refresh");
    if let Err(e) = tokens.refresh().await {
        tracing::warn!(error = %e, "initial token refresh failed, will retry on schedule");
    }
    tokens.start_auto_refresh(config.token_refresh_interval).await;

    let shutdown = CancellationToken::new();

    let worker_pool = Arc::new(WorkerPool::new(
        queue.clone(),
        tokens.clone(),
        fetcher,
        storage,
        analytics,
        WorkerPoolConfig {
            concurrency: config.worker_concurrency,
            api_year: config.api_year.clone(),
        },
    ));
    let worker_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker_pool.run(shutdown).await }
    });

    let hygiene = Arc::new(HygieneSweeper::new(
        queue.clone(),
        HygieneConfig {
            sweep_interval: config.queue_cleanup_interval,
            grace_period: chrono::Duration::from_std(config.queue_cleanup_grace_period)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        },
    ));
    let hygiene_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { hygiene.run(shutdown).await }
    });

    let mut cron_scheduler = scheduler::start_scheduler(pool.clone(), queue.clone())
        .await
        .context("failed to start scheduler")?;

    tracing::info!("parcelwatch worker running, waiting for shutdown signal");
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");

    shutdown.cancel();
    tokens.stop().await;
    let _ = cron_scheduler.shutdown().await;
    let _ = worker_handle.await;
    let _ = hygiene_handle.await;

    tracing::info!("parcelwatch worker stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}
