//! Application configuration loaded from environment variables.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Recognized configuration keys and their effect on the core, per
/// the spec's External Interfaces section.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub upstream_base_url: String,
    pub token_endpoint_url: String,
    pub api_year: String,

    pub worker_concurrency: usize,
    pub token_refresh_interval: Duration,
    pub queue_cleanup_interval: Duration,
    pub queue_cleanup_grace_period: Duration,
    pub scraper_rate_limit_cooldown: Duration,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// `.env` in development.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            upstream_base_url: env::var("UPSTREAM_BASE_URL")
                .context("UPSTREAM_BASE_URL must be set")?,
            token_endpoint_url: env::var("TOKEN_ENDPOINT_URL")
                .context("TOKEN_ENDPOINT_URL must be set")?,
            api_year: env::var("API_YEAR").unwrap_or_else(|_| Utc::now().year().to_string()),

            worker_concurrency: parse_env_or("WORKER_CONCURRENCY", 2)?,
            token_refresh_interval: Duration::from_secs(parse_env_or(
                "TOKEN_REFRESH_INTERVAL_SECS",
                240,
            )?),
            queue_cleanup_interval: Duration::from_secs(parse_env_or(
                "QUEUE_CLEANUP_INTERVAL_SECS",
                3600,
            )?),
            queue_cleanup_grace_period: Duration::from_secs(parse_env_or(
                "QUEUE_CLEANUP_GRACE_PERIOD_SECS",
                86_400,
            )?),
            scraper_rate_limit_cooldown: Duration::from_secs(parse_env_or(
                "SCRAPER_RATE_LIMIT_COOLDOWN_SECS",
                5,
            )?),
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid value: {e}")),
        Err(_) => Ok(default),
    }
}
