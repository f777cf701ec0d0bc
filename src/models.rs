//! Data model (spec §3): `PropertyRecord`, `ScrapeJob`, `MonitoredSearch`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// The unit persisted by the persistence gateway (component D).
///
/// Natural key: `property_id`. Upserts overwrite all mutable fields and
/// bump `updated_at`/`scraped_at`; the core never deletes a row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PropertyRecord {
    pub property_id: String,
    #[builder(default, setter(strip_option(fallback = maybe_owner_name)))]
    pub owner_name: Option<String>,
    #[builder(default, setter(strip_option(fallback = maybe_property_type)))]
    pub property_type: Option<String>,
    #[builder(default, setter(strip_option(fallback = maybe_city)))]
    pub city: Option<String>,
    #[builder(default, setter(strip_option(fallback = maybe_address)))]
    pub address: Option<String>,
    #[builder(default, setter(strip_option(fallback = maybe_assessed_value)))]
    pub assessed_value: Option<Decimal>,
    pub appraised_value: Decimal,
    #[builder(default, setter(strip_option(fallback = maybe_geo_id)))]
    pub geo_id: Option<String>,
    #[builder(default, setter(strip_option(fallback = maybe_legal_description)))]
    pub legal_description: Option<String>,
    #[builder(default, setter(strip_option))]
    pub search_term: Option<String>,
    pub scraped_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Status of a `ScrapeJob`. Transitions only `pending -> processing ->
/// {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "scrape_job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The durable record of one search execution (spec §3). This crate
/// stores `QueueJob`'s in-flight bookkeeping (lease, attempt, priority)
/// in the same row, so one table serves both the job-queue duties
/// (component E) and the audit record (component D's job-row writes).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScrapeJob {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub search_term: String,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub result_count: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    /// Observational progress reported by the worker pool (spec §4.F):
    /// 10 on claim, 30+growth mid-fetch, 100 on success.
    #[builder(default = 0)]
    pub progress_pct: i16,

    /// Whether this job was injected by the scheduler on behalf of a
    /// monitored search (spec §4.G: "scheduled jobs coexist with
    /// ad-hoc ones").
    #[builder(default = false)]
    pub scheduled: bool,
    #[builder(default = 1)]
    pub attempt: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    /// Lower is higher priority, matching the teacher's
    /// `JobPriority::as_i16` convention.
    #[builder(default = 2)]
    pub priority: i16,

    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub started_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl ScrapeJob {
    /// Whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Recurrence frequency for a `MonitoredSearch` (spec §3, §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "monitor_frequency", rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// The cron expression `tokio-cron-scheduler` uses for this
    /// frequency's trigger (spec §4.H).
    pub fn cron_expression(&self) -> &'static str {
        match self {
            Frequency::Hourly => "0 0 * * * *",
            Frequency::Daily => "0 0 2 * * *",
            Frequency::Weekly => "0 0 3 * * SUN",
            Frequency::Monthly => "0 0 4 1 * *",
        }
    }

    /// The duration until the next occurrence of this frequency from `from`.
    pub fn next_run_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Frequency::Hourly => from + chrono::Duration::hours(1),
            Frequency::Daily => from + chrono::Duration::days(1),
            Frequency::Weekly => from + chrono::Duration::weeks(1),
            Frequency::Monthly => from + chrono::Duration::days(30),
        }
    }
}

/// A persistent intent to re-scrape a term (spec §3, §4.H).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct MonitoredSearch {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub search_term: String,
    #[builder(default = true)]
    pub active: bool,
    pub frequency: Frequency,
    #[builder(default, setter(strip_option))]
    pub last_run: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_run: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Append-only per-term counters (component I).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SearchTermStats {
    pub search_term: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub records_yielded: i64,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_terminal_states() {
        let pending = ScrapeJob::builder().search_term("Trust").build();
        assert!(!pending.is_terminal());

        let completed = ScrapeJob::builder()
            .search_term("Trust")
            .status(JobStatus::Completed)
            .build();
        assert!(completed.is_terminal());
    }

    #[test]
    fn frequency_cron_expressions_are_distinct() {
        let all = [
            Frequency::Hourly,
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
        ];
        let exprs: std::collections::HashSet<_> =
            all.iter().map(|f| f.cron_expression()).collect();
        assert_eq!(exprs.len(), all.len());
    }
}
