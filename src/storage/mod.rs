//! Persistence gateway (component D): batch upsert of result records
//! and read-side cache invalidation. Job-row lifecycle (claim, ack,
//! retry, fail) lives in the queue broker (component E), since both
//! share the one `scrape_jobs` table and the queue is the side that
//! owns its concurrency control (`FOR UPDATE SKIP LOCKED`).

mod postgres;

pub use postgres::PostgresGateway;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::models::PropertyRecord;

/// Batch size per persistence round-trip (spec §4.D).
pub const UPSERT_CHUNK_SIZE: usize = 500;

/// The single operation component F (the worker pool) consumes.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Upserts `records`, chunked into batches of up to
    /// [`UPSERT_CHUNK_SIZE`]. Each chunk is a single atomic
    /// insert-on-conflict-update transaction; a chunk failure fails the
    /// whole call. On success, invalidates the read-side cache and
    /// returns the count of records accepted.
    async fn upsert(
        &self,
        records: &[PropertyRecord],
        search_term: &str,
    ) -> Result<usize, PersistenceError>;
}
