use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{PersistenceGateway, UPSERT_CHUNK_SIZE};
use crate::cache::Cache;
use crate::error::PersistenceError;
use crate::models::PropertyRecord;

pub struct PostgresGateway {
    pool: PgPool,
    cache: Cache,
}

impl PostgresGateway {
    pub fn new(pool: PgPool, cache: Cache) -> Self {
        Self { pool, cache }
    }

    async fn upsert_chunk(&self, chunk: &[PropertyRecord]) -> Result<u64, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for record in chunk {
            let result = sqlx::query(
                r#"
                INSERT INTO property_records (
                    property_id, owner_name, property_type, city, address,
                    assessed_value, appraised_value, geo_id, legal_description,
                    search_term, scraped_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
                ON CONFLICT (property_id) DO UPDATE SET
                    owner_name = EXCLUDED.owner_name,
                    property_type = EXCLUDED.property_type,
                    city = EXCLUDED.city,
                    address = EXCLUDED.address,
                    assessed_value = EXCLUDED.assessed_value,
                    appraised_value = EXCLUDED.appraised_value,
                    geo_id = EXCLUDED.geo_id,
                    legal_description = EXCLUDED.legal_description,
                    search_term = EXCLUDED.search_term,
                    scraped_at = EXCLUDED.scraped_at,
                    updated_at = NOW()
                "#,
            )
            .bind(&record.property_id)
            .bind(&record.owner_name)
            .bind(&record.property_type)
            .bind(&record.city)
            .bind(&record.address)
            .bind(record.assessed_value)
            .bind(record.appraised_value)
            .bind(&record.geo_id)
            .bind(&record.legal_description)
            .bind(&record.search_term)
            .bind(record.scraped_at)
            .execute(&mut *tx)
            .await?;

            affected += result.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    async fn upsert(
        &self,
        records: &[PropertyRecord],
        search_term: &str,
    ) -> Result<usize, PersistenceError> {
        let mut total = 0usize;

        for chunk in records.chunks(UPSERT_CHUNK_SIZE) {
            let affected = self.upsert_chunk(chunk).await?;
            total += affected as usize;
        }

        debug!(search_term, accepted = total, "upsert complete");
        self.cache.invalidate_property_caches().await;

        Ok(total)
    }
}
