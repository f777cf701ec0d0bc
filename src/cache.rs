//! Read-side cache (spec §6 "Cache"): a key-value cache the persistence
//! gateway invalidates after a successful upsert. The core only ever
//! touches `properties:list:*` and `properties:stats:all`.

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

pub const LIST_QUERY_PATTERN: &str = "properties:list:*";
pub const STATS_KEY: &str = "properties:stats:all";

#[derive(Clone)]
pub struct Cache {
    pool: Pool<RedisConnectionManager>,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let manager = RedisConnectionManager::new(redis_url)?;
        let pool = Pool::builder().build(manager).await?;
        Ok(Self { pool })
    }

    /// Deletes every key matching `pattern` (a `*`-suffixed prefix).
    pub async fn delete_pattern(&self, pattern: &str) -> anyhow::Result<u64> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = conn.del(&keys).await?;
        debug!(pattern, deleted, "invalidated cache keys");
        Ok(deleted)
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Invalidates both cache surfaces the core touches, after a
    /// successful upsert (spec §4.D).
    pub async fn invalidate_property_caches(&self) {
        if let Err(e) = self.delete_pattern(LIST_QUERY_PATTERN).await {
            warn!(error = %e, "failed to invalidate list-query cache");
        }
        if let Err(e) = self.delete(STATS_KEY).await {
            warn!(error = %e, "failed to invalidate stats cache");
        }
    }
}
