//! Redis-backed shared policy cache for multi-instance deployments

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use super::{clamp_ttl, escape_component, CacheKey, CacheStats, PolicyCache, PolicySet};
use crate::error::{AuthzError, Result};
use crate::policy::CompiledPolicy;

/// Redis cache configuration
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix for every key written by this cache
    pub key_prefix: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Budget for a single command
    pub command_timeout: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "authz:policies:".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_millis(250),
        }
    }
}

/// Shared policy cache
///
/// Entries are JSON-encoded policy sets written with `SET .. EX`.
/// Partition invalidation walks the keyspace with `SCAN MATCH` and deletes
/// in batches, so it only touches this cache's prefix.
///
/// Each app's fill generation lives in `{prefix}~gen:{app}`. Invalidation
/// runs `INCR` on it before deleting; guarded fills compare and write in one
/// Lua script. Escaped components never start with `~`, so no partition glob
/// reaches a generation key.
pub struct RedisPolicyCache {
    connection: MultiplexedConnection,
    config: RedisCacheConfig,
    fill_script: redis::Script,
    hits: AtomicU64,
    misses: AtomicU64,
    last_updated: AtomicI64,
}

/// KEYS[1] generation, KEYS[2] entry; ARGV expected generation, payload, ttl
const FILL_IF_GENERATION: &str = r"
local current = redis.call('GET', KEYS[1]) or '0'
if current == ARGV[1] then
    redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
";

fn redis_error(context: &str, err: redis::RedisError) -> AuthzError {
    AuthzError::RepositoryUnavailable(format!("{}: {}", context, err))
}

impl RedisPolicyCache {
    /// Connect and verify the server answers `PING`.
    pub async fn new(config: RedisCacheConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| redis_error("Failed to create Redis client", e))?;

        let mut connection = tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| AuthzError::Timeout("connecting to Redis".to_string()))?
        .map_err(|e| redis_error("Failed to connect to Redis", e))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| redis_error("Redis ping failed", e))?;

        info!(url = %config.url, "Redis policy cache connected");

        Ok(Self {
            connection,
            config,
            fill_script: redis::Script::new(FILL_IF_GENERATION),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_updated: AtomicI64::new(0),
        })
    }

    fn full_key(&self, key: &CacheKey) -> String {
        key.render(&self.config.key_prefix)
    }

    fn generation_prefix(&self) -> String {
        format!("{}~gen:", self.config.key_prefix)
    }

    fn generation_key(&self, app_id: &str) -> String {
        format!("{}{}", self.generation_prefix(), escape_component(app_id))
    }

    async fn advance_generation(&self, app_id: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded::<u64, _>("INCR", conn.incr(self.generation_key(app_id), 1))
            .await?;
        Ok(())
    }

    fn touch(&self) {
        self.last_updated
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Run one command future under the command timeout
    async fn bounded<T, F>(&self, context: &str, command: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.config.command_timeout, command)
            .await
            .map_err(|_| AuthzError::Timeout(context.to_string()))?
            .map_err(|e| redis_error(context, e))
    }

    fn decode(&self, bytes: Option<Vec<u8>>) -> Result<Option<PolicySet>> {
        match bytes {
            Some(bytes) => {
                let policies: Vec<CompiledPolicy> = serde_json::from_slice(&bytes)?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(PolicySet::new(policies)))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Delete entries matching `pattern`. Generation keys under the pattern
    /// are advanced instead of deleted.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let generation_prefix = self.generation_prefix();
        let mut cursor: u64 = 0;
        let mut total_deleted = 0;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;

            let (generations, entries): (Vec<String>, Vec<String>) = keys
                .into_iter()
                .partition(|key| key.starts_with(&generation_prefix));

            for generation in &generations {
                self.bounded::<u64, _>("INCR", conn.incr(generation, 1)).await?;
            }
            if !entries.is_empty() {
                let deleted: i64 = self.bounded("DEL", conn.del(&entries)).await?;
                total_deleted += deleted as u64;
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        self.touch();
        Ok(total_deleted)
    }

    async fn count_keys(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.config.key_prefix);
        let generation_prefix = self.generation_prefix();
        let mut cursor: u64 = 0;
        let mut total = 0;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query_async(&mut conn),
                )
                .await?;
            total += keys
                .iter()
                .filter(|key| !key.starts_with(&generation_prefix))
                .count();
            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total)
    }
}

#[async_trait]
impl PolicyCache for RedisPolicyCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<PolicySet>> {
        let mut conn = self.connection.clone();
        let data: Option<Vec<u8>> = self.bounded("GET", conn.get(self.full_key(key))).await?;
        self.decode(data)
    }

    async fn set(&self, key: &CacheKey, policies: PolicySet, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let data = serde_json::to_vec(policies.as_ref())?;
        let ttl_secs = clamp_ttl(ttl).as_secs().max(1);
        self.bounded::<(), _>("SET", conn.set_ex(self.full_key(key), data, ttl_secs))
            .await?;
        self.touch();
        Ok(())
    }

    async fn generation(&self, app_id: &str) -> Result<u64> {
        // INCRBY 0 materializes the key, so a later clear advances it too
        let mut conn = self.connection.clone();
        self.bounded("INCRBY", conn.incr(self.generation_key(app_id), 0))
            .await
    }

    async fn set_if_generation(
        &self,
        key: &CacheKey,
        policies: PolicySet,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let data = serde_json::to_vec(policies.as_ref())?;
        let ttl_secs = clamp_ttl(ttl).as_secs().max(1);
        let written: i64 = self
            .bounded(
                "EVALSHA",
                self.fill_script
                    .key(self.generation_key(&key.app_id))
                    .key(self.full_key(key))
                    .arg(generation)
                    .arg(data)
                    .arg(ttl_secs)
                    .invoke_async(&mut conn),
            )
            .await?;
        if written == 1 {
            self.touch();
        }
        Ok(written == 1)
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.advance_generation(&key.app_id).await?;
        let mut conn = self.connection.clone();
        self.bounded::<i64, _>("DEL", conn.del(self.full_key(key)))
            .await?;
        self.touch();
        Ok(())
    }

    async fn delete_by_app(&self, app_id: &str) -> Result<u64> {
        self.advance_generation(app_id).await?;
        self.delete_by_pattern(&CacheKey::app_pattern(&self.config.key_prefix, app_id))
            .await
    }

    async fn delete_by_environment(&self, app_id: &str, environment_id: &str) -> Result<u64> {
        self.advance_generation(app_id).await?;
        self.delete_by_pattern(&CacheKey::environment_pattern(
            &self.config.key_prefix,
            app_id,
            environment_id,
        ))
        .await
    }

    async fn delete_by_organization(&self, app_id: &str, organization_id: &str) -> Result<u64> {
        self.advance_generation(app_id).await?;
        self.delete_by_pattern(&CacheKey::organization_pattern(
            &self.config.key_prefix,
            app_id,
            organization_id,
        ))
        .await
    }

    async fn get_multi(&self, keys: &[CacheKey]) -> Result<Vec<Option<PolicySet>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let values: Vec<Option<Vec<u8>>> = self
            .bounded(
                "MGET",
                redis::cmd("MGET").arg(&full_keys).query_async(&mut conn),
            )
            .await?;

        values.into_iter().map(|v| self.decode(v)).collect()
    }

    async fn set_multi(&self, entries: Vec<(CacheKey, PolicySet)>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let ttl_secs = clamp_ttl(ttl).as_secs().max(1);
        let mut pipe = redis::pipe();
        for (key, policies) in &entries {
            let data = serde_json::to_vec(policies.as_ref())?;
            pipe.set_ex(self.full_key(key), data, ttl_secs).ignore();
        }

        let mut conn = self.connection.clone();
        self.bounded::<(), _>("SET pipeline", pipe.query_async(&mut conn))
            .await?;
        self.touch();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let last_updated = match self.last_updated.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        };

        Ok(CacheStats {
            hits,
            misses,
            // Redis expires and evicts on its own; those are not observable here
            evictions: 0,
            size: self.count_keys().await?,
            hit_rate: CacheStats::compute_hit_rate(hits, misses),
            last_updated,
        })
    }

    async fn clear(&self) -> Result<()> {
        let pattern = format!("{}*", self.config.key_prefix);
        let removed = self.delete_by_pattern(&pattern).await?;
        info!(removed, "Cleared Redis policy cache");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
