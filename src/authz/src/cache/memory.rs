//! In-process policy cache backed by `DashMap`

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{clamp_ttl, CacheConfig, CacheKey, CacheStats, PolicyCache, PolicySet};
use crate::error::Result;

#[derive(Clone)]
struct CachedEntry {
    policies: PolicySet,
    inserted_at: Instant,
    expires_at: Instant,
}

impl CachedEntry {
    fn new(policies: PolicySet, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            policies,
            inserted_at: now,
            expires_at: now.checked_add(clamp_ttl(ttl)).unwrap_or(now),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process cache for single-instance deployments and tests
///
/// Sharded map reads never contend on a global lock. At capacity the oldest
/// tenth of the entries is evicted.
pub struct MemoryPolicyCache {
    entries: DashMap<CacheKey, CachedEntry>,
    /// Fill generation per app; the shard guard orders fills against invalidations
    generations: DashMap<String, u64>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Millis since epoch of the last write; 0 when never written
    last_updated: AtomicI64,
}

impl MemoryPolicyCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            last_updated: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len()) as u64;
        if removed > 0 {
            self.evictions.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    fn touch(&self) {
        self.last_updated
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn insert(&self, key: CacheKey, policies: PolicySet, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.capacity {
            self.evict_oldest();
        }
        self.entries.insert(key, CachedEntry::new(policies, ttl));
    }

    /// Drop expired entries first, then the oldest tenth if still full
    fn evict_oldest(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.config.capacity {
            return;
        }

        let to_remove = (self.config.capacity / 10).max(1);
        let mut by_age: Vec<(CacheKey, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().inserted_at))
            .collect();
        by_age.sort_by_key(|(_, inserted_at)| *inserted_at);

        let mut removed = 0;
        for (key, _) in by_age.into_iter().take(to_remove) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        debug!(removed, "Evicted oldest policy cache entries");
    }

    /// Advance the app's generation before its entries go, so a fill racing
    /// the removal either lands first and is removed or is refused
    fn advance_generation(&self, app_id: &str) {
        *self.generations.entry(app_id.to_string()).or_insert(0) += 1;
    }

    fn remove_where(&self, app_id: &str, predicate: impl Fn(&CacheKey) -> bool) -> u64 {
        self.advance_generation(app_id);
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        self.touch();
        before.saturating_sub(self.entries.len()) as u64
    }

    fn lookup(&self, key: &CacheKey) -> Option<PolicySet> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.policies.clone());
            }

            // Expired - remove and fall through to a miss
            drop(entry);
            if self
                .entries
                .remove_if(key, |_, entry| entry.is_expired())
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }
}

impl Default for MemoryPolicyCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl PolicyCache for MemoryPolicyCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<PolicySet>> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &CacheKey, policies: PolicySet, ttl: Duration) -> Result<()> {
        self.insert(key.clone(), policies, ttl);
        self.touch();
        Ok(())
    }

    async fn generation(&self, app_id: &str) -> Result<u64> {
        Ok(*self.generations.entry(app_id.to_string()).or_insert(0))
    }

    async fn set_if_generation(
        &self,
        key: &CacheKey,
        policies: PolicySet,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        let current = self.generations.entry(key.app_id.clone()).or_insert(0);
        if *current != generation {
            return Ok(false);
        }
        self.insert(key.clone(), policies, ttl);
        drop(current);
        self.touch();
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.advance_generation(&key.app_id);
        self.entries.remove(key);
        self.touch();
        Ok(())
    }

    async fn delete_by_app(&self, app_id: &str) -> Result<u64> {
        Ok(self.remove_where(app_id, |key| key.app_id == app_id))
    }

    async fn delete_by_environment(&self, app_id: &str, environment_id: &str) -> Result<u64> {
        Ok(self.remove_where(app_id, |key| {
            key.app_id == app_id && key.environment_id == environment_id
        }))
    }

    async fn delete_by_organization(&self, app_id: &str, organization_id: &str) -> Result<u64> {
        Ok(self.remove_where(app_id, |key| {
            key.app_id == app_id && key.organization_id.as_deref() == Some(organization_id)
        }))
    }

    async fn get_multi(&self, keys: &[CacheKey]) -> Result<Vec<Option<PolicySet>>> {
        Ok(keys.iter().map(|key| self.lookup(key)).collect())
    }

    async fn set_multi(&self, entries: Vec<(CacheKey, PolicySet)>, ttl: Duration) -> Result<()> {
        for (key, policies) in entries {
            self.insert(key, policies, ttl);
        }
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
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: CacheStats::compute_hit_rate(hits, misses),
            last_updated,
        })
    }

    async fn clear(&self) -> Result<()> {
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.entries.clear();
        self.touch();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use std::sync::Arc;

    fn key(org: Option<&str>, resource_type: &str) -> CacheKey {
        let scope = Scope::new("app", "prod", org).unwrap();
        CacheKey::new(&scope, resource_type)
    }

    fn empty_set() -> PolicySet {
        Arc::new(Vec::new())
    }

    #[tokio::test]
    async fn test_cache_hit_and_miss() {
        let cache = MemoryPolicyCache::default();
        let k = key(None, "document");

        assert!(cache.get(&k).await.unwrap().is_none());
        cache.set(&k, empty_set(), Duration::from_secs(60)).await.unwrap();
        assert!(cache.get(&k).await.unwrap().is_some());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate, 0.5);
        assert!(stats.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_cache_expiration() {
        let cache = MemoryPolicyCache::default();
        let k = key(None, "document");
        cache.set(&k, empty_set(), Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&k).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let cache = MemoryPolicyCache::new(CacheConfig {
            capacity: 10,
            ttl: Duration::from_secs(60),
        });

        for i in 0..15 {
            cache
                .set(&key(None, &format!("type{}", i)), empty_set(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert!(cache.len() <= 10);
        // Most recent entry survives
        assert!(cache.get(&key(None, "type14")).await.unwrap().is_some());
        assert!(cache.stats().await.unwrap().evictions >= 5);
    }

    #[tokio::test]
    async fn test_partition_invalidation() {
        let cache = MemoryPolicyCache::default();
        let ttl = Duration::from_secs(60);
        let global = key(None, "document");
        let org_a = key(Some("a"), "document");
        let org_b = key(Some("b"), "document");
        let other_env = CacheKey::new(&Scope::organization("app", "dev", "a").unwrap(), "document");
        let other_app = CacheKey::new(&Scope::environment("other", "prod").unwrap(), "document");

        cache
            .set_multi(
                vec![
                    (global.clone(), empty_set()),
                    (org_a.clone(), empty_set()),
                    (org_b.clone(), empty_set()),
                    (other_env.clone(), empty_set()),
                    (other_app.clone(), empty_set()),
                ],
                ttl,
            )
            .await
            .unwrap();

        assert_eq!(cache.delete_by_organization("app", "a").await.unwrap(), 2);
        let remaining = cache
            .get_multi(&[global.clone(), org_a, org_b.clone(), other_env])
            .await
            .unwrap();
        assert!(remaining[0].is_some());
        assert!(remaining[1].is_none());
        assert!(remaining[2].is_some());
        assert!(remaining[3].is_none());

        assert_eq!(cache.delete_by_environment("app", "prod").await.unwrap(), 2);
        assert!(cache.get(&org_b).await.unwrap().is_none());
        assert!(cache.get(&other_app).await.unwrap().is_some());

        assert_eq!(cache.delete_by_app("other").await.unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_clamped() {
        let cache = MemoryPolicyCache::default();
        let k = key(None, "document");

        cache.set(&k, empty_set(), Duration::from_secs(u64::MAX)).await.unwrap();
        assert!(cache.get(&k).await.unwrap().is_some());

        let g = cache.generation("app").await.unwrap();
        assert!(cache
            .set_if_generation(&k, empty_set(), Duration::MAX, g)
            .await
            .unwrap());
        assert!(cache.get(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fill_refused_after_invalidation() {
        let cache = MemoryPolicyCache::default();
        let ttl = Duration::from_secs(60);
        let org_a = key(Some("a"), "document");

        let before = cache.generation("app").await.unwrap();
        assert!(cache.set_if_generation(&org_a, empty_set(), ttl, before).await.unwrap());
        assert!(cache.get(&org_a).await.unwrap().is_some());

        // A reader took the generation, then a writer invalidated the partition
        let stale = cache.generation("app").await.unwrap();
        assert_eq!(cache.delete_by_organization("app", "a").await.unwrap(), 1);
        assert!(!cache.set_if_generation(&org_a, empty_set(), ttl, stale).await.unwrap());
        assert!(cache.get(&org_a).await.unwrap().is_none());

        // Invalidating an unrelated partition of the same app also refuses the fill
        let stale = cache.generation("app").await.unwrap();
        cache.delete_by_environment("app", "dev").await.unwrap();
        assert!(!cache.set_if_generation(&org_a, empty_set(), ttl, stale).await.unwrap());

        // Other apps keep their generation
        let other = CacheKey::new(&Scope::environment("other", "prod").unwrap(), "document");
        let other_gen = cache.generation("other").await.unwrap();
        cache.delete_by_app("app").await.unwrap();
        assert!(cache.set_if_generation(&other, empty_set(), ttl, other_gen).await.unwrap());

        let fresh = cache.generation("app").await.unwrap();
        assert!(cache.set_if_generation(&org_a, empty_set(), ttl, fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_and_delete_advance_generation() {
        let cache = MemoryPolicyCache::default();
        let ttl = Duration::from_secs(60);
        let k = key(None, "document");

        let g = cache.generation("app").await.unwrap();
        cache.clear().await.unwrap();
        assert!(!cache.set_if_generation(&k, empty_set(), ttl, g).await.unwrap());

        let g = cache.generation("app").await.unwrap();
        cache.delete(&k).await.unwrap();
        assert!(!cache.set_if_generation(&k, empty_set(), ttl, g).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let cache = Arc::new(MemoryPolicyCache::default());
        let mut handles = vec![];

        for i in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                let k = key(Some(&format!("org{}", i)), "document");
                cache.set(&k, empty_set(), Duration::from_secs(60)).await.unwrap();
                cache.get(&k).await.unwrap().is_some()
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.len(), 10);
    }
}
