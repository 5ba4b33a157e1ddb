//! Policy set cache behaviour seen through the engine and admin service

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{env_scope, org_scope, read, Harness};
use scopegate_authz::cache::{CacheConfig, CacheKey, MemoryPolicyCache, PolicyCache};
use scopegate_authz::{
    EngineConfig, InMemoryPolicyStore, NewPolicy, PolicyEngine, PolicyStore, PolicyUpdate, Scope,
    StaticAttributeProvider,
};

/// Harness whose engine and admin share a cache the test can inspect
async fn harness_with_memory_cache(ttl: Duration) -> (Harness, Arc<MemoryPolicyCache>) {
    let cache = Arc::new(MemoryPolicyCache::new(CacheConfig {
        capacity: 1000,
        ttl,
    }));
    let store = Arc::new(InMemoryPolicyStore::new());
    let attributes = Arc::new(StaticAttributeProvider::new());
    let config = EngineConfig {
        cache_config: CacheConfig { capacity: 1000, ttl },
        ..Default::default()
    };
    let engine = PolicyEngine::new(config, store.clone(), attributes.clone())
        .await
        .unwrap()
        .with_cache(Some(cache.clone()));
    (Harness::assemble(store, attributes, engine), cache)
}

async fn cached(cache: &MemoryPolicyCache, scope: &Scope) -> bool {
    cache
        .get(&CacheKey::new(scope, "document"))
        .await
        .unwrap()
        .is_some()
}

/// Populate the cache entry of `scope` by authorizing once
async fn prime(h: &Harness, scope: &Scope) {
    h.engine.authorize(&read(scope, "u1", "d1")).await.unwrap();
}

#[tokio::test]
async fn test_authorize_fills_cache() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    let scope = env_scope();
    h.policy(&scope, "all", &["read"], "true", 0).await;

    assert!(!cached(&cache, &scope).await);
    prime(&h, &scope).await;
    assert!(cached(&cache, &scope).await);

    let set = cache
        .get(&CacheKey::new(&scope, "document"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set[0].name, "all");
}

#[tokio::test]
async fn test_organization_mutation_invalidates_only_that_organization() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    let global = env_scope();
    let org_a = org_scope("org-a");
    let org_b = org_scope("org-b");
    h.policy(&global, "baseline", &["read"], "true", 0).await;

    for scope in [&global, &org_a, &org_b] {
        prime(&h, scope).await;
        assert!(cached(&cache, scope).await);
    }

    h.policy(&org_a, "a-extra", &["write"], "true", 0).await;

    assert!(!cached(&cache, &org_a).await);
    assert!(cached(&cache, &org_b).await);
    assert!(cached(&cache, &global).await);
}

#[tokio::test]
async fn test_environment_mutation_invalidates_every_organization() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    let global = env_scope();
    let org_a = org_scope("org-a");
    let other_env = Scope::organization("appX", "staging", "org-a").unwrap();
    let baseline = h.policy(&global, "baseline", &["read"], "true", 0).await;

    for scope in [&global, &org_a, &other_env] {
        prime(&h, scope).await;
    }

    h.admin
        .update_policy(
            &baseline.id,
            PolicyUpdate::new(baseline.version).priority(3),
            &h.ctx,
        )
        .await
        .unwrap();

    assert!(!cached(&cache, &global).await);
    assert!(!cached(&cache, &org_a).await);
    assert!(cached(&cache, &other_env).await);
}

#[tokio::test]
async fn test_warm_cache_groups_by_resource_type() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    let scope = env_scope();
    let ns = h.namespace(&scope).await;
    h.policy(&scope, "docs", &["read"], "true", 0).await;
    h.admin
        .create_policy(
            NewPolicy::new(scope.clone(), ns.id, "invoices", "invoice", &["pay"], "true"),
            &h.ctx,
        )
        .await
        .unwrap();

    let written = h.admin.warm_cache(&scope).await.unwrap();
    assert_eq!(written, 2);
    assert!(cached(&cache, &scope).await);
    assert!(cache
        .get(&CacheKey::new(&scope, "invoice"))
        .await
        .unwrap()
        .is_some());

    prime(&h, &scope).await;
    let metrics = h.engine.get_metrics().await.unwrap();
    assert_eq!(metrics.cache_misses, 0);
    assert_eq!(metrics.cache_hits, 1);
}

#[tokio::test]
async fn test_invalidate_app() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    h.policy(&env_scope(), "all", &["read"], "true", 0).await;
    prime(&h, &env_scope()).await;
    prime(&h, &org_scope("org-a")).await;

    assert_eq!(h.admin.invalidate_app("appX").await.unwrap(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_ttl_bounds_staleness_of_missed_invalidation() {
    let (h, _cache) = harness_with_memory_cache(Duration::from_millis(100)).await;
    let scope = env_scope();
    let policy = h.policy(&scope, "all", &["read"], "true", 0).await;
    prime(&h, &scope).await;

    // Writing behind the admin service skips invalidation
    h.store
        .update_policy(&policy.id, PolicyUpdate::new(policy.version).enabled(false))
        .await
        .unwrap();

    assert!(h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_update_during_slow_load_is_not_cached() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    let scope = env_scope();
    let policy = h.policy(&scope, "all", &["read"], "true", 0).await;

    // Loads snapshot the store, then take 200ms to come back
    h.store.set_read_lag(Duration::from_millis(200));
    let engine = Arc::clone(&h.engine);
    let request = read(&scope, "u1", "d1");
    let in_flight = tokio::spawn(async move { engine.authorize(&request).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.admin
        .update_policy(
            &policy.id,
            PolicyUpdate::new(policy.version).enabled(false),
            &h.ctx,
        )
        .await
        .unwrap();

    // Denied as soon as the update returned, while the older load is still running
    let after = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert!(!after.is_allowed());

    // The older load answered from its snapshot but could not fill the cache
    assert!(in_flight.await.unwrap().unwrap().is_allowed());
    let set = cache
        .get(&CacheKey::new(&scope, "document"))
        .await
        .unwrap()
        .unwrap();
    assert!(set.is_empty());

    h.store.set_read_lag(Duration::ZERO);
    assert!(!h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_warm_cache_skips_sets_changed_during_load() {
    let (h, cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    let scope = env_scope();
    let policy = h.policy(&scope, "all", &["read"], "true", 0).await;

    h.store.set_read_lag(Duration::from_millis(200));
    let admin = scopegate_authz::PolicyAdmin::for_engine(&h.engine);
    let warm_scope = scope.clone();
    let warming = tokio::spawn(async move { admin.warm_cache(&warm_scope).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.admin.delete_policy(&policy.id, &h.ctx).await.unwrap();

    assert_eq!(warming.await.unwrap().unwrap(), 0);
    assert!(!cached(&cache, &scope).await);

    h.store.set_read_lag(Duration::ZERO);
    assert!(!h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_disabled_cache_reads_store_every_time() {
    let h = Harness::with_config(EngineConfig {
        enable_cache: false,
        ..Default::default()
    })
    .await;
    let scope = env_scope();
    let policy = h.policy(&scope, "all", &["read"], "true", 0).await;
    prime(&h, &scope).await;

    h.store
        .update_policy(&policy.id, PolicyUpdate::new(policy.version).enabled(false))
        .await
        .unwrap();
    assert!(!h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());
    assert!(h.engine.get_cache_stats().await.is_none());
}

#[tokio::test]
async fn test_cache_stats_are_exposed() {
    let (h, _cache) = harness_with_memory_cache(Duration::from_secs(60)).await;
    h.policy(&env_scope(), "all", &["read"], "true", 0).await;
    prime(&h, &env_scope()).await;
    prime(&h, &env_scope()).await;

    let stats = h.engine.get_cache_stats().await.unwrap().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.size, 1);
    assert!(stats.last_updated.is_some());
}
