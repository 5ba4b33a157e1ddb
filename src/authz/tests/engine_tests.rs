//! Authorization pipeline tests
//!
//! Scope resolution → policy set loading → action filter → priority order →
//! condition evaluation → decision

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{attrs, env_scope, org_scope, read, Harness};
use scopegate_authz::audit::DECISION_ACTION;
use scopegate_authz::cache::{CacheKey, CacheStats, PolicyCache, PolicySet};
use scopegate_authz::{
    AttrValue, AuditFilter, AuthorizeRequest, AuthzError, EngineConfig, Outcome, PolicyStore,
    PolicyUpdate, RequestContext, Result,
};

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_owner_can_read_document() {
    let h = Harness::new().await;
    let scope = env_scope();
    let policy = h
        .policy(&scope, "owner-read", &["read"], "resource.ownerId == subject.id", 0)
        .await;
    h.document(&scope, "d1", attrs(&[("ownerId", "u1".into())]));

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Allow);
    assert_eq!(decision.matched_policy_id, Some(policy.id));

    let decision = h.engine.authorize(&read(&scope, "u2", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);
    assert!(decision.matched_policy_id.is_none());
}

#[tokio::test]
async fn test_disabled_policy_denies() {
    let h = Harness::new().await;
    let scope = env_scope();
    let policy = h
        .policy(&scope, "owner-read", &["read"], "resource.ownerId == subject.id", 0)
        .await;
    h.document(&scope, "d1", attrs(&[("ownerId", "u1".into())]));
    assert!(h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());

    h.admin
        .update_policy(&policy.id, PolicyUpdate::new(policy.version).enabled(false), &h.ctx)
        .await
        .unwrap();

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);
}

#[tokio::test]
async fn test_deleted_policy_denies() {
    let h = Harness::new().await;
    let scope = env_scope();
    let policy = h
        .policy(&scope, "owner-read", &["read"], "resource.ownerId == subject.id", 0)
        .await;
    h.document(&scope, "d1", attrs(&[("ownerId", "u1".into())]));
    assert!(h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());

    h.admin.delete_policy(&policy.id, &h.ctx).await.unwrap();
    h.admin.invalidate_app("appX").await.unwrap();

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);
    assert!(decision.matched_policy_id.is_none());
}

// ============================================================================
// CANDIDATE SELECTION AND ORDER
// ============================================================================

#[tokio::test]
async fn test_higher_priority_wins() {
    let h = Harness::new().await;
    let scope = env_scope();
    let low = h.policy(&scope, "low", &["read"], "true", 5).await;
    let high = h.policy(&scope, "high", &["read"], "true", 10).await;

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(high.id));
    assert_ne!(decision.matched_policy_id, Some(low.id));
}

#[tokio::test]
async fn test_newest_wins_on_equal_priority() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "older", &["read"], "true", 1).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = h.policy(&scope, "newer", &["read"], "true", 1).await;

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(newer.id));
}

#[tokio::test]
async fn test_action_filter_and_wildcard() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "writers", &["write"], "true", 0).await;

    let delete = AuthorizeRequest::new("appX", "envX", "u1", "delete", "document", "d1");
    assert!(!h.engine.authorize(&delete).await.unwrap().is_allowed());
    assert!(!h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());

    let any = h.policy(&scope, "anything", &["*"], "subject.id == 'root'", 0).await;
    h.admin.invalidate_app("appX").await.unwrap();

    let root_delete = AuthorizeRequest::new("appX", "envX", "root", "delete", "document", "d1");
    let decision = h.engine.authorize(&root_delete).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(any.id));
}

#[tokio::test]
async fn test_no_policies_denies() {
    let h = Harness::new().await;
    let decision = h
        .engine
        .authorize(&read(&env_scope(), "u1", "d1"))
        .await
        .unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);
    assert!(decision.matched_policy_id.is_none());
}

#[tokio::test]
async fn test_other_resource_type_is_ignored() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "docs", &["read"], "true", 0).await;

    let request = AuthorizeRequest::new("appX", "envX", "u1", "read", "invoice", "i1");
    assert!(!h.engine.authorize(&request).await.unwrap().is_allowed());
}

// ============================================================================
// SCOPE ISOLATION
// ============================================================================

#[tokio::test]
async fn test_organization_policies_are_isolated() {
    let h = Harness::new().await;
    let org_a = org_scope("org-a");
    let org_b = org_scope("org-b");
    let policy = h.policy(&org_a, "a-only", &["read"], "true", 0).await;

    let decision = h.engine.authorize(&read(&org_a, "u1", "d1")).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(policy.id));

    let decision = h.engine.authorize(&read(&org_b, "u1", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);

    // Environment-global callers do not see organization policies either
    let decision = h.engine.authorize(&read(&env_scope(), "u1", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);
}

#[tokio::test]
async fn test_environment_policies_apply_to_every_organization() {
    let h = Harness::new().await;
    let global = h.policy(&env_scope(), "baseline", &["read"], "true", 0).await;

    for org in ["org-a", "org-b"] {
        let decision = h
            .engine
            .authorize(&read(&org_scope(org), "u1", "d1"))
            .await
            .unwrap();
        assert_eq!(decision.matched_policy_id.as_deref(), Some(global.id.as_str()));
    }
}

#[tokio::test]
async fn test_organization_policy_outranks_baseline() {
    let h = Harness::new().await;
    h.policy(&env_scope(), "baseline", &["read"], "true", 0).await;
    let specific = h.policy(&org_scope("org-a"), "specific", &["read"], "true", 10).await;

    let decision = h
        .engine
        .authorize(&read(&org_scope("org-a"), "u1", "d1"))
        .await
        .unwrap();
    assert_eq!(decision.matched_policy_id, Some(specific.id));
}

#[tokio::test]
async fn test_missing_scope_fails_closed() {
    let h = Harness::new().await;
    let request = AuthorizeRequest::new("appX", " ", "u1", "read", "document", "d1");

    let err = h.engine.authorize(&request).await.unwrap_err();
    assert!(matches!(err.error, AuthzError::ScopeRequired(_)));
    assert_eq!(err.decision.outcome, Outcome::Deny);
}

// ============================================================================
// ATTRIBUTES AND CONDITIONS
// ============================================================================

#[tokio::test]
async fn test_membership_over_subject_roles() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "admins", &["read"], "'admin' in subject.roles", 0).await;
    h.user(
        &scope,
        "u1",
        attrs(&[(
            "roles",
            AttrValue::List(vec!["viewer".into(), "admin".into()]),
        )]),
    );
    h.user(&scope, "u2", attrs(&[("roles", AttrValue::List(vec!["viewer".into()]))]));

    assert!(h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());
    assert!(!h.engine.authorize(&read(&scope, "u2", "d1")).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_request_context_attributes() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(
        &scope,
        "internal-api",
        &["read"],
        "request.channel == 'api' && request.ip == '10.1.2.3'",
        0,
    )
    .await;

    let context = RequestContext::new()
        .with_ip("10.1.2.3")
        .with_attribute("channel", "api");
    let request = read(&scope, "u1", "d1").with_context(context);
    assert!(h.engine.authorize(&request).await.unwrap().is_allowed());

    let other = read(&scope, "u1", "d1").with_context(RequestContext::new().with_ip("10.1.2.3"));
    assert!(!h.engine.authorize(&other).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_failing_candidate_is_skipped() {
    let h = Harness::new().await;
    let scope = env_scope();
    // A string in boolean position fails at evaluation time
    h.policy(&scope, "non-boolean", &["read"], "subject.id", 10).await;
    let fallback = h.policy(&scope, "fallback", &["read"], "true", 0).await;

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(fallback.id));

    let metrics = h.engine.get_metrics().await.unwrap();
    assert_eq!(metrics.skipped_candidates, 1);
}

#[tokio::test]
async fn test_failed_attribute_source_reads_as_undefined() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "engineers", &["read"], "subject.department == 'eng'", 5).await;
    let public = h.policy(&scope, "public", &["read"], "resource.public == true", 0).await;
    h.user(&scope, "u1", attrs(&[("department", "eng".into())]));
    h.document(&scope, "d1", attrs(&[("public", true.into())]));

    h.attributes.fail_users(true);
    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(public.id));

    h.attributes.fail_resources(true);
    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Deny);
}

#[tokio::test]
async fn test_repeated_calls_are_identical() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "owner-read", &["read"], "resource.ownerId == subject.id", 0)
        .await;
    h.document(&scope, "d1", attrs(&[("ownerId", "u1".into())]));

    let first = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    for _ in 0..5 {
        assert_eq!(h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap(), first);
    }
}

// ============================================================================
// CACHE AND STORE FAILURES
// ============================================================================

#[tokio::test]
async fn test_updated_expression_takes_effect_immediately() {
    let h = Harness::new().await;
    let scope = env_scope();
    let policy = h
        .policy(&scope, "owner-read", &["read"], "resource.ownerId == subject.id", 0)
        .await;
    h.document(&scope, "d1", attrs(&[("ownerId", "u1".into())]));
    assert!(h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());

    h.admin
        .update_policy(
            &policy.id,
            PolicyUpdate::new(policy.version).expression("subject.id == 'u2'"),
            &h.ctx,
        )
        .await
        .unwrap();

    assert!(!h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap().is_allowed());
    assert!(h.engine.authorize(&read(&scope, "u2", "d1")).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_cache_hits_after_first_load() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "all", &["read"], "true", 0).await;

    for _ in 0..3 {
        h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    }

    let metrics = h.engine.get_metrics().await.unwrap();
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.cache_hits, 2);
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.allowed_decisions, 3);
}

/// Cache backend that fails every call
struct BrokenCache;

fn broken() -> AuthzError {
    AuthzError::RepositoryUnavailable("cache down".to_string())
}

#[async_trait]
impl PolicyCache for BrokenCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<PolicySet>> {
        Err(broken())
    }
    async fn set(&self, _key: &CacheKey, _policies: PolicySet, _ttl: Duration) -> Result<()> {
        Err(broken())
    }
    async fn generation(&self, _app_id: &str) -> Result<u64> {
        Err(broken())
    }
    async fn set_if_generation(
        &self,
        _key: &CacheKey,
        _policies: PolicySet,
        _ttl: Duration,
        _generation: u64,
    ) -> Result<bool> {
        Err(broken())
    }
    async fn delete(&self, _key: &CacheKey) -> Result<()> {
        Err(broken())
    }
    async fn delete_by_app(&self, _app_id: &str) -> Result<u64> {
        Err(broken())
    }
    async fn delete_by_environment(&self, _app_id: &str, _environment_id: &str) -> Result<u64> {
        Err(broken())
    }
    async fn delete_by_organization(&self, _app_id: &str, _organization_id: &str) -> Result<u64> {
        Err(broken())
    }
    async fn get_multi(&self, _keys: &[CacheKey]) -> Result<Vec<Option<PolicySet>>> {
        Err(broken())
    }
    async fn set_multi(&self, _entries: Vec<(CacheKey, PolicySet)>, _ttl: Duration) -> Result<()> {
        Err(broken())
    }
    async fn stats(&self) -> Result<CacheStats> {
        Err(broken())
    }
    async fn clear(&self) -> Result<()> {
        Err(broken())
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

/// Cache backend that never answers in time
struct StalledCache;

#[async_trait]
impl PolicyCache for StalledCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<PolicySet>> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(None)
    }
    async fn set(&self, _key: &CacheKey, _policies: PolicySet, _ttl: Duration) -> Result<()> {
        Ok(())
    }
    async fn generation(&self, _app_id: &str) -> Result<u64> {
        Ok(0)
    }
    async fn set_if_generation(
        &self,
        _key: &CacheKey,
        _policies: PolicySet,
        _ttl: Duration,
        _generation: u64,
    ) -> Result<bool> {
        Ok(true)
    }
    async fn delete(&self, _key: &CacheKey) -> Result<()> {
        Ok(())
    }
    async fn delete_by_app(&self, _app_id: &str) -> Result<u64> {
        Ok(0)
    }
    async fn delete_by_environment(&self, _app_id: &str, _environment_id: &str) -> Result<u64> {
        Ok(0)
    }
    async fn delete_by_organization(&self, _app_id: &str, _organization_id: &str) -> Result<u64> {
        Ok(0)
    }
    async fn get_multi(&self, keys: &[CacheKey]) -> Result<Vec<Option<PolicySet>>> {
        Ok(vec![None; keys.len()])
    }
    async fn set_multi(&self, _entries: Vec<(CacheKey, PolicySet)>, _ttl: Duration) -> Result<()> {
        Ok(())
    }
    async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            hits: 0,
            misses: 0,
            evictions: 0,
            size: 0,
            hit_rate: 0.0,
            last_updated: None,
        })
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "stalled"
    }
}

async fn harness_with_cache(cache: Arc<dyn PolicyCache>) -> Harness {
    let store = Arc::new(scopegate_authz::InMemoryPolicyStore::new());
    let attributes = Arc::new(scopegate_authz::StaticAttributeProvider::new());
    let config = EngineConfig {
        cache_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    let engine = scopegate_authz::PolicyEngine::new(config, store.clone(), attributes.clone())
        .await
        .unwrap()
        .with_cache(Some(cache));
    Harness::assemble(store, attributes, engine)
}

#[tokio::test]
async fn test_cache_errors_fall_back_to_store() {
    let h = harness_with_cache(Arc::new(BrokenCache)).await;
    let scope = env_scope();
    // Invalidation failure after commit does not fail the mutation
    let policy = h.policy(&scope, "all", &["read"], "true", 0).await;

    let decision = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap();
    assert_eq!(decision.matched_policy_id, Some(policy.id));

    let metrics = h.engine.get_metrics().await.unwrap();
    assert_eq!(metrics.cache_fallbacks, 1);
}

#[tokio::test]
async fn test_cache_timeout_falls_back_to_store() {
    let h = harness_with_cache(Arc::new(StalledCache)).await;
    let scope = env_scope();
    h.policy(&scope, "all", &["read"], "true", 0).await;

    let decision = tokio::time::timeout(
        Duration::from_secs(2),
        h.engine.authorize(&read(&scope, "u1", "d1")),
    )
    .await
    .expect("authorize must not wait for the stalled cache")
    .unwrap();
    assert!(decision.is_allowed());
}

#[tokio::test]
async fn test_store_failure_denies_with_error() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "all", &["read"], "true", 0).await;

    h.store.set_unavailable(true);
    let err = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap_err();
    assert!(matches!(err.error, AuthzError::RepositoryUnavailable(_)));
    assert_eq!(err.decision.outcome, Outcome::Deny);
    assert!(err.decision.matched_policy_id.is_none());

    let metrics = h.engine.get_metrics().await.unwrap();
    assert_eq!(metrics.store_errors, 1);
    assert_eq!(metrics.denied_decisions, 1);
}

#[tokio::test]
async fn test_store_timeout_denies_with_error() {
    let h = Harness::with_config(EngineConfig {
        store_timeout: Duration::from_millis(20),
        ..Default::default()
    })
    .await;
    let scope = env_scope();
    h.policy(&scope, "all", &["read"], "true", 0).await;

    h.store.set_latency(Duration::from_millis(200));
    let err = h.engine.authorize(&read(&scope, "u1", "d1")).await.unwrap_err();
    assert!(matches!(err.error, AuthzError::Timeout(_)));
    assert!(err.error.is_transient());
    assert!(!err.decision.is_allowed());
}

// ============================================================================
// AUDIT AND CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_decisions_are_audited() {
    let h = Harness::new().await;
    let scope = env_scope();
    let policy = h.policy(&scope, "all", &["read"], "true", 0).await;

    let request = read(&scope, "u1", "d1").with_context(
        RequestContext::new()
            .with_ip("192.0.2.7")
            .with_user_agent("tests/1.0"),
    );
    h.engine.authorize(&request).await.unwrap();
    h.engine.recorder().flush().await;

    let filter = AuditFilter {
        action: Some(DECISION_ACTION.to_string()),
        ..Default::default()
    };
    let events = h.store.list_audit_events(&scope, &filter).await.unwrap();
    assert_eq!(events.total, 1);

    let event = &events.items[0];
    assert_eq!(event.actor_id, "u1");
    assert_eq!(event.resource_type, "document");
    assert_eq!(event.resource_id, "d1");
    assert_eq!(event.ip_address.as_deref(), Some("192.0.2.7"));
    assert_eq!(event.user_agent.as_deref(), Some("tests/1.0"));

    let value = event.new_value.as_ref().unwrap();
    assert_eq!(value["outcome"], "allow");
    assert_eq!(value["matchedPolicyId"], policy.id.as_str());
    assert_eq!(value["action"], "read");
}

#[tokio::test]
async fn test_concurrent_authorization() {
    let h = Harness::new().await;
    let scope = env_scope();
    h.policy(&scope, "owner-read", &["read"], "resource.ownerId == subject.id", 0)
        .await;
    h.document(&scope, "d1", attrs(&[("ownerId", "u1".into())]));

    let mut handles = vec![];
    for i in 0..50 {
        let engine = Arc::clone(&h.engine);
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            let principal = if i % 2 == 0 { "u1" } else { "u2" };
            let decision = engine.authorize(&read(&scope, principal, "d1")).await.unwrap();
            (i, decision.is_allowed())
        }));
    }

    for handle in handles {
        let (i, allowed) = handle.await.unwrap();
        assert_eq!(allowed, i % 2 == 0);
    }

    let metrics = h.engine.get_metrics().await.unwrap();
    assert_eq!(metrics.total_requests, 50);
    assert_eq!(metrics.allowed_decisions, 25);
}
