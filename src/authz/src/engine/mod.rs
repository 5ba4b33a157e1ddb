//! Policy evaluation engine
//!
//! Resolves the scope, loads the effective policy set for the resource type
//! (cache first, store on miss or cache failure), evaluates candidate
//! conditions in priority order and records the decision. Any request that
//! cannot produce a confident allow is denied.

pub mod decision;
pub mod metrics;

pub use decision::{AuthorizeError, AuthorizeRequest, Decision, Outcome, RequestContext};
pub use metrics::{EngineMetrics, MetricsCollector};

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::attributes::AttributeProvider;
use crate::audit::{AuditConfig, AuditEvent, AuditRecorder, DECISION_ACTION};
use crate::cache::{
    build_policy_set, clamp_ttl, CacheConfig, CacheKey, CacheStats, MemoryPolicyCache, PolicyCache,
    PolicySet, MAX_CACHE_TTL,
};
use crate::condition::{Attributes, ConditionCompiler, EvalContext, Root};
use crate::error::{AuthzError, Result};
use crate::policy::{CompiledPolicy, Policy, PolicyStore};
use crate::scope::{Scope, ScopeResolver};

/// Policy engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cache compiled policy sets
    pub enable_cache: bool,

    pub cache_config: CacheConfig,

    /// Budget for one store call
    pub store_timeout: Duration,

    /// Budget for one cache call
    pub cache_timeout: Duration,

    /// Budget for each attribute source
    pub attribute_timeout: Duration,

    pub audit: AuditConfig,

    pub enable_metrics: bool,

    /// Shared Redis cache; the in-process cache is used when unset
    pub redis_url: Option<String>,
    pub redis_key_prefix: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_config: CacheConfig::default(),
            store_timeout: Duration::from_millis(2000),
            cache_timeout: Duration::from_millis(250),
            attribute_timeout: Duration::from_millis(500),
            audit: AuditConfig::default(),
            enable_metrics: true,
            redis_url: None,
            redis_key_prefix: None,
        }
    }
}

impl EngineConfig {
    /// Read `AUTHZ_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let audit = AuditConfig {
            enabled: env_flag("AUTHZ_AUDIT_ENABLED", defaults.audit.enabled),
            buffer_size: env_parse("AUTHZ_AUDIT_BUFFER", defaults.audit.buffer_size),
            write_timeout: env_millis("AUTHZ_STORE_TIMEOUT_MS", defaults.audit.write_timeout),
        };

        Self {
            enable_cache: env_flag("AUTHZ_CACHE_ENABLED", defaults.enable_cache),
            cache_config: CacheConfig {
                capacity: env_parse("AUTHZ_CACHE_CAPACITY", defaults.cache_config.capacity),
                ttl: env_ttl("AUTHZ_CACHE_TTL_SECS", defaults.cache_config.ttl),
            },
            store_timeout: env_millis("AUTHZ_STORE_TIMEOUT_MS", defaults.store_timeout),
            cache_timeout: env_millis("AUTHZ_CACHE_TIMEOUT_MS", defaults.cache_timeout),
            attribute_timeout: env_millis("AUTHZ_ATTRIBUTE_TIMEOUT_MS", defaults.attribute_timeout),
            audit,
            enable_metrics: defaults.enable_metrics,
            redis_url: std::env::var("AUTHZ_REDIS_URL").ok().filter(|s| !s.is_empty()),
            redis_key_prefix: std::env::var("AUTHZ_REDIS_KEY_PREFIX")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "Unparseable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(variable = name, value = %raw, "Unparseable flag, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(name, default.as_millis() as u64))
}

fn env_ttl(name: &str, default: Duration) -> Duration {
    let requested = Duration::from_secs(env_parse(name, default.as_secs()));
    let ttl = clamp_ttl(requested);
    if ttl < requested {
        warn!(
            variable = name,
            requested_secs = requested.as_secs(),
            max_secs = MAX_CACHE_TTL.as_secs(),
            "Cache TTL above maximum, clamping"
        );
    }
    ttl
}

/// Build the cache backend the configuration asks for.
///
/// Returns `None` when caching is disabled.
pub async fn build_cache(config: &EngineConfig) -> Result<Option<Arc<dyn PolicyCache>>> {
    if !config.enable_cache {
        return Ok(None);
    }

    if let Some(remote) = remote_cache(config).await? {
        return Ok(Some(remote));
    }

    Ok(Some(Arc::new(MemoryPolicyCache::new(
        config.cache_config.clone(),
    ))))
}

#[cfg(feature = "redis")]
async fn remote_cache(config: &EngineConfig) -> Result<Option<Arc<dyn PolicyCache>>> {
    let Some(url) = &config.redis_url else {
        return Ok(None);
    };

    let mut redis_config = crate::cache::RedisCacheConfig {
        url: url.clone(),
        ..Default::default()
    };
    if let Some(prefix) = &config.redis_key_prefix {
        redis_config.key_prefix = prefix.clone();
    }
    let cache = crate::cache::RedisPolicyCache::new(redis_config).await?;
    Ok(Some(Arc::new(cache)))
}

#[cfg(not(feature = "redis"))]
async fn remote_cache(config: &EngineConfig) -> Result<Option<Arc<dyn PolicyCache>>> {
    if config.redis_url.is_some() {
        warn!("AUTHZ_REDIS_URL is set but the redis feature is disabled, using in-process cache");
    }
    Ok(None)
}

/// Main policy engine
///
/// # Architecture
///
/// ```text
/// Request → ScopeResolver → PolicyCache ─miss/error→ PolicyStore → Compile
///                               ↓                                     ↓
///                        candidates (action filter, priority order) ←─┘
///                               ↓
///                  AttributeProvider → conditions → Decision
///                                                      ↓
///                                          [AuditRecorder] [Metrics]
/// ```
///
/// Safe to share as `Arc<PolicyEngine>` across any number of callers.
pub struct PolicyEngine {
    scope_resolver: ScopeResolver,
    store: Arc<dyn PolicyStore>,
    cache: Option<Arc<dyn PolicyCache>>,
    attributes: Arc<dyn AttributeProvider>,
    compiler: Arc<ConditionCompiler>,
    recorder: Arc<AuditRecorder>,
    metrics: Option<Arc<MetricsCollector>>,
    config: EngineConfig,
}

impl PolicyEngine {
    /// Create an engine, connecting the configured cache backend and
    /// starting the audit writer on the current runtime.
    pub async fn new(
        config: EngineConfig,
        store: Arc<dyn PolicyStore>,
        attributes: Arc<dyn AttributeProvider>,
    ) -> Result<Self> {
        let cache = build_cache(&config).await?;
        let recorder = Arc::new(AuditRecorder::spawn(Arc::clone(&store), config.audit.clone()));
        let metrics = config
            .enable_metrics
            .then(|| Arc::new(MetricsCollector::new()));

        info!(
            cache = cache.as_ref().map(|c| c.name()).unwrap_or("disabled"),
            audit = recorder.is_enabled(),
            metrics = config.enable_metrics,
            "PolicyEngine initialized"
        );

        Ok(Self {
            scope_resolver: ScopeResolver::new(),
            store,
            cache,
            attributes,
            compiler: Arc::new(ConditionCompiler::new()),
            recorder,
            metrics,
            config,
        })
    }

    /// Replace the cache backend (`None` disables caching)
    pub fn with_cache(mut self, cache: Option<Arc<dyn PolicyCache>>) -> Self {
        self.cache = cache;
        self
    }

    /// Share a recorder with other components, such as [`crate::PolicyAdmin`]
    pub fn with_recorder(mut self, recorder: Arc<AuditRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<ConditionCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<dyn PolicyCache>> {
        self.cache.as_ref()
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    pub fn compiler(&self) -> &Arc<ConditionCompiler> {
        &self.compiler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Authorize a request
    ///
    /// # Pipeline
    ///
    /// 1. Resolve the scope (`ScopeRequired` when incomplete)
    /// 2. Load the effective policy set for the resource type
    /// 3. Keep enabled candidates whose actions cover the request
    /// 4. Fetch subject, resource and request attributes concurrently
    /// 5. Evaluate candidates in priority order; the first true condition allows
    /// 6. Otherwise deny
    /// 7. Record the decision (non-blocking) and metrics
    ///
    /// An error always carries a deny decision.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
    ) -> std::result::Result<Decision, AuthorizeError> {
        let start = Instant::now();

        let scope = match self.scope_resolver.resolve(
            &request.app_id,
            &request.environment_id,
            request.organization_id.as_deref(),
        ) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(error = %e, "Rejected authorization request without a complete scope");
                let err = AuthorizeError::new(e);
                self.finish_metrics(&err.decision, start).await;
                return Err(err);
            }
        };

        debug!(
            scope = %scope,
            principal_id = %request.principal_id,
            action = %request.action,
            resource_type = %request.resource_type,
            resource_id = %request.resource_id,
            "Authorization request"
        );

        let policy_set = match self.load_policy_set(&scope, &request.resource_type).await {
            Ok(set) => set,
            Err(e) => {
                error!(
                    app_id = %scope.app_id(),
                    environment_id = %scope.environment_id(),
                    organization_id = ?scope.organization_id(),
                    resource_type = %request.resource_type,
                    error = %e,
                    "Could not load policies, denying"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_store_error();
                }
                let err = AuthorizeError::new(e);
                self.finalize(&scope, request, &err.decision, start).await;
                return Err(err);
            }
        };

        let candidates: Vec<&CompiledPolicy> = policy_set
            .iter()
            .filter(|p| p.enabled && p.matches_action(&request.action))
            .collect();

        let decision = if candidates.is_empty() {
            debug!("No candidate policies for resource type and action");
            Decision::deny(format!(
                "no enabled policy grants '{}' on '{}'",
                request.action, request.resource_type
            ))
        } else {
            let context = self.build_context(&scope, request).await;
            self.evaluate_candidates(&candidates, &context)
        };

        self.finalize(&scope, request, &decision, start).await;
        Ok(decision)
    }

    /// Effective policy set for a resource type, in evaluation order
    ///
    /// Cache errors and timeouts fall back to the store; store errors and
    /// timeouts are returned. A miss is filled only if no invalidation of the
    /// app ran between the cache read and the fill.
    pub async fn load_policy_set(&self, scope: &Scope, resource_type: &str) -> Result<PolicySet> {
        let key = CacheKey::new(scope, resource_type);
        let mut fill_generation = None;

        if let Some(cache) = &self.cache {
            match tokio::time::timeout(self.config.cache_timeout, cache.get(&key)).await {
                Ok(Ok(Some(set))) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_hit();
                    }
                    return Ok(set);
                }
                Ok(Ok(None)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_miss();
                    }
                    let generation = cache.generation(&key.app_id);
                    match tokio::time::timeout(self.config.cache_timeout, generation).await {
                        Ok(Ok(generation)) => fill_generation = Some(generation),
                        Ok(Err(e)) => {
                            warn!(key = %key, error = %e, "Cache generation read failed, not filling")
                        }
                        Err(_) => warn!(key = %key, "Cache generation read timed out, not filling"),
                    }
                }
                Ok(Err(e)) => {
                    warn!(cache = cache.name(), key = %key, error = %e, "Cache read failed, using store");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_fallback();
                    }
                }
                Err(_) => {
                    warn!(cache = cache.name(), key = %key, "Cache read timed out, using store");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_fallback();
                    }
                }
            }
        }

        let policies = tokio::time::timeout(
            self.config.store_timeout,
            self.store.get_policies_by_resource_type(scope, resource_type),
        )
        .await
        .map_err(|_| {
            AuthzError::Timeout(format!(
                "loading '{}' policies for {} after {:?}",
                resource_type, scope, self.config.store_timeout
            ))
        })??;

        let set = self.compile_set(&policies);

        if let (Some(cache), Some(generation)) = (&self.cache, fill_generation) {
            let write = cache.set_if_generation(
                &key,
                Arc::clone(&set),
                self.config.cache_config.ttl,
                generation,
            );
            match tokio::time::timeout(self.config.cache_timeout, write).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    debug!(key = %key, generation, "Policies changed during load, cache not filled")
                }
                Ok(Err(e)) => warn!(key = %key, error = %e, "Cache fill failed"),
                Err(_) => warn!(key = %key, "Cache fill timed out"),
            }
        }

        Ok(set)
    }

    /// Compile store policies into an ordered set
    pub fn compile_set(&self, policies: &[Policy]) -> PolicySet {
        let (set, skipped) = build_policy_set(policies, &self.compiler);
        if let Some(metrics) = self.metrics.as_ref().filter(|_| skipped > 0) {
            metrics.record_skipped_candidates(skipped as u64);
        }
        set
    }

    async fn build_context(&self, scope: &Scope, request: &AuthorizeRequest) -> EvalContext {
        let budget = self.config.attribute_timeout;
        let (subject, resource, req) = tokio::join!(
            tokio::time::timeout(
                budget,
                self.attributes
                    .get_user_attributes(scope, &request.principal_id)
            ),
            tokio::time::timeout(
                budget,
                self.attributes.get_resource_attributes(
                    scope,
                    &request.resource_type,
                    &request.resource_id
                )
            ),
            tokio::time::timeout(budget, self.attributes.get_request_attributes(&request.context)),
        );

        let mut context = EvalContext::new()
            .with_subject(attribute_bag("subject", subject))
            .with_resource(attribute_bag("resource", resource))
            .with_request(attribute_bag("request", req));

        context.set_default(Root::Subject, "id", request.principal_id.as_str());
        context.set_default(Root::Resource, "id", request.resource_id.as_str());
        context.set_default(Root::Resource, "type", request.resource_type.as_str());
        context.set_default(Root::Request, "action", request.action.as_str());
        context
    }

    fn evaluate_candidates(&self, candidates: &[&CompiledPolicy], context: &EvalContext) -> Decision {
        for candidate in candidates {
            match candidate.program.evaluate(context) {
                Ok(true) => {
                    debug!(policy_id = %candidate.policy_id, priority = candidate.priority, "Policy matched");
                    return Decision::allow(
                        candidate.policy_id.clone(),
                        format!("policy '{}' matched", candidate.name),
                    );
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        policy_id = %candidate.policy_id,
                        error = %e,
                        "Policy evaluation failed, skipping candidate"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_skipped_candidate();
                    }
                }
            }
        }

        Decision::deny("no policy condition matched")
    }

    async fn finalize(
        &self,
        scope: &Scope,
        request: &AuthorizeRequest,
        decision: &Decision,
        start: Instant,
    ) {
        let event = AuditEvent::new(
            scope.clone(),
            request.principal_id.clone(),
            DECISION_ACTION,
            request.resource_type.clone(),
            request.resource_id.clone(),
        )
        .with_new_value(decision.audit_value(&request.action))
        .with_origin(
            request.context.ip_address.clone(),
            request.context.user_agent.clone(),
        );
        self.recorder.record(event);

        self.finish_metrics(decision, start).await;
    }

    async fn finish_metrics(&self, decision: &Decision, start: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(decision.is_allowed());
            metrics.record_latency(start.elapsed());
        }
    }

    /// Drop every cached policy set
    pub async fn invalidate_cache(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear().await?;
            info!("Policy cache cleared");
        }
        Ok(())
    }

    pub async fn get_metrics(&self) -> Option<EngineMetrics> {
        match &self.metrics {
            Some(metrics) => Some(metrics.get_metrics()),
            None => None,
        }
    }

    pub async fn export_prometheus(&self) -> Option<String> {
        match &self.metrics {
            Some(metrics) => Some(metrics.export_prometheus()),
            None => None,
        }
    }

    pub async fn get_cache_stats(&self) -> Option<Result<CacheStats>> {
        match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }
}

fn attribute_bag(
    source: &str,
    fetched: std::result::Result<Result<Attributes>, tokio::time::error::Elapsed>,
) -> Attributes {
    match fetched {
        Ok(Ok(attributes)) => attributes,
        Ok(Err(e)) => {
            warn!(source, error = %e, "Attribute source failed, treating as undefined");
            Attributes::new()
        }
        Err(_) => {
            warn!(source, "Attribute source timed out, treating as undefined");
            Attributes::new()
        }
    }
}
