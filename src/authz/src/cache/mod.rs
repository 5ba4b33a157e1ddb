//! Compiled policy cache
//!
//! One entry holds the complete effective policy set for a
//! `(scope, resource type)` pair: the organization's policies unioned with the
//! environment-global ones. Writers invalidate after their store transaction
//! commits; TTL expiry only bounds how long a missed invalidation can linger.
//!
//! Every invalidation also advances the app's fill generation. A reader takes
//! the generation before it queries the store and fills with
//! [`PolicyCache::set_if_generation`], so a set read before a concurrent
//! change is never written back after that change invalidated the cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tracing::warn;

use crate::condition::ConditionCompiler;
use crate::error::Result;
use crate::policy::{CompiledPolicy, Policy};
use crate::scope::Scope;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryPolicyCache;

#[cfg(feature = "redis")]
pub use self::redis::{RedisCacheConfig, RedisPolicyCache};

/// Effective policy set for one cache key, in evaluation order
pub type PolicySet = Arc<Vec<CompiledPolicy>>;

/// Compile enabled store policies into an ordered set.
///
/// Expressions are validated on write, so a compile failure here means the
/// row changed behind the store; that policy is left out. Returns the set
/// and the number of policies left out.
pub fn build_policy_set(policies: &[Policy], compiler: &ConditionCompiler) -> (PolicySet, usize) {
    let mut skipped = 0;
    let mut compiled: Vec<CompiledPolicy> = Vec::with_capacity(policies.len());

    for policy in policies.iter().filter(|p| p.enabled) {
        match CompiledPolicy::compile(policy, compiler) {
            Ok(c) => compiled.push(c),
            Err(e) => {
                warn!(policy_id = %policy.id, error = %e, "Skipping policy with invalid expression");
                skipped += 1;
            }
        }
    }

    compiled.sort_by(|a, b| a.evaluation_order(b));
    (Arc::new(compiled), skipped)
}

/// Rendered in place of an organization for environment-global entries
const GLOBAL_PARTITION: &str = "~";

/// Cache key: scope plus resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub app_id: String,
    pub environment_id: String,
    pub organization_id: Option<String>,
    pub resource_type: String,
}

impl CacheKey {
    pub fn new(scope: &Scope, resource_type: impl Into<String>) -> Self {
        Self {
            app_id: scope.app_id().to_string(),
            environment_id: scope.environment_id().to_string(),
            organization_id: scope.organization_id().map(str::to_string),
            resource_type: resource_type.into(),
        }
    }

    /// `{prefix}{app}:{env}:{org or ~}:{resourceType}` with escaped components
    pub fn render(&self, prefix: &str) -> String {
        format!(
            "{}{}:{}:{}:{}",
            prefix,
            escape_component(&self.app_id),
            escape_component(&self.environment_id),
            self.organization_id
                .as_deref()
                .map(escape_component)
                .unwrap_or_else(|| GLOBAL_PARTITION.to_string()),
            escape_component(&self.resource_type),
        )
    }

    /// Glob matching every key of an app
    pub fn app_pattern(prefix: &str, app_id: &str) -> String {
        format!("{}{}:*", prefix, escape_component(app_id))
    }

    /// Glob matching every key of an environment, all organizations included
    pub fn environment_pattern(prefix: &str, app_id: &str, environment_id: &str) -> String {
        format!(
            "{}{}:{}:*",
            prefix,
            escape_component(app_id),
            escape_component(environment_id)
        )
    }

    /// Glob matching every key of an organization across an app's environments
    pub fn organization_pattern(prefix: &str, app_id: &str, organization_id: &str) -> String {
        format!(
            "{}{}:*:{}:*",
            prefix,
            escape_component(app_id),
            escape_component(organization_id)
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(""))
    }
}

/// Percent-escape separators, glob metacharacters and the escape itself
pub fn escape_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | ':' | '*' | '?' | '[' | ']' | '\\' | '~' => {
                out.push_str(&format!("%{:02X}", c as u32));
            }
            _ => out.push(c),
        }
    }
    out
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by capacity pressure or expiry
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
    /// Time of the last write or invalidation
    pub last_updated: Option<DateTime<Utc>>,
}

impl CacheStats {
    pub fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Longest lifetime any backend gives an entry
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Bound an entry lifetime to [`MAX_CACHE_TTL`]
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_CACHE_TTL)
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held in process
    pub capacity: usize,

    /// Safety-net lifetime of an entry
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Compiled policy cache contract
///
/// Backends are interchangeable and share invalidation semantics. Writes are
/// atomic per key; nothing is serialized globally.
#[async_trait]
pub trait PolicyCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<PolicySet>>;

    async fn set(&self, key: &CacheKey, policies: PolicySet, ttl: Duration) -> Result<()>;

    /// Current fill generation of an app. Advanced by every delete, partition
    /// invalidation and clear touching the app.
    async fn generation(&self, app_id: &str) -> Result<u64>;

    /// Write the entry only while the app is still at `generation`.
    ///
    /// Returns `false`, leaving the cache untouched, when an invalidation ran
    /// since the generation was read.
    async fn set_if_generation(
        &self,
        key: &CacheKey,
        policies: PolicySet,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool>;

    async fn delete(&self, key: &CacheKey) -> Result<()>;

    /// Drop every entry of an app. Returns the number of entries removed.
    async fn delete_by_app(&self, app_id: &str) -> Result<u64>;

    /// Drop every entry of an environment, organization entries included,
    /// since they all union the environment-global set
    async fn delete_by_environment(&self, app_id: &str, environment_id: &str) -> Result<u64>;

    /// Drop every entry of an organization in any environment of the app
    async fn delete_by_organization(&self, app_id: &str, organization_id: &str) -> Result<u64>;

    async fn get_multi(&self, keys: &[CacheKey]) -> Result<Vec<Option<PolicySet>>>;

    async fn set_multi(&self, entries: Vec<(CacheKey, PolicySet)>, ttl: Duration) -> Result<()>;

    async fn stats(&self) -> Result<CacheStats>;

    async fn clear(&self) -> Result<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
