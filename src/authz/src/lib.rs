//! # Scopegate Authorization Engine
//!
//! Attribute-based access control scoped by app, environment and optional
//! organization.
//!
//! ## Features
//!
//! - **Scoped policies**: organization policies union with the environment-global set
//! - **Condition language** over `subject`, `resource` and `request` attributes
//! - **Fail-closed decisions**: any error carries a deny
//! - **Policy set caching** in process or in Redis, invalidated on write
//! - **Non-blocking audit trail** of decisions and administrative changes
//! - **Async-first design** using the Tokio runtime
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scopegate_authz::{
//!     AuditContext, AuthorizeRequest, EngineConfig, InMemoryPolicyStore, NewNamespace,
//!     NewPolicy, PolicyAdmin, PolicyEngine, Scope, StaticAttributeProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryPolicyStore::new());
//!     let attributes = Arc::new(StaticAttributeProvider::new());
//!     let engine = PolicyEngine::new(EngineConfig::default(), store, attributes).await?;
//!     let admin = PolicyAdmin::for_engine(&engine);
//!
//!     let ctx = AuditContext::new("admin");
//!     let scope = Scope::environment("app", "prod")?;
//!     let ns = admin.create_namespace(NewNamespace::new(scope.clone()), &ctx).await?;
//!     admin
//!         .create_policy(
//!             NewPolicy::new(scope, ns.id, "owner-read", "document", &["read"],
//!                 "resource.ownerId == subject.id"),
//!             &ctx,
//!         )
//!         .await?;
//!
//!     let request = AuthorizeRequest::new("app", "prod", "u1", "read", "document", "d1");
//!     let decision = engine.authorize(&request).await?;
//!
//!     if decision.is_allowed() {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod attributes;
pub mod audit;
pub mod cache;
pub mod condition;
pub mod engine;
pub mod error;
pub mod namespace;
pub mod policy;
pub mod scope;
pub mod types;

// Re-export commonly used types
pub use admin::{AdminConfig, PolicyAdmin};
pub use attributes::{AttributeProvider, StaticAttributeProvider};
pub use audit::{AuditConfig, AuditContext, AuditEvent, AuditFilter, AuditRecorder, AuditStats};
pub use cache::{CacheConfig, CacheKey, CacheStats, MemoryPolicyCache, PolicyCache, PolicySet};
pub use condition::{AttrValue, Attributes, ConditionCompiler, EvalContext, Program};
pub use engine::{
    AuthorizeError, AuthorizeRequest, Decision, EngineConfig, EngineMetrics, Outcome,
    PolicyEngine, RequestContext,
};
pub use error::{AuthzError, Result};
pub use namespace::{
    ActionDefinition, AttributeType, Namespace, NewActionDefinition, NewNamespace,
    NewResourceDefinition, ResourceAttribute, ResourceDefinition,
};
pub use policy::{
    CompiledPolicy, InMemoryPolicyStore, NewPolicy, Policy, PolicyFilter, PolicyStore,
    PolicyUpdate,
};
pub use scope::{Scope, ScopeResolver};
pub use types::{Page, Pagination};

#[cfg(feature = "postgres")]
pub use policy::PostgresPolicyStore;

#[cfg(feature = "redis")]
pub use cache::{RedisCacheConfig, RedisPolicyCache};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
