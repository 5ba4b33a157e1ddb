//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use scopegate_authz::{
    AttrValue, Attributes, AuditContext, AuthorizeRequest, EngineConfig, InMemoryPolicyStore,
    Namespace, NewNamespace, NewPolicy, Policy, PolicyAdmin, PolicyEngine, Scope,
    StaticAttributeProvider,
};

/// Engine, admin service and in-memory collaborators wired together
pub struct Harness {
    pub store: Arc<InMemoryPolicyStore>,
    pub attributes: Arc<StaticAttributeProvider>,
    pub engine: Arc<PolicyEngine>,
    pub admin: PolicyAdmin,
    pub ctx: AuditContext,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryPolicyStore::new());
        let attributes = Arc::new(StaticAttributeProvider::new());
        let engine = PolicyEngine::new(config, store.clone(), attributes.clone())
            .await
            .unwrap();
        Self::assemble(store, attributes, engine)
    }

    pub fn assemble(
        store: Arc<InMemoryPolicyStore>,
        attributes: Arc<StaticAttributeProvider>,
        engine: PolicyEngine,
    ) -> Self {
        init_tracing();
        let admin = PolicyAdmin::for_engine(&engine);
        Self {
            store,
            attributes,
            engine: Arc::new(engine),
            admin,
            ctx: AuditContext::new("admin-1").with_ip("10.0.0.1"),
        }
    }

    pub async fn namespace(&self, scope: &Scope) -> Namespace {
        self.admin
            .create_namespace(NewNamespace::new(scope.clone()), &self.ctx)
            .await
            .unwrap()
    }

    /// Create a policy on `document`, creating the scope's namespace on first use
    pub async fn policy(
        &self,
        scope: &Scope,
        name: &str,
        actions: &[&str],
        expression: &str,
        priority: i32,
    ) -> Policy {
        let namespace = match self.admin.get_namespace_for_scope(scope).await.unwrap() {
            Some(ns) => ns,
            None => self.namespace(scope).await,
        };

        self.admin
            .create_policy(
                NewPolicy::new(
                    scope.clone(),
                    namespace.id,
                    name,
                    "document",
                    actions,
                    expression,
                )
                .with_priority(priority),
                &self.ctx,
            )
            .await
            .unwrap()
    }

    pub fn user(&self, scope: &Scope, id: &str, attributes: Attributes) {
        self.attributes.set_user(scope, id, attributes);
    }

    pub fn document(&self, scope: &Scope, id: &str, attributes: Attributes) {
        self.attributes.set_resource(scope, "document", id, attributes);
    }
}

/// Route engine logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn env_scope() -> Scope {
    Scope::environment("appX", "envX").unwrap()
}

pub fn org_scope(org: &str) -> Scope {
    Scope::organization("appX", "envX", org).unwrap()
}

/// Read request for a document in `scope`
pub fn read(scope: &Scope, principal: &str, document: &str) -> AuthorizeRequest {
    let request = AuthorizeRequest::new(
        scope.app_id(),
        scope.environment_id(),
        principal,
        "read",
        "document",
        document,
    );
    match scope.organization_id() {
        Some(org) => request.in_organization(org),
        None => request,
    }
}
