//! In-memory policy store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{sort_policies, NewPolicy, Policy, PolicyFilter, PolicyStore, PolicyUpdate};
use crate::audit::{AuditEvent, AuditFilter};
use crate::error::{AuthzError, Result};
use crate::namespace::{
    ActionDefinition, ActionDefinitionUpdate, Namespace, NamespaceUpdate, NewActionDefinition,
    NewNamespace, NewResourceDefinition, ResourceDefinition, ResourceDefinitionUpdate,
};
use crate::scope::{Scope, ScopeResolver};
use crate::types::{Page, Pagination, PolicyId};

#[derive(Default)]
struct State {
    policies: HashMap<PolicyId, Policy>,
    namespaces: HashMap<String, Namespace>,
    resource_definitions: HashMap<String, ResourceDefinition>,
    action_definitions: HashMap<String, ActionDefinition>,
    audit_events: Vec<AuditEvent>,
}

/// In-memory store for single-instance deployments and tests
///
/// All records live behind one `RwLock`, so every mutation is atomic with
/// respect to readers.
pub struct InMemoryPolicyStore {
    state: Arc<RwLock<State>>,
    resolver: ScopeResolver,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    read_lag_ms: AtomicU64,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            resolver: ScopeResolver::new(),
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            read_lag_ms: AtomicU64::new(0),
        }
    }

    /// Make every call fail with `RepositoryUnavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call, for exercising caller timeouts
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay effective-set reads after their snapshot is taken, so the
    /// returned policies can be older than a write that finished meanwhile
    pub fn set_read_lag(&self, lag: Duration) {
        self.read_lag_ms
            .store(lag.as_millis() as u64, Ordering::SeqCst);
    }

    async fn lag_read(&self) {
        let lag = self.read_lag_ms.load(Ordering::SeqCst);
        if lag > 0 {
            tokio::time::sleep(Duration::from_millis(lag)).await;
        }
    }

    /// Number of stored policies across all scopes
    pub async fn policy_count(&self) -> usize {
        self.state.read().await.policies.len()
    }

    async fn check_available(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthzError::RepositoryUnavailable(
                "in-memory store is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn effective_policies<'a>(
        &self,
        state: &'a State,
        scope: &Scope,
    ) -> impl Iterator<Item = &'a Policy> + 'a {
        let query = self.resolver.effective_resource_type_query(scope);
        state
            .policies
            .values()
            .filter(move |p| p.enabled && query.admits(&p.scope))
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &str, id: &str) -> AuthzError {
    AuthzError::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn create_policy(&self, new_policy: NewPolicy) -> Result<Policy> {
        self.check_available().await?;
        let policy = new_policy.into_policy();
        policy.validate()?;

        let mut state = self.state.write().await;
        let namespace = state
            .namespaces
            .get(&policy.namespace_id)
            .ok_or_else(|| not_found("namespace", &policy.namespace_id))?;
        if namespace.scope != policy.scope {
            return Err(AuthzError::InvalidInput(format!(
                "namespace {} belongs to scope {}, not {}",
                namespace.id, namespace.scope, policy.scope
            )));
        }

        state.policies.insert(policy.id.clone(), policy.clone());
        debug!(policy_id = %policy.id, scope = %policy.scope, "Stored policy");
        Ok(policy)
    }

    async fn get_policy(&self, id: &str) -> Result<Policy> {
        self.check_available().await?;
        let state = self.state.read().await;
        state
            .policies
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("policy", id))
    }

    async fn update_policy(&self, id: &str, update: PolicyUpdate) -> Result<Policy> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        let current = state
            .policies
            .get(id)
            .ok_or_else(|| not_found("policy", id))?;

        let updated = update.apply(current)?;
        state.policies.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete_policy(&self, id: &str) -> Result<Policy> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        state
            .policies
            .remove(id)
            .ok_or_else(|| not_found("policy", id))
    }

    async fn list_policies(&self, scope: &Scope, filter: &PolicyFilter) -> Result<Page<Policy>> {
        self.check_available().await?;
        let state = self.state.read().await;
        let mut policies: Vec<Policy> = state
            .policies
            .values()
            .filter(|p| self.resolver.exact_partition(scope, &p.scope) && filter.matches(p))
            .cloned()
            .collect();
        sort_policies(&mut policies);
        Ok(filter.pagination.apply(policies))
    }

    async fn get_policies_by_resource_type(
        &self,
        scope: &Scope,
        resource_type: &str,
    ) -> Result<Vec<Policy>> {
        self.check_available().await?;
        let state = self.state.read().await;
        let mut policies: Vec<Policy> = self
            .effective_policies(&state, scope)
            .filter(|p| p.resource_type == resource_type)
            .cloned()
            .collect();
        drop(state);
        sort_policies(&mut policies);
        self.lag_read().await;
        Ok(policies)
    }

    async fn get_active_policies(&self, scope: &Scope) -> Result<Vec<Policy>> {
        self.check_available().await?;
        let state = self.state.read().await;
        let mut policies: Vec<Policy> = self.effective_policies(&state, scope).cloned().collect();
        drop(state);
        sort_policies(&mut policies);
        self.lag_read().await;
        Ok(policies)
    }

    async fn create_namespace(&self, new_namespace: NewNamespace) -> Result<Namespace> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        if state
            .namespaces
            .values()
            .any(|ns| ns.scope == new_namespace.scope)
        {
            return Err(AuthzError::Conflict(format!(
                "a namespace already exists for scope {}",
                new_namespace.scope
            )));
        }

        let namespace = new_namespace.into_namespace();
        state
            .namespaces
            .insert(namespace.id.clone(), namespace.clone());
        Ok(namespace)
    }

    async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        self.check_available().await?;
        let state = self.state.read().await;
        state
            .namespaces
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("namespace", id))
    }

    async fn get_namespace_by_scope(&self, scope: &Scope) -> Result<Option<Namespace>> {
        self.check_available().await?;
        let state = self.state.read().await;
        Ok(state
            .namespaces
            .values()
            .find(|ns| &ns.scope == scope)
            .cloned())
    }

    async fn update_namespace(&self, id: &str, update: NamespaceUpdate) -> Result<Namespace> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        let namespace = state
            .namespaces
            .get_mut(id)
            .ok_or_else(|| not_found("namespace", id))?;
        update.apply_to(namespace);
        Ok(namespace.clone())
    }

    async fn delete_namespace(&self, id: &str) -> Result<Namespace> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        if !state.namespaces.contains_key(id) {
            return Err(not_found("namespace", id));
        }

        let referencing = state
            .policies
            .values()
            .filter(|p| p.namespace_id == id)
            .count();
        if referencing > 0 {
            return Err(AuthzError::Conflict(format!(
                "namespace {} is still referenced by {} policies",
                id, referencing
            )));
        }

        state.resource_definitions.retain(|_, d| d.namespace_id != id);
        state.action_definitions.retain(|_, d| d.namespace_id != id);
        state
            .namespaces
            .remove(id)
            .ok_or_else(|| not_found("namespace", id))
    }

    async fn list_namespaces(
        &self,
        app_id: &str,
        environment_id: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<Namespace>> {
        self.check_available().await?;
        let state = self.state.read().await;
        let mut namespaces: Vec<Namespace> = state
            .namespaces
            .values()
            .filter(|ns| {
                ns.scope.app_id() == app_id
                    && environment_id.map_or(true, |env| ns.scope.environment_id() == env)
            })
            .cloned()
            .collect();
        namespaces.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pagination.apply(namespaces))
    }

    async fn create_resource_definition(
        &self,
        new_definition: NewResourceDefinition,
    ) -> Result<ResourceDefinition> {
        self.check_available().await?;
        let definition = new_definition.into_definition();
        definition.validate()?;

        let mut state = self.state.write().await;
        if !state.namespaces.contains_key(&definition.namespace_id) {
            return Err(not_found("namespace", &definition.namespace_id));
        }
        if state.resource_definitions.values().any(|d| {
            d.namespace_id == definition.namespace_id && d.resource_type == definition.resource_type
        }) {
            return Err(AuthzError::Conflict(format!(
                "resource type '{}' is already defined in namespace {}",
                definition.resource_type, definition.namespace_id
            )));
        }

        state
            .resource_definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_resource_definition(&self, id: &str) -> Result<ResourceDefinition> {
        self.check_available().await?;
        let state = self.state.read().await;
        state
            .resource_definitions
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("resource definition", id))
    }

    async fn update_resource_definition(
        &self,
        id: &str,
        update: ResourceDefinitionUpdate,
    ) -> Result<ResourceDefinition> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        let current = state
            .resource_definitions
            .get(id)
            .ok_or_else(|| not_found("resource definition", id))?;

        let mut updated = current.clone();
        update.apply_to(&mut updated);
        updated.validate()?;
        state
            .resource_definitions
            .insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete_resource_definition(&self, id: &str) -> Result<ResourceDefinition> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        state
            .resource_definitions
            .remove(id)
            .ok_or_else(|| not_found("resource definition", id))
    }

    async fn list_resource_definitions(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<ResourceDefinition>> {
        self.check_available().await?;
        let state = self.state.read().await;
        let mut definitions: Vec<ResourceDefinition> = state
            .resource_definitions
            .values()
            .filter(|d| d.namespace_id == namespace_id)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.resource_type.cmp(&b.resource_type));
        Ok(pagination.apply(definitions))
    }

    async fn create_action_definition(
        &self,
        new_definition: NewActionDefinition,
    ) -> Result<ActionDefinition> {
        self.check_available().await?;
        let definition = new_definition.into_definition();
        definition.validate()?;

        let mut state = self.state.write().await;
        if !state.namespaces.contains_key(&definition.namespace_id) {
            return Err(not_found("namespace", &definition.namespace_id));
        }
        if state
            .action_definitions
            .values()
            .any(|d| d.namespace_id == definition.namespace_id && d.name == definition.name)
        {
            return Err(AuthzError::Conflict(format!(
                "action '{}' is already defined in namespace {}",
                definition.name, definition.namespace_id
            )));
        }

        state
            .action_definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_action_definition(&self, id: &str) -> Result<ActionDefinition> {
        self.check_available().await?;
        let state = self.state.read().await;
        state
            .action_definitions
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("action definition", id))
    }

    async fn update_action_definition(
        &self,
        id: &str,
        update: ActionDefinitionUpdate,
    ) -> Result<ActionDefinition> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        let definition = state
            .action_definitions
            .get_mut(id)
            .ok_or_else(|| not_found("action definition", id))?;
        update.apply_to(definition);
        Ok(definition.clone())
    }

    async fn delete_action_definition(&self, id: &str) -> Result<ActionDefinition> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        state
            .action_definitions
            .remove(id)
            .ok_or_else(|| not_found("action definition", id))
    }

    async fn list_action_definitions(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<ActionDefinition>> {
        self.check_available().await?;
        let state = self.state.read().await;
        let mut definitions: Vec<ActionDefinition> = state
            .action_definitions
            .values()
            .filter(|d| d.namespace_id == namespace_id)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pagination.apply(definitions))
    }

    async fn create_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.check_available().await?;
        self.state.write().await.audit_events.push(event);
        Ok(())
    }

    async fn list_audit_events(
        &self,
        scope: &Scope,
        filter: &AuditFilter,
    ) -> Result<Page<AuditEvent>> {
        self.check_available().await?;
        let state = self.state.read().await;
        // Appended in time order, so reversing yields newest first
        let events: Vec<AuditEvent> = state
            .audit_events
            .iter()
            .rev()
            .filter(|e| &e.scope == scope && filter.matches(e))
            .cloned()
            .collect();
        Ok(filter.pagination.apply(events))
    }
}
