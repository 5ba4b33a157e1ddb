//! Administrative write path
//!
//! Every mutation is validated before it reaches the store, persisted, and
//! only then followed by cache invalidation of the affected partition and a
//! mutation audit event carrying old and new snapshots.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::audit::{AuditContext, AuditEvent, AuditFilter, AuditRecorder};
use crate::cache::{build_policy_set, CacheKey, PolicyCache};
use crate::condition::ConditionCompiler;
use crate::engine::PolicyEngine;
use crate::error::{AuthzError, Result};
use crate::namespace::{
    ActionDefinition, ActionDefinitionUpdate, Namespace, NamespaceUpdate, NewActionDefinition,
    NewNamespace, NewResourceDefinition, ResourceDefinition, ResourceDefinitionUpdate,
};
use crate::policy::{NewPolicy, Policy, PolicyFilter, PolicyStore, PolicyUpdate};
use crate::scope::Scope;
use crate::types::{Page, Pagination, MAX_PAGE_LIMIT};

const POLICY: &str = "policy";
const NAMESPACE: &str = "namespace";
const RESOURCE_DEFINITION: &str = "resource_definition";
const ACTION_DEFINITION: &str = "action_definition";

/// Timeouts and TTL used by the admin service
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub store_timeout: Duration,
    pub cache_timeout: Duration,
    /// TTL of entries written by `warm_cache`
    pub cache_ttl: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2000),
            cache_timeout: Duration::from_millis(250),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Policy administration service
pub struct PolicyAdmin {
    store: Arc<dyn PolicyStore>,
    cache: Option<Arc<dyn PolicyCache>>,
    recorder: Arc<AuditRecorder>,
    compiler: Arc<ConditionCompiler>,
    config: AdminConfig,
}

impl PolicyAdmin {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        cache: Option<Arc<dyn PolicyCache>>,
        recorder: Arc<AuditRecorder>,
        config: AdminConfig,
    ) -> Self {
        Self {
            store,
            cache,
            recorder,
            compiler: Arc::new(ConditionCompiler::new()),
            config,
        }
    }

    /// Share the store, cache, recorder and compiler of an engine, so
    /// invalidations reach the cache the engine reads from.
    pub fn for_engine(engine: &PolicyEngine) -> Self {
        let engine_config = engine.config();
        Self {
            store: Arc::clone(engine.store()),
            cache: engine.cache().cloned(),
            recorder: Arc::clone(engine.recorder()),
            compiler: Arc::clone(engine.compiler()),
            config: AdminConfig {
                store_timeout: engine_config.store_timeout,
                cache_timeout: engine_config.cache_timeout,
                cache_ttl: engine_config.cache_config.ttl,
            },
        }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.store_timeout, call)
            .await
            .map_err(|_| {
                AuthzError::Timeout(format!(
                    "{} after {:?}",
                    operation, self.config.store_timeout
                ))
            })?
    }

    /// Invalidate every cache entry whose effective set includes `scope`.
    ///
    /// Runs after the store call returned. The cache also advances the app's
    /// fill generation, so loads that read the store before the commit do not
    /// write their sets back. Failures are logged; the TTL bounds how long a
    /// stale entry can survive.
    async fn invalidate(&self, scope: &Scope) {
        let Some(cache) = &self.cache else {
            return;
        };

        let call = async {
            match scope.organization_id() {
                Some(org) => cache.delete_by_organization(scope.app_id(), org).await,
                None => {
                    cache
                        .delete_by_environment(scope.app_id(), scope.environment_id())
                        .await
                }
            }
        };

        match tokio::time::timeout(self.config.cache_timeout, call).await {
            Ok(Ok(removed)) => {
                info!(scope = %scope, removed, "Invalidated cached policy sets");
            }
            Ok(Err(e)) => {
                error!(scope = %scope, error = %e, "Cache invalidation failed after commit");
            }
            Err(_) => {
                error!(scope = %scope, "Cache invalidation timed out after commit");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        scope: &Scope,
        ctx: &AuditContext,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        old: Option<JsonValue>,
        new: Option<JsonValue>,
    ) {
        let mut event = AuditEvent::new(
            scope.clone(),
            ctx.actor_id.clone(),
            action,
            resource_type,
            resource_id,
        )
        .with_origin(ctx.ip_address.clone(), ctx.user_agent.clone());
        if let Some(old) = old {
            event = event.with_old_value(old);
        }
        if let Some(new) = new {
            event = event.with_new_value(new);
        }
        self.recorder.record(event);
    }

    fn compile_check(&self, name: &str, expression: &str) -> Result<()> {
        self.compiler
            .compile(expression)
            .map(|_| ())
            .map_err(|e| AuthzError::InvalidExpression(format!("policy '{}': {}", name, e)))
    }

    // Policies

    pub async fn create_policy(&self, mut new_policy: NewPolicy, ctx: &AuditContext) -> Result<Policy> {
        if new_policy.created_by.is_empty() {
            new_policy.created_by = ctx.actor_id.clone();
        }

        let draft = new_policy.clone().into_policy();
        draft.validate()?;
        self.compile_check(&draft.name, &draft.expression)?;

        let namespace = self
            .bounded("get_namespace", self.store.get_namespace(&draft.namespace_id))
            .await?;
        if namespace.scope != draft.scope {
            return Err(AuthzError::InvalidInput(format!(
                "namespace {} belongs to scope {}, not {}",
                namespace.id, namespace.scope, draft.scope
            )));
        }

        let policy = self
            .bounded("create_policy", self.store.create_policy(new_policy))
            .await?;

        self.invalidate(&policy.scope).await;
        self.audit(
            &policy.scope,
            ctx,
            "policy.create",
            POLICY,
            &policy.id,
            None,
            snapshot(&policy),
        );
        info!(policy_id = %policy.id, scope = %policy.scope, "Policy created");
        Ok(policy)
    }

    pub async fn get_policy(&self, id: &str) -> Result<Policy> {
        self.bounded("get_policy", self.store.get_policy(id)).await
    }

    pub async fn update_policy(
        &self,
        id: &str,
        update: PolicyUpdate,
        ctx: &AuditContext,
    ) -> Result<Policy> {
        let current = self.get_policy(id).await?;

        let preview = update.apply(&current)?;
        self.compile_check(&preview.name, &preview.expression)?;

        let updated = self
            .bounded("update_policy", self.store.update_policy(id, update))
            .await?;

        self.invalidate(&updated.scope).await;
        self.audit(
            &updated.scope,
            ctx,
            "policy.update",
            POLICY,
            &updated.id,
            snapshot(&current),
            snapshot(&updated),
        );
        info!(policy_id = %updated.id, version = updated.version, "Policy updated");
        Ok(updated)
    }

    pub async fn delete_policy(&self, id: &str, ctx: &AuditContext) -> Result<Policy> {
        let deleted = self
            .bounded("delete_policy", self.store.delete_policy(id))
            .await?;

        self.invalidate(&deleted.scope).await;
        self.audit(
            &deleted.scope,
            ctx,
            "policy.delete",
            POLICY,
            &deleted.id,
            snapshot(&deleted),
            None,
        );
        info!(policy_id = %deleted.id, "Policy deleted");
        Ok(deleted)
    }

    pub async fn list_policies(&self, scope: &Scope, filter: &PolicyFilter) -> Result<Page<Policy>> {
        self.bounded("list_policies", self.store.list_policies(scope, filter))
            .await
    }

    // Namespaces

    pub async fn create_namespace(
        &self,
        namespace: NewNamespace,
        ctx: &AuditContext,
    ) -> Result<Namespace> {
        let created = self
            .bounded("create_namespace", self.store.create_namespace(namespace))
            .await?;
        self.audit(
            &created.scope,
            ctx,
            "namespace.create",
            NAMESPACE,
            &created.id,
            None,
            snapshot(&created),
        );
        Ok(created)
    }

    pub async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        self.bounded("get_namespace", self.store.get_namespace(id))
            .await
    }

    pub async fn get_namespace_for_scope(&self, scope: &Scope) -> Result<Option<Namespace>> {
        self.bounded(
            "get_namespace_by_scope",
            self.store.get_namespace_by_scope(scope),
        )
        .await
    }

    pub async fn update_namespace(
        &self,
        id: &str,
        update: NamespaceUpdate,
        ctx: &AuditContext,
    ) -> Result<Namespace> {
        let current = self.get_namespace(id).await?;
        let updated = self
            .bounded("update_namespace", self.store.update_namespace(id, update))
            .await?;
        self.audit(
            &updated.scope,
            ctx,
            "namespace.update",
            NAMESPACE,
            &updated.id,
            snapshot(&current),
            snapshot(&updated),
        );
        Ok(updated)
    }

    /// Fails with `Conflict` while policies still reference the namespace
    pub async fn delete_namespace(&self, id: &str, ctx: &AuditContext) -> Result<Namespace> {
        let deleted = self
            .bounded("delete_namespace", self.store.delete_namespace(id))
            .await?;
        self.audit(
            &deleted.scope,
            ctx,
            "namespace.delete",
            NAMESPACE,
            &deleted.id,
            snapshot(&deleted),
            None,
        );
        Ok(deleted)
    }

    pub async fn list_namespaces(
        &self,
        app_id: &str,
        environment_id: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<Namespace>> {
        self.bounded(
            "list_namespaces",
            self.store.list_namespaces(app_id, environment_id, pagination),
        )
        .await
    }

    // Resource definitions

    pub async fn create_resource_definition(
        &self,
        definition: NewResourceDefinition,
        ctx: &AuditContext,
    ) -> Result<ResourceDefinition> {
        let namespace = self.get_namespace(&definition.namespace_id).await?;
        let created = self
            .bounded(
                "create_resource_definition",
                self.store.create_resource_definition(definition),
            )
            .await?;
        self.audit(
            &namespace.scope,
            ctx,
            "resource_definition.create",
            RESOURCE_DEFINITION,
            &created.id,
            None,
            snapshot(&created),
        );
        Ok(created)
    }

    pub async fn get_resource_definition(&self, id: &str) -> Result<ResourceDefinition> {
        self.bounded(
            "get_resource_definition",
            self.store.get_resource_definition(id),
        )
        .await
    }

    pub async fn update_resource_definition(
        &self,
        id: &str,
        update: ResourceDefinitionUpdate,
        ctx: &AuditContext,
    ) -> Result<ResourceDefinition> {
        let current = self.get_resource_definition(id).await?;
        let namespace = self.get_namespace(&current.namespace_id).await?;
        let updated = self
            .bounded(
                "update_resource_definition",
                self.store.update_resource_definition(id, update),
            )
            .await?;
        self.audit(
            &namespace.scope,
            ctx,
            "resource_definition.update",
            RESOURCE_DEFINITION,
            &updated.id,
            snapshot(&current),
            snapshot(&updated),
        );
        Ok(updated)
    }

    pub async fn delete_resource_definition(
        &self,
        id: &str,
        ctx: &AuditContext,
    ) -> Result<ResourceDefinition> {
        let current = self.get_resource_definition(id).await?;
        let namespace = self.get_namespace(&current.namespace_id).await?;
        let deleted = self
            .bounded(
                "delete_resource_definition",
                self.store.delete_resource_definition(id),
            )
            .await?;
        self.audit(
            &namespace.scope,
            ctx,
            "resource_definition.delete",
            RESOURCE_DEFINITION,
            &deleted.id,
            snapshot(&deleted),
            None,
        );
        Ok(deleted)
    }

    pub async fn list_resource_definitions(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<ResourceDefinition>> {
        self.bounded(
            "list_resource_definitions",
            self.store.list_resource_definitions(namespace_id, pagination),
        )
        .await
    }

    // Action definitions

    pub async fn create_action_definition(
        &self,
        definition: NewActionDefinition,
        ctx: &AuditContext,
    ) -> Result<ActionDefinition> {
        let namespace = self.get_namespace(&definition.namespace_id).await?;
        let created = self
            .bounded(
                "create_action_definition",
                self.store.create_action_definition(definition),
            )
            .await?;
        self.audit(
            &namespace.scope,
            ctx,
            "action_definition.create",
            ACTION_DEFINITION,
            &created.id,
            None,
            snapshot(&created),
        );
        Ok(created)
    }

    pub async fn get_action_definition(&self, id: &str) -> Result<ActionDefinition> {
        self.bounded(
            "get_action_definition",
            self.store.get_action_definition(id),
        )
        .await
    }

    pub async fn update_action_definition(
        &self,
        id: &str,
        update: ActionDefinitionUpdate,
        ctx: &AuditContext,
    ) -> Result<ActionDefinition> {
        let current = self.get_action_definition(id).await?;
        let namespace = self.get_namespace(&current.namespace_id).await?;
        let updated = self
            .bounded(
                "update_action_definition",
                self.store.update_action_definition(id, update),
            )
            .await?;
        self.audit(
            &namespace.scope,
            ctx,
            "action_definition.update",
            ACTION_DEFINITION,
            &updated.id,
            snapshot(&current),
            snapshot(&updated),
        );
        Ok(updated)
    }

    pub async fn delete_action_definition(
        &self,
        id: &str,
        ctx: &AuditContext,
    ) -> Result<ActionDefinition> {
        let current = self.get_action_definition(id).await?;
        let namespace = self.get_namespace(&current.namespace_id).await?;
        let deleted = self
            .bounded(
                "delete_action_definition",
                self.store.delete_action_definition(id),
            )
            .await?;
        self.audit(
            &namespace.scope,
            ctx,
            "action_definition.delete",
            ACTION_DEFINITION,
            &deleted.id,
            snapshot(&deleted),
            None,
        );
        Ok(deleted)
    }

    pub async fn list_action_definitions(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<ActionDefinition>> {
        self.bounded(
            "list_action_definitions",
            self.store.list_action_definitions(namespace_id, pagination),
        )
        .await
    }

    // Effective definitions

    /// Resource definitions visible at `scope`
    ///
    /// An organization sees its own namespace's definitions and, unless its
    /// namespace opts out of `inherit_platform`, the environment-global ones.
    /// Organization definitions shadow global definitions of the same type.
    pub async fn effective_resource_definitions(
        &self,
        scope: &Scope,
    ) -> Result<Vec<ResourceDefinition>> {
        let (own, inherited) = self.effective_namespaces(scope).await?;

        let mut merged: BTreeMap<String, ResourceDefinition> = BTreeMap::new();
        if let Some(global) = inherited {
            for definition in self.all_resource_definitions(&global.id).await? {
                merged.insert(definition.resource_type.clone(), definition);
            }
        }
        if let Some(own) = own {
            for definition in self.all_resource_definitions(&own.id).await? {
                merged.insert(definition.resource_type.clone(), definition);
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Check a resource's attribute object against the definition of its
    /// type visible at `scope`. `NotFound` when no definition is visible.
    pub async fn check_resource_attributes(
        &self,
        scope: &Scope,
        resource_type: &str,
        attributes: &JsonValue,
    ) -> Result<()> {
        let definitions = self.effective_resource_definitions(scope).await?;
        let definition = definitions
            .iter()
            .find(|d| d.resource_type == resource_type)
            .ok_or_else(|| {
                AuthzError::NotFound(format!(
                    "resource definition '{}' at {}",
                    resource_type, scope
                ))
            })?;
        definition.check_instance(attributes)
    }

    /// Action definitions visible at `scope`, merged like
    /// [`Self::effective_resource_definitions`]
    pub async fn effective_action_definitions(&self, scope: &Scope) -> Result<Vec<ActionDefinition>> {
        let (own, inherited) = self.effective_namespaces(scope).await?;

        let mut merged: BTreeMap<String, ActionDefinition> = BTreeMap::new();
        if let Some(global) = inherited {
            for definition in self.all_action_definitions(&global.id).await? {
                merged.insert(definition.name.clone(), definition);
            }
        }
        if let Some(own) = own {
            for definition in self.all_action_definitions(&own.id).await? {
                merged.insert(definition.name.clone(), definition);
            }
        }
        Ok(merged.into_values().collect())
    }

    /// The scope's own namespace and the environment-global namespace it inherits from
    async fn effective_namespaces(
        &self,
        scope: &Scope,
    ) -> Result<(Option<Namespace>, Option<Namespace>)> {
        let own = self.get_namespace_for_scope(scope).await?;
        if scope.is_environment_global() {
            return Ok((own, None));
        }

        let inherits = own.as_ref().map_or(true, |ns| ns.inherit_platform);
        let inherited = if inherits {
            self.get_namespace_for_scope(&scope.environment_baseline())
                .await?
        } else {
            None
        };
        Ok((own, inherited))
    }

    async fn all_resource_definitions(&self, namespace_id: &str) -> Result<Vec<ResourceDefinition>> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .list_resource_definitions(namespace_id, Pagination::new(MAX_PAGE_LIMIT, offset))
                .await?;
            let more = page.has_more();
            offset += page.items.len();
            all.extend(page.items);
            if !more {
                return Ok(all);
            }
        }
    }

    async fn all_action_definitions(&self, namespace_id: &str) -> Result<Vec<ActionDefinition>> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .list_action_definitions(namespace_id, Pagination::new(MAX_PAGE_LIMIT, offset))
                .await?;
            let more = page.has_more();
            offset += page.items.len();
            all.extend(page.items);
            if !more {
                return Ok(all);
            }
        }
    }

    // Audit and cache maintenance

    pub async fn list_audit_events(
        &self,
        scope: &Scope,
        filter: &AuditFilter,
    ) -> Result<Page<AuditEvent>> {
        self.bounded("list_audit_events", self.store.list_audit_events(scope, filter))
            .await
    }

    /// Fill the cache with every active resource type of `scope`.
    /// Returns the number of entries written.
    ///
    /// Entries are written only while no invalidation of the app has run
    /// since the policies were read.
    pub async fn warm_cache(&self, scope: &Scope) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };

        let generation = tokio::time::timeout(
            self.config.cache_timeout,
            cache.generation(scope.app_id()),
        )
        .await
        .map_err(|_| AuthzError::Timeout("reading cache generation".to_string()))??;

        let policies = self
            .bounded("get_active_policies", self.store.get_active_policies(scope))
            .await?;

        let mut by_type: BTreeMap<String, Vec<Policy>> = BTreeMap::new();
        for policy in policies {
            by_type
                .entry(policy.resource_type.clone())
                .or_default()
                .push(policy);
        }

        let entries: Vec<_> = by_type
            .into_iter()
            .map(|(resource_type, policies)| {
                let (set, _) = build_policy_set(&policies, &self.compiler);
                (CacheKey::new(scope, resource_type), set)
            })
            .collect();
        let total = entries.len();

        let fill = async {
            let mut written = 0;
            for (key, set) in entries {
                if cache
                    .set_if_generation(&key, set, self.config.cache_ttl, generation)
                    .await?
                {
                    written += 1;
                }
            }
            Ok::<_, AuthzError>(written)
        };
        let written = tokio::time::timeout(self.config.cache_timeout, fill)
            .await
            .map_err(|_| AuthzError::Timeout("warming policy cache".to_string()))??;

        if written < total {
            info!(scope = %scope, skipped = total - written, "Policies changed while warming, entries left out");
        }
        info!(scope = %scope, entries = written, "Warmed policy cache");
        Ok(written)
    }

    /// Drop every cached policy set of an app. Returns the number removed.
    pub async fn invalidate_app(&self, app_id: &str) -> Result<u64> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };

        let removed = tokio::time::timeout(self.config.cache_timeout, cache.delete_by_app(app_id))
            .await
            .map_err(|_| AuthzError::Timeout(format!("invalidating app {}", app_id)))??;
        info!(app_id, removed, "Invalidated app policy cache");
        Ok(removed)
    }

    /// Resource types that have at least one enabled policy at `scope`
    pub async fn active_resource_types(&self, scope: &Scope) -> Result<Vec<String>> {
        let policies = self
            .bounded("get_active_policies", self.store.get_active_policies(scope))
            .await?;
        let mut seen = HashSet::new();
        let mut types: Vec<String> = policies
            .into_iter()
            .filter(|p| seen.insert(p.resource_type.clone()))
            .map(|p| p.resource_type)
            .collect();
        types.sort();
        Ok(types)
    }
}

fn snapshot<T: Serialize>(value: &T) -> Option<JsonValue> {
    match serde_json::to_value(value) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "Could not snapshot record for audit");
            None
        }
    }
}
