//! Policy records and the storage contract

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditFilter};
use crate::condition::{ConditionCompiler, Program};
use crate::error::{AuthzError, Result};
use crate::namespace::{
    ActionDefinition, ActionDefinitionUpdate, Namespace, NamespaceUpdate, NewActionDefinition,
    NewNamespace, NewResourceDefinition, ResourceDefinition, ResourceDefinitionUpdate,
};
use crate::scope::Scope;
use crate::types::{
    new_id, require_text, validate_identifier, NamespaceId, Page, Pagination, PolicyId,
    ACTION_WILDCARD,
};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryPolicyStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresPolicyStore;

/// Policy definition
///
/// Any enabled policy whose condition holds allows the request; there is no
/// deny effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique policy identifier
    pub id: PolicyId,

    /// App, environment and optional organization; fixed at creation
    #[serde(flatten)]
    pub scope: Scope,

    /// Owning namespace; fixed at creation
    pub namespace_id: NamespaceId,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Condition expression (e.g. `resource.ownerId == subject.id`)
    pub expression: String,

    pub resource_type: String,

    /// Action names, or `*` for every action
    pub actions: Vec<String>,

    /// Higher priority is evaluated first
    #[serde(default)]
    pub priority: i32,

    /// Disabled policies are kept but never evaluated
    pub enabled: bool,

    /// Optimistic concurrency version, starts at 1
    pub version: i32,

    pub created_by: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Validate fields and compile the expression.
    ///
    /// Stores call this before persisting, so no backend can hold a policy
    /// whose expression does not compile.
    pub fn validate(&self) -> Result<()> {
        require_text("policy name", &self.name)?;
        require_text("namespace id", &self.namespace_id)?;
        validate_identifier("resource type", &self.resource_type)?;

        if self.actions.is_empty() {
            return Err(AuthzError::InvalidInput(
                "policy must name at least one action".to_string(),
            ));
        }
        for action in &self.actions {
            if action != ACTION_WILDCARD {
                validate_identifier("action", action)?;
            }
        }

        ConditionCompiler::validate(&self.expression)
            .map_err(|e| AuthzError::InvalidExpression(format!("policy '{}': {}", self.name, e)))
    }

    pub fn matches_action(&self, action: &str) -> bool {
        self.actions
            .iter()
            .any(|a| a == ACTION_WILDCARD || a == action)
    }
}

/// Evaluation order: priority descending, then newest first, then id
pub fn evaluation_order(
    (a_priority, a_created, a_id): (i32, &DateTime<Utc>, &str),
    (b_priority, b_created, b_id): (i32, &DateTime<Utc>, &str),
) -> Ordering {
    b_priority
        .cmp(&a_priority)
        .then_with(|| b_created.cmp(a_created))
        .then_with(|| a_id.cmp(b_id))
}

/// Sort policies into evaluation order
pub fn sort_policies(policies: &mut [Policy]) {
    policies.sort_by(|a, b| {
        evaluation_order(
            (a.priority, &a.created_at, a.id.as_str()),
            (b.priority, &b.created_at, b.id.as_str()),
        )
    });
}

/// Input for creating a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPolicy {
    pub scope: Scope,
    pub namespace_id: NamespaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub expression: String,
    pub resource_type: String,
    pub actions: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_by: String,
}

fn default_enabled() -> bool {
    true
}

impl NewPolicy {
    pub fn new(
        scope: Scope,
        namespace_id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
        actions: &[&str],
        expression: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            namespace_id: namespace_id.into(),
            name: name.into(),
            description: String::new(),
            expression: expression.into(),
            resource_type: resource_type.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            priority: 0,
            enabled: true,
            created_by: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = actor.into();
        self
    }

    /// Assign identity, version 1 and timestamps
    pub fn into_policy(self) -> Policy {
        let now = Utc::now();
        Policy {
            id: new_id(),
            scope: self.scope,
            namespace_id: self.namespace_id,
            name: self.name,
            description: self.description,
            expression: self.expression,
            resource_type: self.resource_type,
            actions: self.actions,
            priority: self.priority,
            enabled: self.enabled,
            version: 1,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Version-checked partial update; scope and namespace cannot change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdate {
    /// Version the caller last read
    pub version: i32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub expression: Option<String>,
    pub resource_type: Option<String>,
    pub actions: Option<Vec<String>>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
}

impl PolicyUpdate {
    pub fn new(version: i32) -> Self {
        Self {
            version,
            name: None,
            description: None,
            expression: None,
            resource_type: None,
            actions: None,
            priority: None,
            enabled: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn actions(mut self, actions: &[&str]) -> Self {
        self.actions = Some(actions.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Check the version, apply the changes, bump the version and validate.
    ///
    /// Returns the updated copy; `current` is untouched on failure.
    pub fn apply(&self, current: &Policy) -> Result<Policy> {
        if current.version != self.version {
            return Err(AuthzError::Conflict(format!(
                "policy {} is at version {}, update expected {}",
                current.id, current.version, self.version
            )));
        }

        let mut updated = current.clone();
        if let Some(name) = &self.name {
            updated.name = name.clone();
        }
        if let Some(description) = &self.description {
            updated.description = description.clone();
        }
        if let Some(expression) = &self.expression {
            updated.expression = expression.clone();
        }
        if let Some(resource_type) = &self.resource_type {
            updated.resource_type = resource_type.clone();
        }
        if let Some(actions) = &self.actions {
            updated.actions = actions.clone();
        }
        if let Some(priority) = self.priority {
            updated.priority = priority;
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        updated.version = current.version + 1;
        updated.updated_at = Utc::now();

        updated.validate()?;
        Ok(updated)
    }
}

/// Filters for administrative listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFilter {
    pub resource_type: Option<String>,
    pub enabled: Option<bool>,
    pub namespace_id: Option<String>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl PolicyFilter {
    pub fn matches(&self, policy: &Policy) -> bool {
        self.resource_type
            .as_deref()
            .map_or(true, |rt| policy.resource_type == rt)
            && self.enabled.map_or(true, |e| policy.enabled == e)
            && self
                .namespace_id
                .as_deref()
                .map_or(true, |ns| policy.namespace_id == ns)
    }
}

/// Cache-ready form of a policy: the compiled condition plus the fields
/// needed to filter and order candidates without touching the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPolicy {
    pub policy_id: PolicyId,
    pub name: String,
    pub resource_type: String,
    pub actions: Vec<String>,
    pub priority: i32,
    pub enabled: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub program: Arc<Program>,
}

impl CompiledPolicy {
    pub fn compile(policy: &Policy, compiler: &ConditionCompiler) -> Result<Self> {
        let program = compiler.compile(&policy.expression).map_err(|e| {
            AuthzError::InvalidExpression(format!("policy {}: {}", policy.id, e))
        })?;

        Ok(Self {
            policy_id: policy.id.clone(),
            name: policy.name.clone(),
            resource_type: policy.resource_type.clone(),
            actions: policy.actions.clone(),
            priority: policy.priority,
            enabled: policy.enabled,
            version: policy.version,
            created_at: policy.created_at,
            program,
        })
    }

    pub fn matches_action(&self, action: &str) -> bool {
        self.actions
            .iter()
            .any(|a| a == ACTION_WILDCARD || a == action)
    }

    pub fn evaluation_order(&self, other: &Self) -> Ordering {
        evaluation_order(
            (self.priority, &self.created_at, self.policy_id.as_str()),
            (other.priority, &other.created_at, other.policy_id.as_str()),
        )
    }
}

/// Persistence contract for policies, namespaces, definitions and audit events
///
/// Failures of the backing infrastructure surface as
/// `AuthzError::RepositoryUnavailable`; they are never swallowed.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Validate, compile and persist a new policy at version 1
    async fn create_policy(&self, policy: NewPolicy) -> Result<Policy>;

    async fn get_policy(&self, id: &str) -> Result<Policy>;

    /// Apply a version-checked update; a stale version fails with `Conflict`
    async fn update_policy(&self, id: &str, update: PolicyUpdate) -> Result<Policy>;

    /// Hard delete, returning the removed record
    async fn delete_policy(&self, id: &str) -> Result<Policy>;

    /// Administrative listing, strictly partitioned by the exact organization
    async fn list_policies(&self, scope: &Scope, filter: &PolicyFilter) -> Result<Page<Policy>>;

    /// Enabled policies of a resource type in the effective set of `scope`,
    /// in evaluation order
    async fn get_policies_by_resource_type(
        &self,
        scope: &Scope,
        resource_type: &str,
    ) -> Result<Vec<Policy>>;

    /// Every enabled policy in the effective set of `scope`, in evaluation order
    async fn get_active_policies(&self, scope: &Scope) -> Result<Vec<Policy>>;

    /// At most one namespace per scope; a second one fails with `Conflict`
    async fn create_namespace(&self, namespace: NewNamespace) -> Result<Namespace>;

    async fn get_namespace(&self, id: &str) -> Result<Namespace>;

    async fn get_namespace_by_scope(&self, scope: &Scope) -> Result<Option<Namespace>>;

    async fn update_namespace(&self, id: &str, update: NamespaceUpdate) -> Result<Namespace>;

    /// Removes the namespace and its definitions; `Conflict` while policies
    /// still reference it
    async fn delete_namespace(&self, id: &str) -> Result<Namespace>;

    async fn list_namespaces(
        &self,
        app_id: &str,
        environment_id: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<Namespace>>;

    async fn create_resource_definition(
        &self,
        definition: NewResourceDefinition,
    ) -> Result<ResourceDefinition>;

    async fn get_resource_definition(&self, id: &str) -> Result<ResourceDefinition>;

    async fn update_resource_definition(
        &self,
        id: &str,
        update: ResourceDefinitionUpdate,
    ) -> Result<ResourceDefinition>;

    async fn delete_resource_definition(&self, id: &str) -> Result<ResourceDefinition>;

    async fn list_resource_definitions(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<ResourceDefinition>>;

    async fn create_action_definition(
        &self,
        definition: NewActionDefinition,
    ) -> Result<ActionDefinition>;

    async fn get_action_definition(&self, id: &str) -> Result<ActionDefinition>;

    async fn update_action_definition(
        &self,
        id: &str,
        update: ActionDefinitionUpdate,
    ) -> Result<ActionDefinition>;

    async fn delete_action_definition(&self, id: &str) -> Result<ActionDefinition>;

    async fn list_action_definitions(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<ActionDefinition>>;

    async fn create_audit_event(&self, event: AuditEvent) -> Result<()>;

    /// Events in the exact partition of `scope`, newest first
    async fn list_audit_events(
        &self,
        scope: &Scope,
        filter: &AuditFilter,
    ) -> Result<Page<AuditEvent>>;
}
