/// Scope resolver
///
/// Turns request identifiers into a canonical [`Scope`] and describes the
/// effective partitions a resource-type lookup must union. Purely structural,
/// no I/O.

use tracing::debug;

use super::types::{Partition, Scope};
use crate::error::Result;

/// Partitions a lookup for one scope must read and union
///
/// The organization partition (when the scope names one) plus the
/// environment-global baseline. Organization scoping is additive, never a
/// replacement of the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveQuery {
    app_id: String,
    environment_id: String,
    organization_id: Option<String>,
    include_environment_baseline: bool,
}

impl EffectiveQuery {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    /// Organization partition to read, if any
    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    /// Always true: the environment-global partition is part of every lookup
    pub fn includes_environment_baseline(&self) -> bool {
        self.include_environment_baseline
    }

    /// The partitions to union, organization first
    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions = Vec::with_capacity(2);
        if let Some(org) = &self.organization_id {
            partitions.push(Partition::Organization(org.clone()));
        }
        if self.include_environment_baseline {
            partitions.push(Partition::EnvironmentGlobal);
        }
        partitions
    }

    /// Whether a record stored under `record_scope` belongs to the effective set
    pub fn admits(&self, record_scope: &Scope) -> bool {
        if record_scope.app_id() != self.app_id
            || record_scope.environment_id() != self.environment_id
        {
            return false;
        }

        match record_scope.organization_id() {
            None => self.include_environment_baseline,
            Some(org) => self.organization_id.as_deref() == Some(org),
        }
    }
}

/// Resolves request identifiers into scopes
///
/// # Examples
///
/// ```
/// use scopegate_authz::scope::{Scope, ScopeResolver};
///
/// let resolver = ScopeResolver::new();
/// let org_scope = resolver.resolve("app", "env", Some("org-a")).unwrap();
/// let query = resolver.effective_resource_type_query(&org_scope);
///
/// // Environment-global records are visible to the organization
/// assert!(query.admits(&Scope::environment("app", "env").unwrap()));
/// // Another organization's records are not
/// assert!(!query.admits(&Scope::organization("app", "env", "org-b").unwrap()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScopeResolver;

impl ScopeResolver {
    pub fn new() -> Self {
        Self
    }

    /// Builds a scope, failing with `ScopeRequired` if app or environment is empty
    pub fn resolve(
        &self,
        app_id: &str,
        environment_id: &str,
        organization_id: Option<&str>,
    ) -> Result<Scope> {
        let scope = Scope::new(app_id, environment_id, organization_id)?;
        debug!(scope = %scope, "Resolved scope");
        Ok(scope)
    }

    /// Partitions a resource-type lookup for `scope` must union
    pub fn effective_resource_type_query(&self, scope: &Scope) -> EffectiveQuery {
        EffectiveQuery {
            app_id: scope.app_id().to_string(),
            environment_id: scope.environment_id().to_string(),
            organization_id: scope.organization_id().map(str::to_string),
            include_environment_baseline: true,
        }
    }

    /// Strict single-partition predicate used by administrative listing
    pub fn exact_partition(&self, scope: &Scope, record_scope: &Scope) -> bool {
        scope == record_scope
    }
}
