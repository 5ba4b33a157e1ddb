/// Tenant scope resolution
///
/// A [`Scope`] is the (app, environment, optional organization) triple that
/// partitions every policy record. The [`ScopeResolver`] builds scopes from
/// request identifiers and describes which stored partitions are effective
/// for a scope.
///
/// # Examples
///
/// ```
/// use scopegate_authz::scope::ScopeResolver;
///
/// let resolver = ScopeResolver::new();
/// let scope = resolver.resolve("app-1", "prod", Some("org-acme")).unwrap();
///
/// let query = resolver.effective_resource_type_query(&scope);
/// assert_eq!(query.organization_id(), Some("org-acme"));
/// assert!(query.includes_environment_baseline());
/// ```

mod types;
mod resolver;


pub use types::{Partition, Scope};
pub use resolver::{EffectiveQuery, ScopeResolver};
