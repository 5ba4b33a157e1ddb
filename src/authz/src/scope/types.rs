/// Scope type definitions and validation
///
/// A scope is never built from an empty app or environment identifier, and an
/// absent organization is its own partition rather than an empty string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AuthzError, Result};
use crate::types::{AppId, EnvironmentId, OrganizationId};

/// Which organization partition of an environment a record lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// Shared by every organization in the environment
    EnvironmentGlobal,
    /// Visible only to one organization
    Organization(OrganizationId),
}

impl Partition {
    pub fn organization_id(&self) -> Option<&str> {
        match self {
            Self::EnvironmentGlobal => None,
            Self::Organization(id) => Some(id),
        }
    }
}

/// The (app, environment, optional organization) triple partitioning policy data
///
/// # Examples
///
/// ```
/// use scopegate_authz::scope::Scope;
///
/// let scope = Scope::new("app-1", "prod", None).unwrap();
/// assert!(scope.is_environment_global());
/// assert!(Scope::new("", "prod", None).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawScope")]
pub struct Scope {
    app_id: AppId,
    environment_id: EnvironmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    organization_id: Option<OrganizationId>,
}

impl Scope {
    /// Creates a scope, failing with `ScopeRequired` when app or environment is empty.
    ///
    /// A present-but-empty organization identifier is rejected too, so it can
    /// never be confused with the environment-global partition.
    pub fn new(
        app_id: impl Into<AppId>,
        environment_id: impl Into<EnvironmentId>,
        organization_id: Option<&str>,
    ) -> Result<Self> {
        let app_id = app_id.into();
        let environment_id = environment_id.into();
        let organization_id = organization_id.map(str::to_string);

        if app_id.trim().is_empty() {
            return Err(AuthzError::ScopeRequired("app id is empty".to_string()));
        }
        if environment_id.trim().is_empty() {
            return Err(AuthzError::ScopeRequired("environment id is empty".to_string()));
        }
        if let Some(org) = &organization_id {
            if org.trim().is_empty() {
                return Err(AuthzError::ScopeRequired(
                    "organization id is present but empty".to_string(),
                ));
            }
        }

        Ok(Self {
            app_id,
            environment_id,
            organization_id,
        })
    }

    /// Environment-global scope for an app and environment
    pub fn environment(
        app_id: impl Into<AppId>,
        environment_id: impl Into<EnvironmentId>,
    ) -> Result<Self> {
        Self::new(app_id, environment_id, None)
    }

    /// Organization scope within an app and environment
    pub fn organization(
        app_id: impl Into<AppId>,
        environment_id: impl Into<EnvironmentId>,
        organization_id: impl Into<OrganizationId>,
    ) -> Result<Self> {
        let organization_id = organization_id.into();
        Self::new(app_id, environment_id, Some(organization_id.as_str()))
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    pub fn partition(&self) -> Partition {
        match &self.organization_id {
            Some(org) => Partition::Organization(org.clone()),
            None => Partition::EnvironmentGlobal,
        }
    }

    pub fn is_environment_global(&self) -> bool {
        self.organization_id.is_none()
    }

    /// The environment-global scope this scope falls back to
    pub fn environment_baseline(&self) -> Scope {
        Scope {
            app_id: self.app_id.clone(),
            environment_id: self.environment_id.clone(),
            organization_id: None,
        }
    }

    /// Whether both scopes live in the same app and environment
    pub fn same_environment(&self, other: &Scope) -> bool {
        self.app_id == other.app_id && self.environment_id == other.environment_id
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.organization_id {
            Some(org) => write!(f, "{}/{}/{}", self.app_id, self.environment_id, org),
            None => write!(f, "{}/{}/*", self.app_id, self.environment_id),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScope {
    app_id: String,
    environment_id: String,
    #[serde(default)]
    organization_id: Option<String>,
}

impl TryFrom<RawScope> for Scope {
    type Error = AuthzError;

    fn try_from(raw: RawScope) -> Result<Self> {
        Scope::new(raw.app_id, raw.environment_id, raw.organization_id.as_deref())
    }
}
