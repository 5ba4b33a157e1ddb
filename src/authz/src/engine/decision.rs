//! Authorization request and decision types

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::condition::Attributes;
use crate::error::AuthzError;
use crate::types::PolicyId;

/// Request metadata supplied by the calling layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    /// Caller IP address
    pub ip_address: Option<String>,

    /// Caller user agent
    pub user_agent: Option<String>,

    /// Additional request attributes (time, channel, ...)
    pub attributes: Attributes,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::condition::AttrValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Inputs of one `authorize` call
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizeRequest {
    pub app_id: String,
    pub environment_id: String,
    pub organization_id: Option<String>,

    /// Subject requesting access
    pub principal_id: String,

    /// Action being performed (read, write, delete, ...)
    pub action: String,

    pub resource_type: String,
    pub resource_id: String,

    pub context: RequestContext,
}

impl AuthorizeRequest {
    pub fn new(
        app_id: impl Into<String>,
        environment_id: impl Into<String>,
        principal_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            environment_id: environment_id.into(),
            organization_id: None,
            principal_id: principal_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            context: RequestContext::default(),
        }
    }

    pub fn in_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// Allow or deny
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Deny,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

/// Result of one authorization
///
/// Carries no per-call identity or timestamp, so repeated calls over
/// unchanged data compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub outcome: Outcome,

    /// Policy whose condition allowed the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy_id: Option<PolicyId>,

    pub reason: String,
}

impl Decision {
    /// Allow on behalf of a matching policy
    pub fn allow(policy_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Allow,
            matched_policy_id: Some(policy_id.into()),
            reason: reason.into(),
        }
    }

    /// Fail-closed deny
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            matched_policy_id: None,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// Snapshot recorded on the decision audit event
    pub fn audit_value(&self, action: &str) -> JsonValue {
        serde_json::json!({
            "action": action,
            "outcome": self.outcome,
            "matchedPolicyId": self.matched_policy_id,
            "reason": self.reason,
        })
    }
}

/// Failed authorization; always carries a deny decision
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("authorization failed closed: {error}")]
pub struct AuthorizeError {
    pub decision: Decision,
    #[source]
    pub error: AuthzError,
}

impl AuthorizeError {
    pub fn new(error: AuthzError) -> Self {
        Self {
            decision: Decision::deny(format!("evaluation failed: {}", error)),
            error,
        }
    }
}
