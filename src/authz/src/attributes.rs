//! Attribute sources for condition evaluation
//!
//! The engine asks an [`AttributeProvider`] for the subject, resource and
//! request bags independently. Each source may fail on its own; a failed
//! source leaves its bag empty and every path into it evaluates as undefined.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::condition::{AttrValue, Attributes};
use crate::engine::RequestContext;
use crate::error::{AuthzError, Result};
use crate::scope::Scope;

/// External collaborator supplying attribute bags
#[async_trait]
pub trait AttributeProvider: Send + Sync {
    /// Attributes of the principal
    async fn get_user_attributes(&self, scope: &Scope, user_id: &str) -> Result<Attributes>;

    /// Attributes of one resource instance
    async fn get_resource_attributes(
        &self,
        scope: &Scope,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Attributes>;

    /// Request attributes; by default the caller-supplied context as-is
    async fn get_request_attributes(&self, context: &RequestContext) -> Result<Attributes> {
        Ok(request_attributes(context))
    }
}

/// Flatten a request context into the `request` bag
pub fn request_attributes(context: &RequestContext) -> Attributes {
    let mut attributes = context.attributes.clone();
    if let Some(ip) = &context.ip_address {
        attributes
            .entry("ip".to_string())
            .or_insert_with(|| AttrValue::from(ip.as_str()));
    }
    if let Some(user_agent) = &context.user_agent {
        attributes
            .entry("userAgent".to_string())
            .or_insert_with(|| AttrValue::from(user_agent.as_str()));
    }
    attributes
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserKey {
    scope: Scope,
    user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    scope: Scope,
    resource_type: String,
    resource_id: String,
}

/// In-memory provider for tests and embedded use
///
/// Unknown users and resources yield empty bags. Sources can be switched
/// into a failing mode individually.
#[derive(Default)]
pub struct StaticAttributeProvider {
    users: DashMap<UserKey, Attributes>,
    resources: DashMap<ResourceKey, Attributes>,
    fail_users: AtomicBool,
    fail_resources: AtomicBool,
    fail_requests: AtomicBool,
}

impl StaticAttributeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user(&self, scope: &Scope, user_id: impl Into<String>, attributes: Attributes) {
        self.users.insert(
            UserKey {
                scope: scope.clone(),
                user_id: user_id.into(),
            },
            attributes,
        );
    }

    pub fn set_resource(
        &self,
        scope: &Scope,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        attributes: Attributes,
    ) {
        self.resources.insert(
            ResourceKey {
                scope: scope.clone(),
                resource_type: resource_type.into(),
                resource_id: resource_id.into(),
            },
            attributes,
        );
    }

    pub fn fail_users(&self, fail: bool) {
        self.fail_users.store(fail, Ordering::SeqCst);
    }

    pub fn fail_resources(&self, fail: bool) {
        self.fail_resources.store(fail, Ordering::SeqCst);
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }
}

fn source_down(source: &str) -> AuthzError {
    AuthzError::RepositoryUnavailable(format!("{} attribute source unavailable", source))
}

#[async_trait]
impl AttributeProvider for StaticAttributeProvider {
    async fn get_user_attributes(&self, scope: &Scope, user_id: &str) -> Result<Attributes> {
        if self.fail_users.load(Ordering::SeqCst) {
            return Err(source_down("user"));
        }
        let key = UserKey {
            scope: scope.clone(),
            user_id: user_id.to_string(),
        };
        Ok(self
            .users
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn get_resource_attributes(
        &self,
        scope: &Scope,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Attributes> {
        if self.fail_resources.load(Ordering::SeqCst) {
            return Err(source_down("resource"));
        }
        let key = ResourceKey {
            scope: scope.clone(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        };
        Ok(self
            .resources
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn get_request_attributes(&self, context: &RequestContext) -> Result<Attributes> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(source_down("request"));
        }
        Ok(request_attributes(context))
    }
}
