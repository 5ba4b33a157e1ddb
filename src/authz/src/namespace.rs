//! Namespaces and the custom resource/action definitions they own
//!
//! Exactly one namespace exists per scope. Definitions document and validate
//! the attributes a resource type carries; they take no part in evaluation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AuthzError, Result};
use crate::scope::Scope;
use crate::types::{new_id, require_text, validate_identifier, NamespaceId};

/// Container of custom definitions for one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub id: NamespaceId,
    #[serde(flatten)]
    pub scope: Scope,
    /// Template this namespace was provisioned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Organization namespaces also see the environment-global definitions
    pub inherit_platform: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNamespace {
    pub scope: Scope,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default = "default_inherit_platform")]
    pub inherit_platform: bool,
}

fn default_inherit_platform() -> bool {
    true
}

impl NewNamespace {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            template_id: None,
            inherit_platform: true,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_inherit_platform(mut self, inherit: bool) -> Self {
        self.inherit_platform = inherit;
        self
    }

    pub fn into_namespace(self) -> Namespace {
        let now = Utc::now();
        Namespace {
            id: new_id(),
            scope: self.scope,
            template_id: self.template_id,
            inherit_platform: self.inherit_platform,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mutable namespace fields; the scope never changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceUpdate {
    pub template_id: Option<String>,
    pub inherit_platform: Option<bool>,
}

impl NamespaceUpdate {
    pub fn apply_to(&self, namespace: &mut Namespace) {
        if let Some(template_id) = &self.template_id {
            namespace.template_id = Some(template_id.clone());
        }
        if let Some(inherit) = self.inherit_platform {
            namespace.inherit_platform = inherit;
        }
        namespace.updated_at = Utc::now();
    }
}

/// Declared type of a resource attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Int,
    Bool,
    Array,
    Object,
}

impl AttributeType {
    /// Whether a JSON value fits this type
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Typed attribute declared by a resource definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub description: String,
}

impl ResourceAttribute {
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Custom resource type registered under a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub id: String,
    pub namespace_id: NamespaceId,
    pub resource_type: String,
    pub description: String,
    pub attributes: Vec<ResourceAttribute>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceDefinition {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("resource type", &self.resource_type)?;
        validate_attributes(&self.attributes)
    }

    /// Check a resource's attribute object against the declared attributes.
    ///
    /// Missing required attributes without a default and values of the wrong
    /// type are rejected. Undeclared attributes are allowed.
    pub fn check_instance(&self, attributes: &JsonValue) -> Result<()> {
        let empty = serde_json::Map::new();
        let object = match attributes {
            JsonValue::Object(object) => object,
            JsonValue::Null => &empty,
            _ => {
                return Err(AuthzError::InvalidInput(format!(
                    "attributes of '{}' must be an object",
                    self.resource_type
                )))
            }
        };

        for attribute in &self.attributes {
            match object.get(&attribute.name) {
                Some(value) if !attribute.attr_type.accepts(value) => {
                    return Err(AuthzError::InvalidInput(format!(
                        "attribute '{}' of '{}' must be of type {:?}",
                        attribute.name, self.resource_type, attribute.attr_type
                    )));
                }
                None if attribute.required && attribute.default.is_none() => {
                    return Err(AuthzError::InvalidInput(format!(
                        "attribute '{}' of '{}' is required",
                        attribute.name, self.resource_type
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn validate_attributes(attributes: &[ResourceAttribute]) -> Result<()> {
    let mut seen = HashSet::new();
    for attribute in attributes {
        validate_identifier("attribute", &attribute.name)?;
        if !seen.insert(attribute.name.as_str()) {
            return Err(AuthzError::InvalidInput(format!(
                "attribute '{}' is declared twice",
                attribute.name
            )));
        }
        if let Some(default) = &attribute.default {
            if !attribute.attr_type.accepts(default) {
                return Err(AuthzError::InvalidInput(format!(
                    "default of attribute '{}' does not match type {:?}",
                    attribute.name, attribute.attr_type
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResourceDefinition {
    pub namespace_id: NamespaceId,
    pub resource_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: Vec<ResourceAttribute>,
}

impl NewResourceDefinition {
    pub fn new(namespace_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            resource_type: resource_type.into(),
            description: String::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_attribute(mut self, attribute: ResourceAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn into_definition(self) -> ResourceDefinition {
        let now = Utc::now();
        ResourceDefinition {
            id: new_id(),
            namespace_id: self.namespace_id,
            resource_type: self.resource_type,
            description: self.description,
            attributes: self.attributes,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionUpdate {
    pub description: Option<String>,
    pub attributes: Option<Vec<ResourceAttribute>>,
}

impl ResourceDefinitionUpdate {
    pub fn apply_to(&self, definition: &mut ResourceDefinition) {
        if let Some(description) = &self.description {
            definition.description = description.clone();
        }
        if let Some(attributes) = &self.attributes {
            definition.attributes = attributes.clone();
        }
        definition.updated_at = Utc::now();
    }
}

/// Custom action registered under a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub id: String,
    pub namespace_id: NamespaceId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionDefinition {
    pub fn validate(&self) -> Result<()> {
        require_text("action name", &self.name)?;
        validate_identifier("action", &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActionDefinition {
    pub namespace_id: NamespaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl NewActionDefinition {
    pub fn new(namespace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn into_definition(self) -> ActionDefinition {
        let now = Utc::now();
        ActionDefinition {
            id: new_id(),
            namespace_id: self.namespace_id,
            name: self.name,
            description: self.description,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinitionUpdate {
    pub description: Option<String>,
}

impl ActionDefinitionUpdate {
    pub fn apply_to(&self, definition: &mut ActionDefinition) {
        if let Some(description) = &self.description {
            definition.description = description.clone();
        }
        definition.updated_at = Utc::now();
    }
}
