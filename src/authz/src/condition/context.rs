//! Evaluation context for condition expressions

use std::collections::BTreeMap;

use super::ast::Root;
use super::value::{AttrValue, Attributes, UNDEFINED};

/// Attribute bags available during evaluation: `{subject, resource, request}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    /// Principal attributes (id, roles, department, ...)
    pub subject: Attributes,

    /// Attributes of the resource being accessed
    pub resource: Attributes,

    /// Request metadata (action, ip, time, ...)
    pub request: Attributes,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: Attributes) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_resource(mut self, resource: Attributes) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_request(mut self, request: Attributes) -> Self {
        self.request = request;
        self
    }

    /// Set one attribute in a bag
    pub fn set(&mut self, root: Root, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.bag_mut(root).insert(key.into(), value.into());
    }

    /// Set an attribute only if the bag does not already hold it
    pub fn set_default(&mut self, root: Root, key: &str, value: impl Into<AttrValue>) {
        self.bag_mut(root)
            .entry(key.to_string())
            .or_insert_with(|| value.into());
    }

    /// Resolve an attribute path; missing keys resolve to `Undefined`.
    pub fn resolve(&self, root: Root, segments: &[String]) -> AttrValue {
        let bag = self.bag(root);
        let Some((first, rest)) = segments.split_first() else {
            return AttrValue::Map(
                bag.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>(),
            );
        };
        bag.get(first).unwrap_or(&UNDEFINED).lookup(rest).clone()
    }

    fn bag(&self, root: Root) -> &Attributes {
        match root {
            Root::Subject => &self.subject,
            Root::Resource => &self.resource,
            Root::Request => &self.request,
        }
    }

    fn bag_mut(&mut self, root: Root) -> &mut Attributes {
        match root {
            Root::Subject => &mut self.subject,
            Root::Resource => &mut self.resource,
            Root::Request => &mut self.request,
        }
    }
}
