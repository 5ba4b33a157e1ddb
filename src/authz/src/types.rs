//! Core identifiers and shared record helpers

use crate::error::{AuthzError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Unique policy identifier
pub type PolicyId = String;

/// Unique namespace identifier
pub type NamespaceId = String;

/// Application identifier
pub type AppId = String;

/// Environment identifier
pub type EnvironmentId = String;

/// Organization identifier
pub type OrganizationId = String;

/// Wildcard entry in a policy's action set
pub const ACTION_WILDCARD: &str = "*";

/// Default page size for list operations
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Upper bound on a single page
pub const MAX_PAGE_LIMIT: usize = 500;

/// Generate a fresh record identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Offset pagination for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    /// Limit clamped to `1..=MAX_PAGE_LIMIT`
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    /// Slice an already-ordered result set into a page
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let limit = self.effective_limit();
        let items = items.into_iter().skip(self.offset).take(limit).collect();
        Page {
            items,
            total,
            limit,
            offset: self.offset,
        }
    }
}

/// One page of a list result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_.:\-]{0,127}$").expect("identifier pattern is valid")
    })
}

/// Validate a resource type, action or attribute name.
///
/// Names start with a letter and contain letters, digits, `_`, `.`, `:` or `-`,
/// at most 128 characters.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(AuthzError::InvalidInput(format!(
            "{} '{}' is not a valid identifier",
            kind, value
        )))
    }
}

/// Reject empty or whitespace-only required text.
pub fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AuthzError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}
