//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthzError {
    /// Policy, namespace or definition missing by ID
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stale version on update, or a uniqueness violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Condition expression failed to compile
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// App or environment identifier missing
    #[error("Scope required: {0}")]
    ScopeRequired(String),

    /// Transient store or cache infrastructure failure
    #[error("Repository unavailable: {0}")]
    RepositoryUnavailable(String),

    /// A bounded store call ran out of time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid input at the administrative boundary
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A single candidate failed to evaluate
    #[error("Policy evaluation failed: {0}")]
    Evaluation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthzError {
    /// Whether a higher layer could reasonably retry the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {}", e))
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
