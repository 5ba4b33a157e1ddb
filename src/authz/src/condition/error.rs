//! Error types for condition compilation and evaluation

use thiserror::Error;

use crate::error::AuthzError;

/// Condition language errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("{message} at position {position}")]
    Syntax { message: String, position: usize },

    #[error("unknown attribute root '{0}', expected subject, resource or request")]
    UnknownRoot(String),

    #[error("expression exceeds {0} bytes")]
    TooLong(usize),

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("expression is empty")]
    Empty,

    #[error("expected a boolean, found {0}")]
    NonBoolean(&'static str),
}

impl ConditionError {
    pub(crate) fn syntax(message: impl Into<String>, position: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
        }
    }

    /// Whether the error belongs to compilation rather than evaluation
    pub fn is_compile_error(&self) -> bool {
        !matches!(self, Self::NonBoolean(_))
    }
}

impl From<ConditionError> for AuthzError {
    fn from(err: ConditionError) -> Self {
        if err.is_compile_error() {
            AuthzError::InvalidExpression(err.to_string())
        } else {
            AuthzError::Evaluation(err.to_string())
        }
    }
}

/// Result type for condition operations
pub type Result<T> = std::result::Result<T, ConditionError>;
