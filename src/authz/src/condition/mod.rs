//! Condition language for policy expressions
//!
//! A narrow boolean grammar over attribute paths: comparisons, `&&`, `||`,
//! `!`, and membership (`in` / `contains`). Expressions compile once into a
//! [`Program`] and evaluate against an [`EvalContext`] holding the
//! `subject`, `resource` and `request` attribute bags.
//!
//! Missing attributes evaluate to [`AttrValue::Undefined`], which makes any
//! comparison `false` instead of raising an error. Negation is applied to that
//! `false` like any other result, so `!(resource.owner == 'x')` is `true` for a
//! resource without an owner.

pub mod ast;
pub mod compiler;
pub mod context;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::{CompareOp, Expr, Literal, Root};
pub use compiler::{CompilerStats, ConditionCompiler, Program};
pub use context::EvalContext;
pub use error::{ConditionError, Result};
pub use value::{AttrValue, Attributes};

/// Longest accepted expression, in bytes
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// Deepest accepted nesting of unary, grouping and list constructs
pub const MAX_NESTING_DEPTH: usize = 64;

/// Deepest accepted syntax tree, counted as [`Expr::depth`].
///
/// Keeps every accepted program, wrapped in a cached policy set, inside the
/// JSON decoder's recursion limit of 128.
pub const MAX_TREE_DEPTH: usize = 100;
