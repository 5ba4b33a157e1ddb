//! Condition compiler with compiled program memoization

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ast::{CompareOp, Expr, Literal};
use super::context::EvalContext;
use super::error::{ConditionError, Result};
use super::parser::Parser;
use super::value::AttrValue;

/// Memoized programs kept before the memo is reset
const DEFAULT_MEMO_CAPACITY: usize = 10_000;

/// A compiled, evaluable condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    source: String,
    root: Expr,
}

impl Program {
    /// Parse an expression into a program.
    pub fn compile(source: &str) -> Result<Self> {
        let root = Parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluate against a context.
    ///
    /// Fails only when a value used in boolean position is neither a boolean
    /// nor undefined.
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<bool> {
        eval_bool(&self.root, ctx)
    }
}

fn eval_bool(expr: &Expr, ctx: &EvalContext) -> Result<bool> {
    match expr {
        Expr::And { left, right } => Ok(eval_bool(left, ctx)? && eval_bool(right, ctx)?),
        Expr::Or { left, right } => Ok(eval_bool(left, ctx)? || eval_bool(right, ctx)?),
        // Negates whatever the operand produced, including the `false` of a
        // comparison over an undefined attribute
        Expr::Not { operand } => Ok(!eval_bool(operand, ctx)?),
        Expr::Compare { op, left, right } => {
            let left = eval_value(left, ctx)?;
            let right = eval_value(right, ctx)?;
            Ok(compare(*op, &left, &right))
        }
        other => match eval_value(other, ctx)? {
            AttrValue::Bool(b) => Ok(b),
            AttrValue::Undefined => Ok(false),
            value => Err(ConditionError::NonBoolean(value.type_name())),
        },
    }
}

fn eval_value(expr: &Expr, ctx: &EvalContext) -> Result<AttrValue> {
    match expr {
        Expr::Literal { value } => Ok(match value {
            Literal::String(s) => AttrValue::String(s.clone()),
            Literal::Number(n) => AttrValue::Number(*n),
            Literal::Bool(b) => AttrValue::Bool(*b),
        }),
        Expr::Path { root, segments } => Ok(ctx.resolve(*root, segments)),
        Expr::List { items } => items
            .iter()
            .map(|item| eval_value(item, ctx))
            .collect::<Result<Vec<_>>>()
            .map(AttrValue::List),
        boolean => eval_bool(boolean, ctx).map(AttrValue::Bool),
    }
}

fn compare(op: CompareOp, left: &AttrValue, right: &AttrValue) -> bool {
    if left.is_undefined() || right.is_undefined() {
        return false;
    }

    match op {
        CompareOp::Equal => left.loosely_equals(right),
        CompareOp::NotEqual => !left.loosely_equals(right),
        CompareOp::LessThan => left.partial_order(right) == Some(Ordering::Less),
        CompareOp::LessThanOrEqual => matches!(
            left.partial_order(right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::GreaterThan => left.partial_order(right) == Some(Ordering::Greater),
        CompareOp::GreaterThanOrEqual => matches!(
            left.partial_order(right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::In => right.has_member(left),
        CompareOp::Contains => left.has_member(right),
    }
}

/// Compiles expressions once and shares the programs
pub struct ConditionCompiler {
    /// Compiled program memo keyed by expression text
    program_cache: DashMap<String, Arc<Program>>,
    memo_capacity: usize,
}

impl ConditionCompiler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMO_CAPACITY)
    }

    pub fn with_capacity(memo_capacity: usize) -> Self {
        Self {
            program_cache: DashMap::new(),
            memo_capacity: memo_capacity.max(1),
        }
    }

    /// Compile an expression, reusing an earlier compilation of the same text.
    pub fn compile(&self, expr: &str) -> Result<Arc<Program>> {
        if let Some(program) = self.program_cache.get(expr) {
            return Ok(program.clone());
        }

        let program = Arc::new(Program::compile(expr)?);

        if self.program_cache.len() >= self.memo_capacity {
            debug!(size = self.program_cache.len(), "Resetting condition program memo");
            self.program_cache.clear();
        }
        self.program_cache.insert(expr.to_string(), program.clone());

        Ok(program)
    }

    /// Check that an expression compiles without memoizing it.
    pub fn validate(expr: &str) -> Result<()> {
        Parser::parse(expr).map(|_| ())
    }

    pub fn clear_cache(&self) {
        self.program_cache.clear();
    }

    pub fn stats(&self) -> CompilerStats {
        CompilerStats {
            memoized_programs: self.program_cache.len(),
        }
    }
}

impl Default for ConditionCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiler memo statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerStats {
    pub memoized_programs: usize,
}
