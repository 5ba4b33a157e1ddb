//! Abstract syntax tree for condition expressions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute bag an attribute path starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Root {
    Subject,
    Resource,
    Request,
}

impl Root {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "subject" => Some(Self::Subject),
            "resource" => Some(Self::Resource),
            "request" => Some(Self::Request),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Resource => "resource",
            Self::Request => "request",
        }
    }
}

/// Literal value in an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
}

/// Binary comparison and membership operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    In,
    Contains,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::In => "in",
            Self::Contains => "contains",
        };
        f.write_str(symbol)
    }
}

/// A condition expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Literal,
    },
    Path {
        root: Root,
        segments: Vec<String>,
    },
    List {
        items: Vec<Expr>,
    },
    /// Boolean negation of the operand's result.
    ///
    /// A comparison over an undefined attribute is `false`, so its negation is
    /// `true`: `!(resource.owner == 'x')` holds when `owner` is missing. Write
    /// `resource.owner != 'x'` to require the attribute to be present.
    Not {
        operand: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Nesting levels of the node in its serialized form.
    ///
    /// Every node is one object; literals and paths add one level for their
    /// payload and lists one for the item array.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Literal { .. } | Expr::Path { .. } => 2,
            Expr::List { items } => 2 + items.iter().map(Expr::depth).max().unwrap_or(0),
            Expr::Not { operand } => 1 + operand.depth(),
            Expr::And { left, right } | Expr::Or { left, right } | Expr::Compare { left, right, .. } => {
                1 + left.depth().max(right.depth())
            }
        }
    }
}
