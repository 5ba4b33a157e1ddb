//! Recursive descent parser for condition expressions.
//!
//! Precedence, loosest first: `||`, `&&`, `!`, comparison. Comparisons do not
//! chain; `a == b == c` is a syntax error.
//!
//! Runs of the same connective build a balanced tree, so a long `&&` chain
//! stays shallow. Operands keep their left-to-right evaluation order.

use super::ast::{CompareOp, Expr, Literal, Root};
use super::error::{ConditionError, Result};
use super::lexer::{Lexer, Spanned, Token};
use super::{MAX_EXPRESSION_LEN, MAX_NESTING_DEPTH, MAX_TREE_DEPTH};

/// Parser for condition expressions.
pub struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
}

impl Parser {
    /// Parse an expression string into its syntax tree.
    pub fn parse(input: &str) -> Result<Expr> {
        if input.len() > MAX_EXPRESSION_LEN {
            return Err(ConditionError::TooLong(MAX_EXPRESSION_LEN));
        }
        if input.trim().is_empty() {
            return Err(ConditionError::Empty);
        }

        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Parser {
            tokens,
            position: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;

        if !parser.check(&Token::Eof) {
            return Err(ConditionError::syntax(
                format!("unexpected {} after expression", parser.current()),
                parser.current_position(),
            ));
        }

        if expr.depth() > MAX_TREE_DEPTH {
            return Err(ConditionError::TooDeep(MAX_TREE_DEPTH));
        }

        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let first = self.parse_and()?;
        let mut rest = Vec::new();
        while self.match_token(&Token::Or) {
            rest.push(self.parse_and()?);
        }
        Ok(balanced(first, rest, |left, right| Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        }))
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let first = self.parse_unary()?;
        let mut rest = Vec::new();
        while self.match_token(&Token::And) {
            rest.push(self.parse_unary()?);
        }
        Ok(balanced(first, rest, |left, right| Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        }))
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.match_token(&Token::Not) {
            self.enter()?;
            let operand = self.parse_unary()?;
            self.leave();
            return Ok(Expr::Not {
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;

        let Some(op) = self.comparison_operator() else {
            return Ok(left);
        };
        self.advance();

        let right = self.parse_operand()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn comparison_operator(&self) -> Option<CompareOp> {
        match self.current() {
            Token::Equal => Some(CompareOp::Equal),
            Token::NotEqual => Some(CompareOp::NotEqual),
            Token::LessThan => Some(CompareOp::LessThan),
            Token::LessThanOrEqual => Some(CompareOp::LessThanOrEqual),
            Token::GreaterThan => Some(CompareOp::GreaterThan),
            Token::GreaterThanOrEqual => Some(CompareOp::GreaterThanOrEqual),
            Token::In => Some(CompareOp::In),
            Token::Contains => Some(CompareOp::Contains),
            _ => None,
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        let position = self.current_position();
        match self.advance() {
            Token::LeftParen => {
                self.enter()?;
                let expr = self.parse_or()?;
                self.expect(&Token::RightParen)?;
                self.leave();
                Ok(expr)
            }
            Token::LeftBracket => {
                self.enter()?;
                let items = self.parse_list_items()?;
                self.leave();
                Ok(Expr::List { items })
            }
            Token::StringLiteral(s) => Ok(Expr::Literal {
                value: Literal::String(s),
            }),
            Token::NumberLiteral(n) => Ok(Expr::Literal {
                value: Literal::Number(n),
            }),
            Token::True => Ok(Expr::Literal {
                value: Literal::Bool(true),
            }),
            Token::False => Ok(Expr::Literal {
                value: Literal::Bool(false),
            }),
            Token::Identifier(name) => self.parse_path(name, position),
            other => Err(ConditionError::syntax(
                format!("expected a value, found {other}"),
                position,
            )),
        }
    }

    fn parse_path(&mut self, root_name: String, position: usize) -> Result<Expr> {
        let root = Root::parse(&root_name).ok_or(ConditionError::UnknownRoot(root_name))?;
        let mut segments = Vec::new();

        while self.match_token(&Token::Dot) {
            let segment_position = self.current_position();
            let segment = match self.advance() {
                Token::Identifier(name) => name,
                // Keywords are valid attribute names after a dot
                Token::In => "in".to_string(),
                Token::Contains => "contains".to_string(),
                Token::True => "true".to_string(),
                Token::False => "false".to_string(),
                other => {
                    return Err(ConditionError::syntax(
                        format!("expected attribute name after '.', found {other}"),
                        segment_position,
                    ))
                }
            };
            segments.push(segment);
        }

        if segments.is_empty() && self.check(&Token::LeftParen) {
            return Err(ConditionError::syntax(
                "function calls are not supported",
                position,
            ));
        }

        Ok(Expr::Path { root, segments })
    }

    fn parse_list_items(&mut self) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.match_token(&Token::RightBracket) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_operand()?);
            if self.match_token(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RightBracket)?;
            return Ok(items);
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ConditionError::TooDeep(MAX_NESTING_DEPTH));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        if self.check(expected) {
            self.advance();
            Ok(())
        } else {
            Err(ConditionError::syntax(
                format!("expected {expected}, found {}", self.current()),
                self.current_position(),
            ))
        }
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    fn current(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn current_position(&self) -> usize {
        self.tokens
            .get(self.position)
            .map(|s| s.position)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }
}

/// Join operands pairwise, level by level, keeping their order
fn balanced(first: Expr, rest: Vec<Expr>, join: fn(Expr, Expr) -> Expr) -> Expr {
    let mut head = first;
    let mut tail = rest;
    while !tail.is_empty() {
        let mut items = tail.into_iter();
        if let Some(right) = items.next() {
            head = join(head, right);
        }
        let mut next = Vec::new();
        while let Some(left) = items.next() {
            next.push(match items.next() {
                Some(right) => join(left, right),
                None => left,
            });
        }
        tail = next;
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(root: Root, segments: &[&str]) -> Expr {
        Expr::Path {
            root,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_simple_comparison() {
        let expr = Parser::parse("resource.ownerId == subject.id").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                op: CompareOp::Equal,
                left: Box::new(path(Root::Resource, &["ownerId"])),
                right: Box::new(path(Root::Subject, &["id"])),
            }
        );
    }

    #[test]
    fn test_precedence() {
        // && binds tighter than ||
        let expr = Parser::parse("subject.a == 1 || subject.b == 2 && subject.c == 3").unwrap();
        match expr {
            Expr::Or { right, .. } => assert!(matches!(*right, Expr::And { .. })),
            other => panic!("expected Or at the root, got {other:?}"),
        }
    }

    #[test]
    fn test_not_and_grouping() {
        let expr = Parser::parse("!(subject.suspended == true)").unwrap();
        match expr {
            Expr::Not { operand } => assert!(matches!(*operand, Expr::Compare { .. })),
            other => panic!("expected Not, got {other:?}"),
        }
    }

    #[test]
    fn test_membership_and_lists() {
        let expr = Parser::parse("subject.role in ['admin', 'owner']").unwrap();
        match expr {
            Expr::Compare { op, right, .. } => {
                assert_eq!(op, CompareOp::In);
                assert!(matches!(*right, Expr::List { ref items } if items.len() == 2));
            }
            other => panic!("expected Compare, got {other:?}"),
        }

        let expr = Parser::parse("resource.tags contains 'public'").unwrap();
        assert!(matches!(expr, Expr::Compare { op: CompareOp::Contains, .. }));

        assert!(Parser::parse("subject.x in []").is_ok());
    }

    #[test]
    fn test_bare_literals_and_paths() {
        assert_eq!(
            Parser::parse("true").unwrap(),
            Expr::Literal { value: Literal::Bool(true) }
        );
        assert_eq!(Parser::parse("subject.active").unwrap(), path(Root::Subject, &["active"]));
        assert_eq!(Parser::parse("request.in").unwrap(), path(Root::Request, &["in"]));
    }

    #[test]
    fn test_long_chains_stay_shallow() {
        let chain = vec!["subject.a == 1"; 140].join(" && ");
        let expr = Parser::parse(&chain).unwrap();
        // Balanced: eight connective levels over a comparison of a path
        assert_eq!(expr.depth(), 8 + 3);

        let mixed = vec!["subject.a == 1 && subject.b == 2"; 100].join(" || ");
        assert!(Parser::parse(&mixed).unwrap().depth() <= 7 + 2 + 3);
    }

    #[test]
    fn test_chains_keep_operand_order() {
        fn collect(expr: &Expr, out: &mut Vec<String>) {
            match expr {
                Expr::And { left, right } => {
                    collect(left, out);
                    collect(right, out);
                }
                Expr::Path { segments, .. } => out.push(segments.join(".")),
                other => panic!("unexpected node {other:?}"),
            }
        }
        let expr = Parser::parse("subject.a && subject.b && subject.c && subject.d && subject.e")
            .unwrap();
        let mut leaves = Vec::new();
        collect(&expr, &mut leaves);
        assert_eq!(leaves, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(Parser::parse(""), Err(ConditionError::Empty)));
        assert!(matches!(
            Parser::parse("user.id == 'x'"),
            Err(ConditionError::UnknownRoot(_))
        ));
        assert!(Parser::parse("subject.id ==").is_err());
        assert!(Parser::parse("subject.id == 'a' == 'b'").is_err());
        assert!(Parser::parse("(subject.id == 'a'").is_err());
        assert!(Parser::parse("subject. == 'a'").is_err());
        assert!(Parser::parse("subject.id 'a'").is_err());
        assert!(Parser::parse("subject('a')").is_err());
        assert!(Parser::parse("[1, 2").is_err());
    }

    #[test]
    fn test_limits() {
        let long = format!("subject.id == '{}'", "x".repeat(MAX_EXPRESSION_LEN));
        assert!(matches!(Parser::parse(&long), Err(ConditionError::TooLong(_))));

        let deep = format!("{}true", "!".repeat(MAX_NESTING_DEPTH + 1));
        assert!(matches!(Parser::parse(&deep), Err(ConditionError::TooDeep(_))));

        let ok = format!("{}true", "!".repeat(MAX_NESTING_DEPTH));
        assert!(Parser::parse(&ok).is_ok());

        // Nested lists stay under the parser nesting limit but not the tree limit
        let lists = format!(
            "subject.x in {}1{}",
            "[".repeat(MAX_NESTING_DEPTH),
            "]".repeat(MAX_NESTING_DEPTH)
        );
        assert!(matches!(
            Parser::parse(&lists),
            Err(ConditionError::TooDeep(MAX_TREE_DEPTH))
        ));
    }
}
