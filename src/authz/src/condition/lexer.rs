//! Lexer for condition expressions.
//!
//! Converts the input string into a stream of positioned tokens.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use super::error::{ConditionError, Result};

/// A token in a condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    StringLiteral(String),
    NumberLiteral(f64),
    True,
    False,
    In,
    Contains,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    Not,
    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "identifier '{s}'"),
            Token::StringLiteral(s) => write!(f, "string '{s}'"),
            Token::NumberLiteral(n) => write!(f, "number {n}"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::In => write!(f, "in"),
            Token::Contains => write!(f, "contains"),
            Token::Equal => write!(f, "=="),
            Token::NotEqual => write!(f, "!="),
            Token::LessThan => write!(f, "<"),
            Token::LessThanOrEqual => write!(f, "<="),
            Token::GreaterThan => write!(f, ">"),
            Token::GreaterThanOrEqual => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::LeftBracket => write!(f, "["),
            Token::RightBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// A token with the byte offset it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Lexer for tokenizing condition expressions.
pub struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given input.
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    /// Get all tokens from the input, terminated by `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Spanned> {
        self.skip_whitespace();

        let Some(&(position, ch)) = self.chars.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: self.input.len(),
            });
        };

        let token = match ch {
            '(' => self.single(Token::LeftParen),
            ')' => self.single(Token::RightParen),
            '[' => self.single(Token::LeftBracket),
            ']' => self.single(Token::RightBracket),
            ',' => self.single(Token::Comma),
            '.' => self.single(Token::Dot),
            '=' => self.pair('=', Token::Equal, None, position)?,
            '!' => self.pair('=', Token::NotEqual, Some(Token::Not), position)?,
            '<' => self.pair('=', Token::LessThanOrEqual, Some(Token::LessThan), position)?,
            '>' => self.pair('=', Token::GreaterThanOrEqual, Some(Token::GreaterThan), position)?,
            '&' => self.pair('&', Token::And, None, position)?,
            '|' => self.pair('|', Token::Or, None, position)?,
            '\'' | '"' => self.read_string(position)?,
            c if c.is_ascii_digit() => self.read_number(position)?,
            '-' => {
                if self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                    self.read_number(position)?
                } else {
                    return Err(ConditionError::syntax("unexpected character '-'", position));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => self.read_identifier(),
            other => {
                return Err(ConditionError::syntax(
                    format!("unexpected character '{other}'"),
                    position,
                ))
            }
        };

        Ok(Spanned { token, position })
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    /// Two-character operator, or a one-character fallback when allowed.
    fn pair(
        &mut self,
        second: char,
        matched: Token,
        fallback: Option<Token>,
        position: usize,
    ) -> Result<Token> {
        let first = self.chars.next().map(|(_, c)| c).unwrap_or_default();
        if self.chars.peek().map(|&(_, c)| c) == Some(second) {
            self.chars.next();
            return Ok(matched);
        }
        fallback.ok_or_else(|| {
            ConditionError::syntax(format!("expected '{first}{second}'"), position)
        })
    }

    fn peek_second(&self) -> Option<char> {
        let mut lookahead = self.chars.clone();
        lookahead.next();
        lookahead.next().map(|(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, start: usize) -> Result<Token> {
        let Some((_, quote)) = self.chars.next() else {
            return Err(ConditionError::syntax("unterminated string literal", start));
        };
        let mut value = String::new();

        loop {
            match self.chars.next() {
                Some((_, ch)) if ch == quote => break,
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '\'')) => value.push('\''),
                    Some((_, '"')) => value.push('"'),
                    Some((pos, other)) => {
                        return Err(ConditionError::syntax(
                            format!("unknown escape '\\{other}'"),
                            pos,
                        ))
                    }
                    None => {
                        return Err(ConditionError::syntax("unterminated string literal", start))
                    }
                },
                Some((_, ch)) => value.push(ch),
                None => return Err(ConditionError::syntax("unterminated string literal", start)),
            }
        }

        Ok(Token::StringLiteral(value))
    }

    fn read_number(&mut self, start: usize) -> Result<Token> {
        let mut end = start;
        let mut seen_dot = false;

        if let Some(&(pos, '-')) = self.chars.peek() {
            self.chars.next();
            end = pos + 1;
        }

        while let Some(&(pos, ch)) = self.chars.peek() {
            if ch.is_ascii_digit() {
                self.chars.next();
                end = pos + 1;
            } else if ch == '.' && !seen_dot && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                seen_dot = true;
                self.chars.next();
                end = pos + 1;
            } else {
                break;
            }
        }

        self.input[start..end]
            .parse::<f64>()
            .map(Token::NumberLiteral)
            .map_err(|_| ConditionError::syntax("invalid number", start))
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.chars.next();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "in" => Token::In,
            "contains" => Token::Contains,
            _ => Token::Identifier(ident),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_path_and_comparison() {
        assert_eq!(
            tokens("resource.ownerId == subject.id"),
            vec![
                Token::Identifier("resource".into()),
                Token::Dot,
                Token::Identifier("ownerId".into()),
                Token::Equal,
                Token::Identifier("subject".into()),
                Token::Dot,
                Token::Identifier("id".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens("! != < <= > >= && ||"),
            vec![
                Token::Not,
                Token::NotEqual,
                Token::LessThan,
                Token::LessThanOrEqual,
                Token::GreaterThan,
                Token::GreaterThanOrEqual,
                Token::And,
                Token::Or,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            tokens(r#"'it\'s' "x" 42 -3.5 true false in contains"#),
            vec![
                Token::StringLiteral("it's".into()),
                Token::StringLiteral("x".into()),
                Token::NumberLiteral(42.0),
                Token::NumberLiteral(-3.5),
                Token::True,
                Token::False,
                Token::In,
                Token::Contains,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_positions() {
        let spanned = Lexer::new("a  == 'b'").tokenize().unwrap();
        assert_eq!(spanned[0].position, 0);
        assert_eq!(spanned[1].position, 3);
        assert_eq!(spanned[2].position, 6);
    }

    #[test]
    fn test_errors() {
        assert!(Lexer::new("a = b").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a @ b").tokenize().is_err());
        assert!(Lexer::new("- a").tokenize().is_err());
    }
}
