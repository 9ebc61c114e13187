//! Context and label expressions used to select which changesets a run applies.
//!
//! Both use the same small boolean grammar over identifiers:
//!
//! ```text
//! expr  := and (("," | "or") and)*
//! and   := unary ("and" unary)*
//! unary := ("!" | "not") unary | "(" expr ")" | identifier
//! ```
//!
//! Matching is case-insensitive.
//!
//! - A changeset's `context` attribute is an expression evaluated against the run's [Contexts].
//! - A run's [LabelExpression] is evaluated against a changeset's `labels` set.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::Error;

/// A parsed boolean expression over identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Identifier(String),
    Not(Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
}

impl Expression {
    /// Parse an expression. Returns `Ok(None)` for an empty or blank input.
    pub fn parse(input: &str) -> Result<Option<Expression>, Error> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(None);
        }
        let mut parser = ExpressionParser {
            tokens: &tokens,
            position: 0,
            input,
        };
        let expression = parser.or()?;
        if parser.position != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Some(expression))
    }

    /// Evaluate against a set of lowercase identifiers.
    pub fn matches(&self, values: &BTreeSet<String>) -> bool {
        match self {
            Expression::Identifier(name) => values.contains(name),
            Expression::Not(inner) => !inner.matches(values),
            Expression::And(parts) => parts.iter().all(|p| p.matches(values)),
            Expression::Or(parts) => parts.iter().any(|p| p.matches(values)),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Identifier(name) => write!(f, "{}", name),
            Expression::Not(inner) => match inner.as_ref() {
                Expression::Identifier(_) => write!(f, "!{}", inner),
                _ => write!(f, "!({})", inner),
            },
            Expression::And(parts) => write_joined(f, parts, " and "),
            Expression::Or(parts) => write_joined(f, parts, ", "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Expression], separator: &str) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        match part {
            Expression::And(_) | Expression::Or(_) => write!(f, "({})", part)?,
            _ => write!(f, "{}", part)?,
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ',' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, ',' | '!' | '(' | ')') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                let lower = word.to_lowercase();
                tokens.push(match lower.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(lower),
                });
            }
        }
    }
    Ok(tokens)
}

struct ExpressionParser<'a> {
    tokens: &'a [Token],
    position: usize,
    input: &'a str,
}

impl ExpressionParser<'_> {
    fn error(&self, message: &str) -> Error {
        Error::parse(
            format!("expression '{}'", self.input),
            format!("{} at token {}", message, self.position),
        )
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn or(&mut self) -> Result<Expression, Error> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.position += 1;
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expression::Or(parts)
        })
    }

    fn and(&mut self) -> Result<Expression, Error> {
        let mut parts = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.position += 1;
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expression::And(parts)
        })
    }

    fn unary(&mut self) -> Result<Expression, Error> {
        match self.peek().cloned() {
            Some(Token::Not) => {
                self.position += 1;
                Ok(Expression::Not(Box::new(self.unary()?)))
            }
            Some(Token::Open) => {
                self.position += 1;
                let inner = self.or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.error("expected ')'"));
                }
                self.position += 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.position += 1;
                Ok(Expression::Identifier(name))
            }
            _ => Err(self.error("expected identifier")),
        }
    }
}

/// Split a comma-separated list into a lowercase set, ignoring blanks.
pub(crate) fn split_list(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The contexts a run is executing under. Empty means "all contexts".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contexts(BTreeSet<String>);

impl Contexts {
    pub fn parse(input: &str) -> Self {
        Self(split_list(input))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a changeset with the given context expression should run.
    /// Changesets without an expression always run, as do all changesets when no contexts are set.
    pub fn allows(&self, change_set_context: Option<&Expression>) -> bool {
        match change_set_context {
            _ if self.0.is_empty() => true,
            None => true,
            Some(expression) => expression.matches(&self.0),
        }
    }
}

impl fmt::Display for Contexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().cloned().collect::<Vec<_>>().join(", ");
        f.write_str(&joined)
    }
}

/// The label expression a run filters with. `None` inside means "all labels".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelExpression(Option<Expression>);

impl LabelExpression {
    pub fn parse(input: &str) -> Result<Self, Error> {
        Ok(Self(Expression::parse(input)?))
    }

    /// Whether a changeset carrying `labels` should run.
    /// Unlabelled changesets always run, as do all changesets when no expression is set.
    pub fn allows(&self, labels: &BTreeSet<String>) -> bool {
        match &self.0 {
            None => true,
            Some(_) if labels.is_empty() => true,
            Some(expression) => expression.matches(labels),
        }
    }
}

impl fmt::Display for LabelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(expression) => write!(f, "{}", expression),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn expr(input: &str) -> Expression {
        Expression::parse(input).unwrap().unwrap()
    }

    #[test]
    fn comma_means_or() {
        let e = expr("dev, test");
        assert!(e.matches(&set(&["test"])));
        assert!(!e.matches(&set(&["prod"])));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let e = expr("a and b or c");
        assert!(e.matches(&set(&["c"])));
        assert!(e.matches(&set(&["a", "b"])));
        assert!(!e.matches(&set(&["a"])));
    }

    #[test]
    fn negation_and_parentheses() {
        let e = expr("!prod and (dev or test)");
        assert!(e.matches(&set(&["dev"])));
        assert!(!e.matches(&set(&["dev", "prod"])));
        assert!(!e.matches(&set(&[])));
        let e = expr("not prod");
        assert!(e.matches(&set(&["dev"])));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let e = expr("Dev");
        assert!(Contexts::parse("DEV").allows(Some(&e)));
    }

    #[test]
    fn blank_expression_parses_to_none() {
        assert_eq!(Expression::parse("  ").unwrap(), None);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(matches!(Expression::parse("(a"), Err(Error::Parse { .. })));
        assert!(matches!(Expression::parse("a and"), Err(Error::Parse { .. })));
        assert!(matches!(Expression::parse("a b"), Err(Error::Parse { .. })));
    }

    #[test]
    fn empty_contexts_allow_everything() {
        let e = expr("prod");
        assert!(Contexts::default().allows(Some(&e)));
        assert!(Contexts::parse("dev").allows(None));
        assert!(!Contexts::parse("dev").allows(Some(&e)));
    }

    #[test]
    fn label_expression_against_changeset_labels() {
        let labels = LabelExpression::parse("v1 and !experimental").unwrap();
        assert!(labels.allows(&set(&["v1"])));
        assert!(!labels.allows(&set(&["v1", "experimental"])));
        assert!(!labels.allows(&set(&["v2"])));
        // unlabelled changesets are never filtered out
        assert!(labels.allows(&set(&[])));
        assert!(LabelExpression::default().allows(&set(&["anything"])));
    }

    #[test]
    fn display_round_trips_structure() {
        assert_eq!(expr("a and b, !c").to_string(), "(a and b), !c");
    }
}
