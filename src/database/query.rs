//! Queries against live tables.
//!
//! Supports the statement shape needed to filter a single table:
//!
//! ```text
//! SELECT <* | col[, col...]> FROM <table>
//!     [WHERE <col> <op> <literal> [AND ...]] [LIMIT <n>] [;]
//! ```
//!
//! Operators are `=`, `==`, `!=`, `<>`, `<`, `<=`, `>`, `>=`. Literals are
//! integers, decimals, quoted strings (single or double quotes), `TRUE`,
//! `FALSE` and `NULL`. A literal may also stand on the left-hand side.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::value::{Row, Value, ValueType};

/// Errors returned to whoever issued a query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("cannot compare column '{column}' of type {expected} with {literal}")]
    TypeMismatch {
        column: String,
        expected: ValueType,
        literal: String,
    },
}

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Operator {
    /// Whether `ordering` of (column, literal) satisfies the operator.
    pub fn admits(&self, ordering: Ordering) -> bool {
        match self {
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::Less => ordering == Ordering::Less,
            Operator::LessEqual => ordering != Ordering::Greater,
            Operator::Greater => ordering == Ordering::Greater,
            Operator::GreaterEqual => ordering != Ordering::Less,
        }
    }

    /// Operator to use when the operands are swapped.
    fn mirrored(self) -> Self {
        match self {
            Operator::Less => Operator::Greater,
            Operator::LessEqual => Operator::GreaterEqual,
            Operator::Greater => Operator::Less,
            Operator::GreaterEqual => Operator::LessEqual,
            other => other,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Less => "<",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::GreaterEqual => ">=",
        }
    }
}

/// A `column <op> literal` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: Operator,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: Operator, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Evaluate against a cell. Null cells never match.
    pub fn matches(&self, cell: &Value) -> bool {
        cell.compare(&self.value)
            .map_or(false, |ordering| self.op.admits(ordering))
    }

    /// Literal operand if this is an equality on `column`.
    pub fn equality_on(&self, column: &str) -> Option<&Value> {
        (self.op == Operator::Equal && self.column == column).then_some(&self.value)
    }
}

/// A parsed query: one table, a projection, conjunctive predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    /// Projected columns; empty selects all columns.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    /// `SELECT * FROM table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            predicates: Vec::new(),
            limit: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Parse a statement.
    pub fn parse(statement: &str) -> Result<Self, QueryError> {
        let tokens = tokenize(statement)?;
        Parser { tokens, pos: 0 }.statement()
    }

    /// Whether `row` satisfies every predicate, given the column positions
    /// of each predicate in the row.
    pub(crate) fn admits(&self, row: &Row, positions: &[usize]) -> bool {
        self.predicates
            .iter()
            .zip(positions)
            .all(|(predicate, &idx)| row.get(idx).map_or(false, |cell| predicate.matches(cell)))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        write!(f, "SELECT {} FROM {}", columns, self.table)?;

        for (i, p) in self.predicates.iter().enumerate() {
            let keyword = if i == 0 { "WHERE" } else { "AND" };
            let literal = match &p.value {
                Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
                Value::Null => "NULL".to_string(),
                other => other.to_string(),
            };
            write!(f, " {} {} {} {}", keyword, p.column, p.op.symbol(), literal)?;
        }

        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Literal(Value),
    Op(Operator),
    Star,
    Comma,
    Semicolon,
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '=' => {
                i += if chars.get(i + 1) == Some(&'=') { 2 } else { 1 };
                tokens.push(Token::Op(Operator::Equal));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(Operator::NotEqual));
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op(Operator::LessEqual));
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Op(Operator::NotEqual));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(Operator::Less));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(Operator::GreaterEqual));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Operator::Greater));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(QueryError::Syntax("unterminated string literal".to_string())),
                        Some(&ch) if ch == quote => {
                            // A doubled quote is an escaped quote.
                            if chars.get(i + 1) == Some(&quote) {
                                text.push(quote);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::Text(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit() || *n == '.')) || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>().map(Value::Double).ok()
                } else {
                    text.parse::<i64>().map(Value::Integer).ok()
                };
                match value {
                    Some(v) => tokens.push(Token::Literal(v)),
                    None => return Err(QueryError::Syntax(format!("invalid number '{}'", text))),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "TRUE" => Token::Literal(Value::Bool(true)),
                    "FALSE" => Token::Literal(Value::Bool(false)),
                    "NULL" => Token::Literal(Value::Null),
                    _ => Token::Word(word),
                };
                tokens.push(token);
            }
            other => return Err(QueryError::Syntax(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn statement(mut self) -> Result<Query, QueryError> {
        self.keyword("SELECT")?;

        let mut columns = Vec::new();
        if self.peek() == Some(&Token::Star) {
            self.pos += 1;
        } else {
            loop {
                columns.push(self.identifier("column name")?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        self.keyword("FROM")?;
        let table = self.identifier("table name")?;

        let mut predicates = Vec::new();
        if self.at_keyword("WHERE") {
            self.pos += 1;
            loop {
                predicates.push(self.predicate()?);
                if self.at_keyword("AND") {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let mut limit = None;
        if self.at_keyword("LIMIT") {
            self.pos += 1;
            limit = match self.next() {
                Some(Token::Literal(Value::Integer(n))) if n >= 0 => Some(n as usize),
                _ => return Err(QueryError::Syntax("LIMIT expects a non-negative integer".to_string())),
            };
        }

        if self.peek() == Some(&Token::Semicolon) {
            self.pos += 1;
        }
        if let Some(token) = self.peek() {
            return Err(QueryError::Syntax(format!("unexpected trailing input near {:?}", token)));
        }

        Ok(Query {
            table,
            columns,
            predicates,
            limit,
        })
    }

    fn predicate(&mut self) -> Result<Predicate, QueryError> {
        let lhs = self.next();
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(QueryError::Syntax("expected comparison operator".to_string())),
        };
        let rhs = self.next();

        match (lhs, rhs) {
            (Some(Token::Word(column)), Some(Token::Literal(value))) => Ok(Predicate::new(column, op, value)),
            (Some(Token::Literal(value)), Some(Token::Word(column))) => Ok(Predicate::new(column, op.mirrored(), value)),
            _ => Err(QueryError::Syntax(
                "predicates must compare a column with a literal".to_string(),
            )),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), QueryError> {
        if self.at_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(QueryError::Syntax(format!("expected {}", keyword)))
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String, QueryError> {
        match self.next() {
            Some(Token::Word(w)) if !is_reserved(&w) => Ok(w),
            _ => Err(QueryError::Syntax(format!("expected {}", what))),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    ["SELECT", "FROM", "WHERE", "AND", "LIMIT"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_full_statement() {
        let q = Query::parse("SELECT pid, name FROM processes WHERE name = \"agent\" AND pid >= 10 LIMIT 5;").unwrap();
        assert_eq!(q.table, "processes");
        assert_eq!(q.columns, vec!["pid", "name"]);
        assert_eq!(
            q.predicates,
            vec![
                Predicate::new("name", Operator::Equal, Value::Text("agent".into())),
                Predicate::new("pid", Operator::GreaterEqual, Value::Integer(10)),
            ]
        );
        assert_eq!(q.limit, Some(5));
    }

    #[test]
    fn star_and_case_insensitive_keywords() {
        let q = Query::parse("select * from sockets where local_port <> 22").unwrap();
        assert!(q.columns.is_empty());
        assert_eq!(q.predicates[0].op, Operator::NotEqual);
    }

    #[test]
    fn literal_on_the_left_is_mirrored() {
        let q = Query::parse("SELECT * FROM t WHERE 5 < x").unwrap();
        assert_eq!(q.predicates[0], Predicate::new("x", Operator::Greater, Value::Integer(5)));
    }

    #[test]
    fn negative_and_decimal_literals() {
        let q = Query::parse("SELECT * FROM t WHERE a > -3 AND b <= 1.5 AND c = 'it''s'").unwrap();
        assert_eq!(q.predicates[0].value, Value::Integer(-3));
        assert_eq!(q.predicates[1].value, Value::Double(1.5));
        assert_eq!(q.predicates[2].value, Value::Text("it's".into()));
    }

    #[test]
    fn rejects_malformed_statements() {
        for bad in [
            "",
            "SELECT FROM t",
            "SELECT * t",
            "SELECT * FROM t WHERE",
            "SELECT * FROM t WHERE a = b",
            "SELECT * FROM t WHERE a ~ 1",
            "SELECT * FROM t LIMIT -1",
            "SELECT * FROM t extra",
            "SELECT * FROM t WHERE a = 'open",
        ] {
            assert!(matches!(Query::parse(bad), Err(QueryError::Syntax(_))), "accepted: {}", bad);
        }
    }

    #[test]
    fn display_reparses() {
        let q = Query::table("processes")
            .select(["pid"])
            .filter(Predicate::new("name", Operator::Equal, Value::Text("o'neil".into())));
        assert_eq!(Query::parse(&q.to_string()).unwrap(), q);
    }

    #[test]
    fn operators_admit_orderings() {
        assert!(Operator::LessEqual.admits(Ordering::Equal));
        assert!(!Operator::Less.admits(Ordering::Equal));
        assert!(Operator::NotEqual.admits(Ordering::Greater));
        assert!(!Predicate::new("x", Operator::NotEqual, Value::Integer(1)).matches(&Value::Null));
    }
}
