//! Invariant expressions for declarative rules.
//!
//! A small path-expression language evaluated against a record:
//!
//! ```text
//! expr    := or ('implies' or)?
//! or      := and ('or' and)*
//! and     := compare ('and' compare)*
//! compare := term (('=' | '!=') term)?
//! term    := path ('.' func '()')? | 'string' | number | true | false | '(' expr ')'
//! func    := exists | empty | not | count
//! ```
//!
//! Paths resolve with [`select`](crate::core::record::select), so arrays are
//! flattened along the way.

use crate::core::record::select;
use serde_json::Value;
use thiserror::Error;

/// Errors parsing an expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unknown function '{0}()'")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Call(String, String),
    Str(String),
    Num(f64),
    Bool(bool),
    And,
    Or,
    Implies,
    Eq,
    Ne,
    Open,
    Close,
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '\'' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '\'')
                    .ok_or(ExpressionError::UnterminatedString)?;
                tokens.push(Token::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse()
                    .map_err(|_| ExpressionError::UnexpectedToken(literal.clone()))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.' | '[' | ']'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let is_call = chars.get(i) == Some(&'(') && chars.get(i + 1) == Some(&')');

                if is_call {
                    i += 2;
                    let (path, func) = match word.rfind('.') {
                        Some(dot) => (word[..dot].to_string(), word[dot + 1..].to_string()),
                        None => (String::new(), word),
                    };
                    tokens.push(Token::Call(path, func));
                } else {
                    tokens.push(match word.as_str() {
                        "and" => Token::And,
                        "or" => Token::Or,
                        "implies" => Token::Implies,
                        "true" => Token::Bool(true),
                        "false" => Token::Bool(false),
                        _ => Token::Path(word),
                    });
                }
            }
            other => return Err(ExpressionError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

/// Function applied to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Exists,
    Empty,
    Not,
    Count,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(String),
    Call(String, Func),
    Literal(Value),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Implies(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>, bool),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.or()?;
        if self.peek() == Some(&Token::Implies) {
            self.pos += 1;
            let right = self.or()?;
            return Ok(Expr::Implies(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.compare()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.compare()?));
        }
        Ok(left)
    }

    fn compare(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.term()?;
        let negated = match self.peek() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.term()?;
        Ok(Expr::Eq(Box::new(left), Box::new(right), negated))
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        match self.next().ok_or(ExpressionError::UnexpectedEnd)? {
            Token::Path(path) => Ok(Expr::Path(path)),
            Token::Call(path, name) => {
                let func = match name.as_str() {
                    "exists" => Func::Exists,
                    "empty" => Func::Empty,
                    "not" => Func::Not,
                    "count" => Func::Count,
                    _ => return Err(ExpressionError::UnknownFunction(name)),
                };
                Ok(Expr::Call(path, func))
            }
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(serde_json::json!(n))),
            Token::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            Token::Open => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            other => Err(ExpressionError::UnexpectedToken(format!("{:?}", other))),
        }
    }
}

/// A parsed invariant expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse an expression.
    pub fn parse(text: &str) -> Result<Self, ExpressionError> {
        let mut parser = Parser {
            tokens: tokenize(text)?,
            pos: 0,
        };
        let root = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(ExpressionError::UnexpectedToken(format!("{:?}", extra)));
        }
        Ok(Self {
            source: text.to_string(),
            root,
        })
    }

    /// Source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a document. Empty results count as false.
    pub fn evaluate(&self, document: &Value) -> bool {
        truthy(&eval(&self.root, document))
    }
}

/// Intermediate value: always a collection, as in path languages.
fn eval(expr: &Expr, document: &Value) -> Vec<Value> {
    match expr {
        Expr::Path(path) => select(document, path).into_iter().cloned().collect(),
        Expr::Call(path, func) => {
            let items = if path.is_empty() {
                vec![document.clone()]
            } else {
                select(document, path).into_iter().cloned().collect()
            };
            match func {
                Func::Exists => vec![Value::Bool(!items.is_empty())],
                Func::Empty => vec![Value::Bool(items.is_empty())],
                Func::Not => vec![Value::Bool(!truthy(&items))],
                Func::Count => vec![serde_json::json!(items.len() as f64)],
            }
        }
        Expr::Literal(value) => vec![value.clone()],
        Expr::And(a, b) => vec![Value::Bool(truthy(&eval(a, document)) && truthy(&eval(b, document)))],
        Expr::Or(a, b) => vec![Value::Bool(truthy(&eval(a, document)) || truthy(&eval(b, document)))],
        Expr::Implies(a, b) => vec![Value::Bool(!truthy(&eval(a, document)) || truthy(&eval(b, document)))],
        Expr::Eq(a, b, negated) => {
            let left = eval(a, document);
            let right = eval(b, document);
            if left.is_empty() || right.is_empty() {
                return Vec::new();
            }
            let equal = left.len() == right.len() && left.iter().zip(&right).all(|(l, r)| values_equal(l, r));
            vec![Value::Bool(equal != *negated)]
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn truthy(items: &[Value]) -> bool {
    match items {
        [] => false,
        [Value::Bool(b)] => *b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_on(expr: &str, doc: &Value) -> bool {
        Expression::parse(expr).unwrap().evaluate(doc)
    }

    #[test]
    fn test_exists_and_empty() {
        let doc = json!({"name": [{"family": "Doe"}], "telecom": []});
        assert!(eval_on("name.exists()", &doc));
        assert!(eval_on("name.family.exists()", &doc));
        assert!(eval_on("telecom.empty()", &doc));
        assert!(!eval_on("birthDate.exists()", &doc));
    }

    #[test]
    fn test_equality() {
        let doc = json!({"status": "final", "valueQuantity": {"value": 72}});
        assert!(eval_on("status = 'final'", &doc));
        assert!(eval_on("status != 'draft'", &doc));
        assert!(eval_on("valueQuantity.value = 72", &doc));
        assert!(!eval_on("missing = 'x'", &doc));
    }

    #[test]
    fn test_implies_and_precedence() {
        let doc = json!({"status": "cancelled"});
        assert!(eval_on("status = 'completed' implies outcome.exists()", &doc));
        assert!(!eval_on("status = 'cancelled' implies outcome.exists()", &doc));
        assert!(eval_on("status.exists() and (a.exists() or status = 'cancelled')", &doc));
    }

    #[test]
    fn test_count_and_not() {
        let doc = json!({"name": [{"given": ["A", "B"]}]});
        assert!(eval_on("name.given.count() = 2", &doc));
        assert!(eval_on("deceasedBoolean.not()", &doc));
        assert!(!eval_on("name.not()", &doc));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Expression::parse("name.frobnicate()"),
            Err(ExpressionError::UnknownFunction("frobnicate".to_string()))
        );
        assert_eq!(Expression::parse("status = 'open"), Err(ExpressionError::UnterminatedString));
        assert!(Expression::parse("(a.exists()").is_err());
        assert!(Expression::parse("a = ").is_err());
        assert!(Expression::parse("a # b").is_err());
    }
}
