//! Filter expression language.
//!
//! A CEL-compatible subset evaluated against an event's canonical map. It is
//! used for rule filters and for `payloadValue` property paths.
//!
//! # Example
//!
//! ```rust
//! use event_reactor::expr::Expression;
//! use serde_json::json;
//!
//! let expr = Expression::parse("has(data.pr) && attributes.eventType == 'push'").unwrap();
//! let env = json!({"data": {"pr": 7}, "attributes": {"eventType": "push"}, "id": ""});
//! assert!(expr.evaluate_bool(&env).unwrap());
//! ```
//!
//! # Supported syntax
//!
//! - literals: `1`, `1.5`, `'a'`, `"a"`, `true`, `null`, `[1, 2]`, `{'k': v}`
//! - selection: `data.a.b`, `attributes['x-key']`, `data.items[0]`
//! - operators: `! - * / % + - < <= > >= == != in && || ?:`
//! - functions: `has()`, `size()`, `startsWith()`, `endsWith()`,
//!   `contains()`, `matches()`, `lowerAscii()`, `upperAscii()`, `string()`,
//!   `int()`, `double()`

pub mod eval;
pub mod lexer;
pub mod parser;

use crate::event::type_name;
use serde_json::Value;
use thiserror::Error;

pub use parser::Expr;

/// Syntax errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expression is empty")]
    Empty,

    #[error("invalid token '{text}' at position {position}")]
    InvalidToken { text: String, position: usize },

    #[error("unexpected '{found}' at position {position}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        position: usize,
    },

    #[error("expression is nested deeper than {limit} levels at position {position}")]
    TooDeep { limit: usize, position: usize },
}

/// Runtime evaluation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undeclared reference to '{0}'")]
    UnknownIdentifier(String),

    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("index {index} out of range for list of size {size}")]
    IndexOutOfRange { index: i64, size: usize },

    #[error("no such overload: {left} {op} {right}")]
    NoSuchOverload {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("'{op}' is not supported for type '{operand}'")]
    Unsupported { op: String, operand: &'static str },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid arguments to '{function}': {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("invalid regular expression '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("numeric overflow")]
    Overflow,

    #[error("expected a bool result, got '{0}'")]
    NotBoolean(&'static str),
}

impl EvalError {
    pub(crate) fn unary(op: &str, operand: &Value) -> Self {
        EvalError::Unsupported {
            op: op.to_string(),
            operand: type_name(operand),
        }
    }

    pub(crate) fn binary(op: &str, left: &Value, right: &Value) -> Self {
        EvalError::NoSuchOverload {
            op: op.to_string(),
            left: type_name(left),
            right: type_name(right),
        }
    }

    pub(crate) fn arguments(function: &str, reason: &str) -> Self {
        EvalError::InvalidArguments {
            function: function.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Either stage failing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("failed to parse expression '{source_text}': {error}")]
    Parse {
        source_text: String,
        #[source]
        error: ParseError,
    },

    #[error("failed to evaluate expression '{source_text}': {error}")]
    Eval {
        source_text: String,
        #[source]
        error: EvalError,
    },
}

/// A parsed expression, ready to evaluate any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let ast = parser::parse(source).map_err(|error| ExprError::Parse {
            source_text: source.to_string(),
            error,
        })?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// Source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `env` (an object whose keys are the variables)
    pub fn evaluate(&self, env: &Value) -> Result<Value, ExprError> {
        eval::evaluate(&self.ast, env).map_err(|error| ExprError::Eval {
            source_text: self.source.clone(),
            error,
        })
    }

    /// Evaluate and require a boolean result
    pub fn evaluate_bool(&self, env: &Value) -> Result<bool, ExprError> {
        match self.evaluate(env)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::Eval {
                source_text: self.source.clone(),
                error: EvalError::NotBoolean(type_name(&other)),
            }),
        }
    }
}
