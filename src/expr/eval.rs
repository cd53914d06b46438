//! Tree-walking evaluator over `serde_json::Value`.
//!
//! Semantics follow CEL where it matters for filters: `&&`/`||` absorb an
//! error on one side when the other side decides the result, `has()` tests
//! field presence without failing, and numbers compare across int/double.

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::EvalError;
use crate::event::{type_name, value_to_string};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Evaluate `expr` with `env` (an object) as the variable namespace.
pub fn evaluate(expr: &Expr, env: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),
        Expr::Member(base, field) => select(evaluate(base, env)?, field),
        Expr::Index(base, index) => {
            let base = evaluate(base, env)?;
            let index = evaluate(index, env)?;
            index_into(base, &index)
        }
        Expr::Call {
            target,
            function,
            args,
        } => call(target.as_deref(), function, args, env),
        Expr::Unary(op, operand) => unary(*op, evaluate(operand, env)?),
        Expr::Binary(op, left, right) => {
            let left = evaluate(left, env)?;
            let right = evaluate(right, env)?;
            binary(*op, left, right)
        }
        Expr::And(left, right) => logical(left, right, env, false),
        Expr::Or(left, right) => logical(left, right, env, true),
        Expr::Conditional(condition, then, otherwise) => {
            match evaluate(condition, env)? {
                Value::Bool(true) => evaluate(then, env),
                Value::Bool(false) => evaluate(otherwise, env),
                other => Err(EvalError::unary("?:", &other)),
            }
        }
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match evaluate(key, env)? {
                    Value::String(s) => s,
                    other @ (Value::Number(_) | Value::Bool(_)) => value_to_string(&other),
                    other => return Err(EvalError::unary("map key", &other)),
                };
                map.insert(key, evaluate(value, env)?);
            }
            Ok(Value::Object(map))
        }
    }
}

/// `&&` when `decisive` is false, `||` when it is true.
///
/// Whichever side evaluates to `decisive` wins, even if the other side
/// errored. Otherwise the first error is returned.
fn logical(left: &Expr, right: &Expr, env: &Value, decisive: bool) -> Result<Value, EvalError> {
    let op = if decisive { "||" } else { "&&" };

    let left = evaluate(left, env).and_then(|v| as_bool(op, v));
    if matches!(left, Ok(b) if b == decisive) {
        return Ok(Value::Bool(decisive));
    }

    let right = evaluate(right, env).and_then(|v| as_bool(op, v));
    if matches!(right, Ok(b) if b == decisive) {
        return Ok(Value::Bool(decisive));
    }

    left?;
    right?;
    Ok(Value::Bool(!decisive))
}

fn as_bool(op: &str, value: Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::unary(op, &other)),
    }
}

fn select(base: Value, field: &str) -> Result<Value, EvalError> {
    match base {
        Value::Object(mut map) => map
            .remove(field)
            .ok_or_else(|| EvalError::NoSuchKey(field.to_string())),
        other => Err(EvalError::Unsupported {
            op: format!(".{}", field),
            operand: type_name(&other),
        }),
    }
}

fn index_into(base: Value, index: &Value) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::Object(mut map), Value::String(key)) => map
            .remove(key)
            .ok_or_else(|| EvalError::NoSuchKey(key.clone())),
        (Value::Array(mut items), Value::Number(n)) => {
            let size = items.len();
            let i = n.as_i64().ok_or_else(|| EvalError::unary("[]", index))?;
            if i < 0 || i as usize >= size {
                return Err(EvalError::IndexOutOfRange { index: i, size });
            }
            Ok(items.swap_remove(i as usize))
        }
        (base, index) => Err(EvalError::binary("[]", &base, index)),
    }
}

fn call(
    target: Option<&Expr>,
    function: &str,
    args: &[Expr],
    env: &Value,
) -> Result<Value, EvalError> {
    if target.is_none() && function == "has" {
        return has(args, env);
    }

    let receiver = match target {
        Some(target) => Some(evaluate(target, env)?),
        None => None,
    };
    let mut values = args
        .iter()
        .map(|arg| evaluate(arg, env))
        .collect::<Result<Vec<_>, _>>()?;

    // global functions take the receiver as their first argument
    let (subject, rest) = match receiver {
        Some(receiver) => (receiver, values),
        None => {
            if values.is_empty() {
                return Err(EvalError::arguments(function, "expected at least one argument"));
            }
            let first = values.remove(0);
            (first, values)
        }
    };

    match (function, rest.as_slice()) {
        ("size", []) => size(&subject),
        ("startsWith", [Value::String(prefix)]) => {
            string_fn(function, &subject, |s| s.starts_with(prefix.as_str()))
        }
        ("endsWith", [Value::String(suffix)]) => {
            string_fn(function, &subject, |s| s.ends_with(suffix.as_str()))
        }
        ("contains", [needle]) => match (&subject, needle) {
            (Value::String(s), Value::String(n)) => Ok(Value::Bool(s.contains(n.as_str()))),
            (Value::Array(items), needle) => Ok(Value::Bool(
                items.iter().any(|item| values_equal(item, needle)),
            )),
            (subject, needle) => Err(EvalError::binary("contains", subject, needle)),
        },
        ("matches", [Value::String(pattern)]) => {
            let re = Regex::new(pattern).map_err(|e| EvalError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            string_fn(function, &subject, |s| re.is_match(s))
        }
        ("lowerAscii", []) => match subject {
            Value::String(s) => Ok(Value::String(s.to_ascii_lowercase())),
            other => Err(EvalError::unary(function, &other)),
        },
        ("upperAscii", []) => match subject {
            Value::String(s) => Ok(Value::String(s.to_ascii_uppercase())),
            other => Err(EvalError::unary(function, &other)),
        },
        ("string", []) => Ok(Value::String(value_to_string(&subject))),
        ("int", []) => to_int(subject),
        ("double", []) => to_double(subject),
        ("size" | "lowerAscii" | "upperAscii" | "string" | "int" | "double", _)
        | ("startsWith" | "endsWith" | "matches", _) => Err(EvalError::arguments(
            function,
            "wrong number or type of arguments",
        )),
        _ => Err(EvalError::UnknownFunction(function.to_string())),
    }
}

/// `has(a.b)` / `has(a['b'])`: presence test that never fails on a missing
/// final field.
fn has(args: &[Expr], env: &Value) -> Result<Value, EvalError> {
    let (base, field) = match args {
        [Expr::Member(base, field)] => (base, field.clone()),
        [Expr::Index(base, index)] => match evaluate(index, env)? {
            Value::String(field) => (base, field),
            other => return Err(EvalError::unary("has", &other)),
        },
        _ => {
            return Err(EvalError::arguments(
                "has",
                "argument must be a field selection",
            ))
        }
    };

    match evaluate(base, env)? {
        Value::Object(map) => Ok(Value::Bool(map.contains_key(&field))),
        other => Err(EvalError::unary("has", &other)),
    }
}

fn string_fn(
    function: &str,
    subject: &Value,
    test: impl FnOnce(&str) -> bool,
) -> Result<Value, EvalError> {
    match subject {
        Value::String(s) => Ok(Value::Bool(test(s))),
        other => Err(EvalError::unary(function, other)),
    }
}

fn size(value: &Value) -> Result<Value, EvalError> {
    let n = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(EvalError::unary("size", other)),
    };
    Ok(Value::from(n as i64))
}

fn to_int(value: Value) -> Result<Value, EvalError> {
    match &value {
        Value::Number(n) if n.is_i64() => Ok(value),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| Value::from(f.trunc() as i64))
            .ok_or(EvalError::Overflow),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| EvalError::arguments("int", &e.to_string())),
        other => Err(EvalError::unary("int", other)),
    }
}

fn to_double(value: Value) -> Result<Value, EvalError> {
    match &value {
        Value::Number(n) => Ok(n.as_f64().map(Value::from).unwrap_or(Value::Null)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| EvalError::arguments("double", &e.to_string())),
        other => Err(EvalError::unary("double", other)),
    }
}

fn unary(op: UnaryOp, operand: Value) -> Result<Value, EvalError> {
    match (op, operand) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Number(n)) => match Numeric::from(&n) {
            Numeric::Int(i) => i.checked_neg().map(Value::from).ok_or(EvalError::Overflow),
            Numeric::Float(f) => Ok(Value::from(-f)),
        },
        (UnaryOp::Not, other) => Err(EvalError::unary("!", &other)),
        (UnaryOp::Neg, other) => Err(EvalError::unary("-", &other)),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right)
                .ok_or_else(|| EvalError::binary(op.symbol(), &left, &right))?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In => match (&left, &right) {
            (_, Value::Array(items)) => {
                Ok(Value::Bool(items.iter().any(|item| values_equal(item, &left))))
            }
            (Value::String(key), Value::Object(map)) => Ok(Value::Bool(map.contains_key(key))),
            _ => Err(EvalError::binary("in", &left, &right)),
        },
        BinaryOp::Add => match (left, right) {
            (Value::String(mut a), Value::String(b)) => {
                a.push_str(&b);
                Ok(Value::String(a))
            }
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (left, right) => arithmetic(op, &left, &right),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &left, &right)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl From<&Number> for Numeric {
    fn from(n: &Number) -> Self {
        match n.as_i64() {
            Some(i) => Numeric::Int(i),
            None => Numeric::Float(n.as_f64().unwrap_or(f64::NAN)),
        }
    }
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (a, b) = match (left, right) {
        (Value::Number(a), Value::Number(b)) => (Numeric::from(a), Numeric::from(b)),
        _ => return Err(EvalError::binary(op.symbol(), left, right)),
    };

    if let (Numeric::Int(a), Numeric::Int(b)) = (a, b) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        return result.map(Value::from).ok_or(EvalError::Overflow);
    }

    let (a, b) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(EvalError::binary(op.symbol(), left, right)),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or(EvalError::Overflow)
}

/// Structural equality with numeric comparison across int and double.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            match (Numeric::from(a), Numeric::from(b)) {
                (Numeric::Int(a), Numeric::Int(b)) => a == b,
                (a, b) => a.as_f64() == b.as_f64(),
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (Numeric::from(a), Numeric::from(b)) {
            (Numeric::Int(a), Numeric::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use serde_json::json;

    fn env() -> Value {
        json!({
            "data": {
                "action": "opened",
                "count": 3,
                "ratio": 0.5,
                "labels": ["bug", "p1"],
                "repo": {"name": "core", "private": false}
            },
            "attributes": {"eventType": "push", "x-source": "github"},
            "id": "42"
        })
    }

    fn eval(source: &str) -> Result<Value, EvalError> {
        evaluate(&parse(source).unwrap(), &env())
    }

    #[test]
    fn test_equality_and_membership() {
        assert_eq!(eval("data.action == 'opened'").unwrap(), json!(true));
        assert_eq!(eval("attributes.eventType != 'push'").unwrap(), json!(false));
        assert_eq!(eval("'bug' in data.labels").unwrap(), json!(true));
        assert_eq!(eval("'name' in data.repo").unwrap(), json!(true));
        assert_eq!(eval("id == '42'").unwrap(), json!(true));
    }

    #[test]
    fn test_has_macro() {
        assert_eq!(eval("has(data.repo)").unwrap(), json!(true));
        assert_eq!(eval("has(data.missing)").unwrap(), json!(false));
        assert_eq!(eval("has(attributes['x-source'])").unwrap(), json!(true));
        assert!(eval("has(data)").is_err());
    }

    #[test]
    fn test_missing_key_is_error() {
        assert_eq!(
            eval("data.missing == 1"),
            Err(EvalError::NoSuchKey("missing".into()))
        );
        assert_eq!(
            eval("nope"),
            Err(EvalError::UnknownIdentifier("nope".into()))
        );
    }

    #[test]
    fn test_short_circuit_absorbs_errors() {
        assert_eq!(eval("has(data.missing) && data.missing == 1").unwrap(), json!(false));
        assert_eq!(eval("data.missing == 1 && false").unwrap(), json!(false));
        assert_eq!(eval("true || data.missing").unwrap(), json!(true));
        assert!(eval("data.missing == 1 && true").is_err());
    }

    #[test]
    fn test_numeric_comparisons() {
        assert_eq!(eval("data.count > 2").unwrap(), json!(true));
        assert_eq!(eval("data.count == 3.0").unwrap(), json!(true));
        assert_eq!(eval("data.ratio < 1").unwrap(), json!(true));
        assert_eq!(eval("data.count * 2 + 1").unwrap(), json!(7));
        assert_eq!(eval("7 / 2").unwrap(), json!(3));
        assert_eq!(eval("1 / 0"), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval("data.repo.name.startsWith('co')").unwrap(), json!(true));
        assert_eq!(eval("attributes['x-source'].endsWith('hub')").unwrap(), json!(true));
        assert_eq!(eval("data.action.contains('pen')").unwrap(), json!(true));
        assert_eq!(eval("data.action.matches('^op.*d$')").unwrap(), json!(true));
        assert_eq!(eval("size(data.labels) == 2").unwrap(), json!(true));
        assert_eq!(eval("data.repo.size()").unwrap(), json!(2));
        assert_eq!(eval("'AbC'.lowerAscii()").unwrap(), json!("abc"));
        assert_eq!(eval("string(data.count) + '!'").unwrap(), json!("3!"));
        assert_eq!(eval("int('12') + 1").unwrap(), json!(13));
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(
            eval("data.count + 'x'"),
            Err(EvalError::NoSuchOverload { .. })
        ));
        assert!(matches!(eval("!data.count"), Err(EvalError::Unsupported { .. })));
        assert!(matches!(
            eval("data.action.bogus()"),
            Err(EvalError::UnknownFunction(_))
        ));
        assert!(matches!(
            eval("data.action.matches('(')"),
            Err(EvalError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_conditional_and_literals() {
        assert_eq!(
            eval("data.repo.private ? 'private' : 'public'").unwrap(),
            json!("public")
        );
        assert_eq!(eval("[1, 2] + [3]").unwrap(), json!([1, 2, 3]));
        assert_eq!(eval("{'a': 1}.a").unwrap(), json!(1));
        assert_eq!(eval("data.labels[1]").unwrap(), json!("p1"));
        assert!(matches!(
            eval("data.labels[5]"),
            Err(EvalError::IndexOutOfRange { index: 5, size: 2 })
        ));
    }
}
