//! AST evaluator
//!
//! Evaluates parsed expressions against a context map of JSON values.
//!
//! Missing paths resolve to a distinguished *absent* outcome rather than an
//! error; dereferencing absent further (property access, indexing) or using
//! it as an operand raises `ExpressionError`. Conditions treat absent as
//! falsy so filter expressions over optional metadata stay convenient.

use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::ExpressionError;
use super::parser::{BinaryOp, Expr, UnaryOp};

/// Result of evaluating an expression: a concrete value or "absent"
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Value),
    Absent,
}

impl Outcome {
    /// Collapse to a native JSON value (absent becomes `null`)
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Absent => Value::Null,
        }
    }

    /// Stringify for textual interpolation (absent and null become "")
    pub fn into_display_string(self) -> String {
        match self {
            Self::Absent | Self::Value(Value::Null) => String::new(),
            Self::Value(Value::String(s)) => s,
            Self::Value(v) => v.to_string(),
        }
    }
}

/// Convert an f64 into a JSON number, preferring integers when exact
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Evaluate an expression AST against a context map
pub fn eval(expr: &Expr, ctx: &Map<String, Value>) -> Result<Outcome, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(Outcome::Value(v.clone())),

        Expr::Root(name) => Ok(match ctx.get(name) {
            Some(v) => Outcome::Value(v.clone()),
            None => Outcome::Absent,
        }),

        Expr::Field(target, field) => {
            let target = eval(target, ctx)?;
            match target {
                Outcome::Absent => Err(ExpressionError::UnresolvedPath {
                    path: field.clone(),
                }),
                Outcome::Value(Value::Object(map)) => Ok(match map.get(field) {
                    Some(v) => Outcome::Value(v.clone()),
                    None => Outcome::Absent,
                }),
                Outcome::Value(other) => Err(ExpressionError::TypeMismatch {
                    expected: "object".to_string(),
                    found: type_name(&other).to_string(),
                }),
            }
        }

        Expr::Index(target, index) => {
            let target = eval(target, ctx)?;
            let index = require_value(eval(index, ctx)?)?;
            match target {
                Outcome::Absent => Err(ExpressionError::UnresolvedPath {
                    path: "[index]".to_string(),
                }),
                Outcome::Value(Value::Array(items)) => {
                    let idx = index.as_i64().ok_or_else(|| ExpressionError::TypeMismatch {
                        expected: "integer index".to_string(),
                        found: type_name(&index).to_string(),
                    })?;
                    let idx = if idx < 0 { items.len() as i64 + idx } else { idx };
                    Ok(match usize::try_from(idx).ok().and_then(|i| items.get(i)) {
                        Some(v) => Outcome::Value(v.clone()),
                        None => Outcome::Absent,
                    })
                }
                Outcome::Value(Value::Object(map)) => {
                    let key = index.as_str().ok_or_else(|| ExpressionError::TypeMismatch {
                        expected: "string key".to_string(),
                        found: type_name(&index).to_string(),
                    })?;
                    Ok(match map.get(key) {
                        Some(v) => Outcome::Value(v.clone()),
                        None => Outcome::Absent,
                    })
                }
                Outcome::Value(other) => Err(ExpressionError::TypeMismatch {
                    expected: "array or object".to_string(),
                    found: type_name(&other).to_string(),
                }),
            }
        }

        Expr::Unary(op, inner) => {
            let inner = eval(inner, ctx)?;
            match op {
                UnaryOp::Not => Ok(Outcome::Value(Value::Bool(!truthy(&inner)))),
                UnaryOp::Neg => {
                    let n = require_number(&require_value(inner)?)?;
                    Ok(Outcome::Value(number_value(-n)))
                }
            }
        }

        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),

        Expr::Ternary(cond, then, otherwise) => {
            let cond = eval(cond, ctx)?;
            if truthy(&cond) {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }

        Expr::Call(name, args) => eval_call(name, args, ctx),
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &Map<String, Value>,
) -> Result<Outcome, ExpressionError> {
    // Short-circuit boolean operators work on truthiness
    match op {
        BinaryOp::And => {
            let l = eval(lhs, ctx)?;
            if !truthy(&l) {
                return Ok(Outcome::Value(Value::Bool(false)));
            }
            let r = eval(rhs, ctx)?;
            return Ok(Outcome::Value(Value::Bool(truthy(&r))));
        }
        BinaryOp::Or => {
            let l = eval(lhs, ctx)?;
            if truthy(&l) {
                return Ok(Outcome::Value(Value::Bool(true)));
            }
            let r = eval(rhs, ctx)?;
            return Ok(Outcome::Value(Value::Bool(truthy(&r))));
        }
        _ => {}
    }

    let l = require_value(eval(lhs, ctx)?)?;
    let r = require_value(eval(rhs, ctx)?)?;

    let value = match op {
        BinaryOp::Add => match (&l, &r) {
            // String concatenation when either side is a string
            (Value::String(a), b) => Value::String(format!("{a}{}", display(b))),
            (a, Value::String(b)) => Value::String(format!("{}{b}", display(a))),
            _ => number_value(require_number(&l)? + require_number(&r)?),
        },
        BinaryOp::Sub => number_value(require_number(&l)? - require_number(&r)?),
        BinaryOp::Mul => number_value(require_number(&l)? * require_number(&r)?),
        BinaryOp::Div => {
            let divisor = require_number(&r)?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            number_value(require_number(&l)? / divisor)
        }
        BinaryOp::Rem => {
            let divisor = require_number(&r)?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            number_value(require_number(&l)? % divisor)
        }
        BinaryOp::Eq => Value::Bool(l == r),
        BinaryOp::NotEq => Value::Bool(l != r),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = compare(&l, &r)?;
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::LtEq => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::GtEq => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    };
    Ok(Outcome::Value(value))
}

/// Closed builtin function set
fn eval_call(
    name: &str,
    args: &[Expr],
    ctx: &Map<String, Value>,
) -> Result<Outcome, ExpressionError> {
    match name {
        "length" => {
            let v = require_value(arg(name, args, 0, 1, ctx)?)?;
            let len = match &v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExpressionError::TypeMismatch {
                        expected: "string, array or object".to_string(),
                        found: type_name(other).to_string(),
                    });
                }
            };
            Ok(Outcome::Value(Value::from(len as i64)))
        }
        "upper" => Ok(Outcome::Value(Value::String(
            require_string(&require_value(arg(name, args, 0, 1, ctx)?)?)?.to_uppercase(),
        ))),
        "lower" => Ok(Outcome::Value(Value::String(
            require_string(&require_value(arg(name, args, 0, 1, ctx)?)?)?.to_lowercase(),
        ))),
        "trim" => Ok(Outcome::Value(Value::String(
            require_string(&require_value(arg(name, args, 0, 1, ctx)?)?)?
                .trim()
                .to_string(),
        ))),
        "contains" => {
            let hay = require_value(arg(name, args, 0, 2, ctx)?)?;
            let needle = require_value(arg(name, args, 1, 2, ctx)?)?;
            let result = match &hay {
                Value::String(s) => s.contains(&display(&needle)),
                Value::Array(items) => items.contains(&needle),
                other => {
                    return Err(ExpressionError::TypeMismatch {
                        expected: "string or array".to_string(),
                        found: type_name(other).to_string(),
                    });
                }
            };
            Ok(Outcome::Value(Value::Bool(result)))
        }
        "starts_with" => {
            let s = require_value(arg(name, args, 0, 2, ctx)?)?;
            let prefix = require_value(arg(name, args, 1, 2, ctx)?)?;
            Ok(Outcome::Value(Value::Bool(
                require_string(&s)?.starts_with(&display(&prefix)),
            )))
        }
        "default" => {
            // Falls back when the first argument is absent or null
            let first = arg(name, args, 0, 2, ctx)?;
            match first {
                Outcome::Absent | Outcome::Value(Value::Null) => arg(name, args, 1, 2, ctx),
                present => Ok(present),
            }
        }
        "now" => {
            if !args.is_empty() {
                return Err(ExpressionError::Arity {
                    function: name.to_string(),
                    expected: 0,
                    got: args.len(),
                });
            }
            let now = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default();
            Ok(Outcome::Value(Value::String(now)))
        }
        "env" => {
            let key = require_string(&require_value(arg(name, args, 0, 1, ctx)?)?)?;
            Ok(match std::env::var(&key) {
                Ok(v) => Outcome::Value(Value::String(v)),
                Err(_) => Outcome::Absent,
            })
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

/// Evaluate argument `idx`, checking arity against `expected`
fn arg(
    name: &str,
    args: &[Expr],
    idx: usize,
    expected: usize,
    ctx: &Map<String, Value>,
) -> Result<Outcome, ExpressionError> {
    if args.len() != expected {
        return Err(ExpressionError::Arity {
            function: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    eval(&args[idx], ctx)
}

/// Truthiness used by conditions and boolean operators
pub fn truthy(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Absent => false,
        Outcome::Value(v) => match v {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        },
    }
}

fn require_value(outcome: Outcome) -> Result<Value, ExpressionError> {
    match outcome {
        Outcome::Value(v) => Ok(v),
        Outcome::Absent => Err(ExpressionError::UnresolvedPath {
            path: "<absent operand>".to_string(),
        }),
    }
}

fn require_number(v: &Value) -> Result<f64, ExpressionError> {
    v.as_f64().ok_or_else(|| ExpressionError::TypeMismatch {
        expected: "number".to_string(),
        found: type_name(v).to_string(),
    })
}

fn require_string(v: &Value) -> Result<String, ExpressionError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(ExpressionError::TypeMismatch {
            expected: "string".to_string(),
            found: type_name(other).to_string(),
        }),
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).ok_or(ExpressionError::TypeMismatch {
                expected: "comparable numbers".to_string(),
                found: "NaN".to_string(),
            })
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExpressionError::TypeMismatch {
            expected: "two numbers or two strings".to_string(),
            found: format!("{} and {}", type_name(l), type_name(r)),
        }),
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
