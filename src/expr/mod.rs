//! Embedded expression engine
//!
//! Parses and evaluates small expressions embedded in endpoint
//! configuration, in two delimiter styles:
//!
//! - `{! expr !}`: the result keeps its native JSON type (a string field
//!   that is exactly one such expression becomes a number, object, etc.)
//! - `[! expr !]`: the result is always stringified
//!
//! [`substitute`] walks objects, arrays and strings recursively. A string
//! containing surrounding text or more than one expression performs textual
//! interpolation (which forces stringification).
//!
//! Evaluation is deterministic for an unchanged context; only the `now()`
//! and `env()` builtins read ambient state.

pub mod eval;
pub mod parser;
pub mod token;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub use eval::Outcome;
pub use parser::Expr;

/// Result type for expression operations
pub type ExpressionResult<T> = Result<T, ExpressionError>;

/// Error type for expression parsing and evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// Expression text could not be parsed
    #[error("Failed to parse expression '{expr}': {message}")]
    Parse { expr: String, message: String },

    /// An absent value was dereferenced or used as an operand
    #[error("Unresolved reference at '{path}'")]
    UnresolvedPath { path: String },

    /// Operand had the wrong type for the operation
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Function name outside the closed builtin set
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Wrong number of arguments to a builtin
    #[error("Function '{function}' expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("Division by zero")]
    DivisionByZero,
}

/// How substitution reacts to a failing expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstituteMode {
    /// Propagate the first failure (used for pipeline step params)
    Strict,
    /// Leave the original template text untouched at the call site and
    /// continue (used for response templates), never silently empty
    Lenient,
}

/// Matches both delimiter styles, in document order
static EXPR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{!(?P<native>.*?)!\}|\[!(?P<text>.*?)!\]").expect("expr regex"));

/// Evaluate a single expression string (no delimiters) against a context
pub fn evaluate(expr: &str, ctx: &Map<String, Value>) -> ExpressionResult<Outcome> {
    let ast = parser::parse(expr)?;
    eval::eval(&ast, ctx)
}

/// Evaluate an expression as a boolean condition.
///
/// Used for broadcast filters; absent values are falsy.
pub fn evaluate_condition(expr: &str, ctx: &Map<String, Value>) -> ExpressionResult<bool> {
    let outcome = evaluate(expr, ctx)?;
    Ok(eval::truthy(&outcome))
}

/// Recursively substitute expressions inside a JSON value
pub fn substitute(
    value: &Value,
    ctx: &Map<String, Value>,
    mode: SubstituteMode,
) -> ExpressionResult<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, ctx, mode)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for v in items {
                out.push(substitute(v, ctx, mode)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => substitute_string(s, ctx, mode),
        other => Ok(other.clone()),
    }
}

/// Substitute a single string scalar.
///
/// A string that is exactly one `{! !}` expression is replaced by the
/// expression's native value; anything else interpolates textually.
fn substitute_string(
    s: &str,
    ctx: &Map<String, Value>,
    mode: SubstituteMode,
) -> ExpressionResult<Value> {
    let matches: Vec<_> = EXPR_RE.find_iter(s).collect();
    if matches.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // Whole-string native replacement: one {! !} expression and nothing else
    if matches.len() == 1 && matches[0].as_str() == s.trim() {
        let caps = EXPR_RE.captures(s).expect("match implies captures");
        if let Some(native) = caps.name("native") {
            return match evaluate(native.as_str().trim(), ctx) {
                Ok(outcome) => Ok(outcome.into_value()),
                Err(e) => match mode {
                    SubstituteMode::Strict => Err(e),
                    SubstituteMode::Lenient => {
                        debug!(expr = %native.as_str().trim(), error = %e, "Leaving failed expression untouched");
                        Ok(Value::String(s.to_string()))
                    }
                },
            };
        }
    }

    // Textual interpolation: every expression is stringified in place
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in EXPR_RE.captures_iter(s) {
        let m = caps.get(0).expect("whole match");
        out.push_str(&s[last..m.start()]);
        let inner = caps
            .name("native")
            .or_else(|| caps.name("text"))
            .expect("one branch matched");
        match evaluate(inner.as_str().trim(), ctx) {
            Ok(outcome) => out.push_str(&outcome.into_display_string()),
            Err(e) => match mode {
                SubstituteMode::Strict => return Err(e),
                SubstituteMode::Lenient => {
                    debug!(expr = %inner.as_str().trim(), error = %e, "Leaving failed expression untouched");
                    out.push_str(m.as_str());
                }
            },
        }
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}
