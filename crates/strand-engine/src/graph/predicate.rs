use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use strand_core::error::Result;
use strand_core::state::GlobalState;

type PredicateFn = dyn Fn(&GlobalState) -> Result<bool> + Send + Sync;

/// Guard evaluated against the global state.
#[derive(Clone, Default)]
pub enum Predicate {
    #[default]
    Always,
    /// A simple expression, see [`evaluate_condition`].
    Expr(String),
    /// Arbitrary logic. An `Err` is reported as a routing failure.
    Custom(Arc<PredicateFn>),
}

impl Predicate {
    pub fn expr(expr: impl Into<String>) -> Self {
        Self::Expr(expr.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&GlobalState) -> Result<bool> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Shorthand for an infallible closure.
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&GlobalState) -> bool + Send + Sync + 'static,
    {
        Self::custom(move |state| Ok(f(state)))
    }

    pub fn evaluate(&self, state: &GlobalState) -> Result<bool> {
        match self {
            Self::Always => Ok(true),
            Self::Expr(expr) => Ok(evaluate_condition(expr, state)),
            Self::Custom(f) => f(state),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Expr(expr) => write!(f, "Expr({:?})", expr),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Evaluate a simple conditional expression against the state.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Non-string values are compared through their JSON text, so
/// `count == "3"` matches the number `3`. Returns `false` for unparseable
/// expressions and missing keys.
pub fn evaluate_condition(expr: &str, state: &GlobalState) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return lookup(state, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(state, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(state, key).is_some_and(|s| s == value);
    }

    false
}

fn lookup(state: &GlobalState, key: &str) -> Option<String> {
    state.get(key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
