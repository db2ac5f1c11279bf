use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::state::State;

/// A parsed predicate over state keys.
///
/// Supported expressions:
/// - `key == "value"` / `key != "value"`: equality (unquoted literals compare
///   against the JSON rendering, so `ok == true` and `count == 3` work)
/// - `key contains "substr"`: substring match on strings, membership on arrays
/// - `key > 3` / `key < 3` / `key >= 3` / `key <= 3`: numeric comparison
/// - `exists key` / `!exists key`
///
/// Keys may be dotted paths into nested objects (`patient.severity`).
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { key: String, value: String },
    Ne { key: String, value: String },
    Contains { key: String, value: String },
    Gt { key: String, value: f64 },
    Ge { key: String, value: f64 },
    Lt { key: String, value: f64 },
    Le { key: String, value: f64 },
    Exists(String),
    Missing(String),
}

impl Condition {
    /// Evaluate against workflow state.
    pub fn evaluate(&self, state: &State) -> bool {
        self.eval(|key| state.get(key))
    }

    /// Evaluate against a JSON object (non-objects never match).
    pub fn evaluate_value(&self, value: &Value) -> bool {
        self.eval(|key| value.get(key))
    }

    fn eval<'a>(&self, root: impl Fn(&str) -> Option<&'a Value>) -> bool {
        let lookup = |path: &str| -> Option<&'a Value> {
            let mut parts = path.split('.');
            let first = parts.next()?;
            parts.try_fold(root(first)?, |v, part| v.get(part))
        };

        match self {
            Self::Eq { key, value } => lookup(key).is_some_and(|v| render(v) == *value),
            Self::Ne { key, value } => lookup(key).is_some_and(|v| render(v) != *value),
            Self::Contains { key, value } => lookup(key).is_some_and(|v| match v {
                Value::String(s) => s.contains(value.as_str()),
                Value::Array(items) => items.iter().any(|i| render(i) == *value),
                _ => false,
            }),
            Self::Gt { key, value } => number(lookup(key)).is_some_and(|n| n > *value),
            Self::Ge { key, value } => number(lookup(key)).is_some_and(|n| n >= *value),
            Self::Lt { key, value } => number(lookup(key)).is_some_and(|n| n < *value),
            Self::Le { key, value } => number(lookup(key)).is_some_and(|n| n <= *value),
            Self::Exists(key) => lookup(key).is_some_and(|v| !v.is_null()),
            Self::Missing(key) => lookup(key).map_or(true, |v| v.is_null()),
        }
    }
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty condition".into());
        }

        if let Some(key) = expr.strip_prefix("!exists ") {
            return Ok(Self::Missing(parse_key(key)?));
        }
        if let Some(key) = expr.strip_prefix("exists ") {
            return Ok(Self::Exists(parse_key(key)?));
        }

        if let Some((key, value)) = split_operator(expr, " contains ") {
            return Ok(Self::Contains {
                key: parse_key(key)?,
                value: parse_literal(value),
            });
        }

        // Order matters: two-character operators before their one-character prefixes.
        for op in ["!=", "==", ">=", "<=", ">", "<"] {
            if let Some((key, value)) = split_operator(expr, op) {
                let key = parse_key(key)?;
                return match op {
                    "!=" => Ok(Self::Ne {
                        key,
                        value: parse_literal(value),
                    }),
                    "==" => Ok(Self::Eq {
                        key,
                        value: parse_literal(value),
                    }),
                    _ => {
                        let value: f64 = value
                            .trim()
                            .parse()
                            .map_err(|_| format!("'{}' is not a number", value.trim()))?;
                        Ok(match op {
                            ">=" => Self::Ge { key, value },
                            "<=" => Self::Le { key, value },
                            ">" => Self::Gt { key, value },
                            _ => Self::Lt { key, value },
                        })
                    }
                };
            }
        }

        Err(format!("unsupported expression '{}'", expr))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq { key, value } => write!(f, "{} == \"{}\"", key, value),
            Self::Ne { key, value } => write!(f, "{} != \"{}\"", key, value),
            Self::Contains { key, value } => write!(f, "{} contains \"{}\"", key, value),
            Self::Gt { key, value } => write!(f, "{} > {}", key, value),
            Self::Ge { key, value } => write!(f, "{} >= {}", key, value),
            Self::Lt { key, value } => write!(f, "{} < {}", key, value),
            Self::Le { key, value } => write!(f, "{} <= {}", key, value),
            Self::Exists(key) => write!(f, "exists {}", key),
            Self::Missing(key) => write!(f, "!exists {}", key),
        }
    }
}

/// Split `key OP value` on the first `op` outside a quoted literal.
fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut quoted = false;
    for (i, c) in expr.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if !quoted && expr[i..].starts_with(op) {
            return Some((&expr[..i], &expr[i + op.len()..]));
        }
    }
    None
}

fn parse_key(raw: &str) -> Result<String, String> {
    let key = raw.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) || key.starts_with('"') {
        return Err(format!("invalid key '{}'", key));
    }
    Ok(key.to_string())
}

fn parse_literal(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_string()
    }
}
