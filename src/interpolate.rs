//! Expansion of `${path}` references inside arbitrary JSON-shaped values.
//!
//! A string that consists of exactly one token resolves to the raw value the
//! path points at, keeping its type. Everywhere else tokens are replaced by
//! their string form. A string that is itself a bare path expression (it
//! starts with `$.`) is evaluated directly, which is what `set` mappings use.

use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::debug;
use regex::{Captures, Regex};
use serde_json::Value;

lazy_static! {
    static ref TOKEN_REGEX: Regex = Regex::new(r"\$\{([A-Za-z0-9._\[\]*@?><=!]+)\}").unwrap();
}

/// Resolve every reference in `value` against `data`. Never fails: paths
/// that match nothing become null (exact token) or the empty string (inside
/// a larger string).
pub fn resolve(data: &Value, value: &Value) -> Value {
    match value {
        Value::String(s) => resolve_str(data, s),
        Value::Array(items) => Value::Array(items.iter().map(|item| resolve(data, item)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve(data, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Evaluate a path expression, returning the first matched value.
fn lookup(data: &Value, path: &str) -> Option<Value> {
    let matches = jsonpath_lib::select(data, path).ok()?;
    matches.first().map(|value| (*value).clone())
}

fn resolve_str(data: &Value, s: &str) -> Value {
    if s.starts_with("$.") {
        return lookup(data, s).unwrap_or(Value::Null);
    }
    if let Some(caps) = TOKEN_REGEX.captures(s) {
        let whole = caps.get(0).unwrap();
        if whole.start() == 0 && whole.end() == s.len() {
            return lookup(data, &format!("$.{}", &caps[1])).unwrap_or(Value::Null);
        }
    }
    let replaced = TOKEN_REGEX.replace_all(s, |caps: &Captures| {
        match lookup(data, &format!("$.{}", &caps[1])) {
            None => String::new(),
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
        }
    });
    Value::String(replaced.into_owned())
}
