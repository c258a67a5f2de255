//! Matcher library for routing raw message bodies.
//!
//! A matcher is a pure `Fn(&str) -> bool` over the undecoded body. Matchers
//! run on the dispatch path and must not block. JSON-based matchers return
//! `false` when the body does not parse.

use crate::error::WorkerError;
use crate::event::lookup_path;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// A route predicate over the raw message body.
pub type Matcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Matches every message.
pub fn always() -> Matcher {
    Arc::new(|_| true)
}

/// Matches when the decoded body's top-level `field` equals `value`.
pub fn json_matcher(field: &str, value: impl Into<Value>) -> Matcher {
    let field = field.to_string();
    let value = value.into();
    Arc::new(move |body| {
        let Ok(decoded) = serde_json::from_str::<Value>(body) else {
            return false;
        };
        decoded.get(&field) == Some(&value)
    })
}

/// Matches when the dotted `path` into the decoded body equals `value`.
pub fn path_matcher(path: &str, value: impl Into<Value>) -> Matcher {
    let path = path.to_string();
    let value = value.into();
    Arc::new(move |body| {
        let Ok(decoded) = serde_json::from_str::<Value>(body) else {
            return false;
        };
        lookup_path(&decoded, &path) == Some(&value)
    })
}

/// Matches when the regular expression matches at the start of the body.
pub fn regex_matcher(pattern: &str) -> Result<Matcher, WorkerError> {
    // Anchor to mirror match-from-start semantics
    let anchored = if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^(?:{pattern})")
    };
    let regex = Regex::new(&anchored)?;
    Ok(Arc::new(move |body| regex.is_match(body)))
}

/// Matches on the truthiness of the value at `path`.
///
/// `missing` is assumed when the path is absent; `inverse` negates the
/// result.
pub fn flag_matcher(path: &str, missing: bool, inverse: bool) -> Matcher {
    let path = path.to_string();
    Arc::new(move |body| {
        let Ok(decoded) = serde_json::from_str::<Value>(body) else {
            return false;
        };
        let flag = match lookup_path(&decoded, &path) {
            None | Some(Value::Null) => missing,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64() != Some(0.0),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        };
        if inverse { !flag } else { flag }
    })
}

/// Matches when every given matcher matches.
pub fn all_of(matchers: Vec<Matcher>) -> Matcher {
    Arc::new(move |body| matchers.iter().all(|m| m(body)))
}
