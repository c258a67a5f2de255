//! Decoded view over a raw message body.
//!
//! Handlers and matchers receive an [`Event`]: the raw body plus its JSON
//! decoding when the body parses, with dotted-path access into nested
//! objects (`"payload.resource.id"`).

use serde_json::Value;

/// A message body with its (optional) JSON decoding.
#[derive(Debug, Clone)]
pub struct Event {
    body: String,
    decoded: Option<Value>,
}

impl Event {
    /// Wrap a raw body, decoding it as JSON when possible.
    pub fn parse(body: impl Into<String>) -> Self {
        let body = body.into();
        let decoded = serde_json::from_str(&body).ok();
        Self { body, decoded }
    }

    /// The raw message body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The decoded JSON document, if the body parsed.
    pub fn decoded(&self) -> Option<&Value> {
        self.decoded.as_ref()
    }

    /// Look up a dotted path in the decoded document.
    pub fn path(&self, path: &str) -> Option<&Value> {
        lookup_path(self.decoded()?, path)
    }

    /// Look up a dotted path and render it as a plain string.
    ///
    /// Strings come back unquoted; numbers and booleans are rendered with
    /// their JSON representation. Objects and arrays yield `None`.
    pub fn path_str(&self, path: &str) -> Option<String> {
        match self.path(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The conventional event name field.
    pub fn name(&self) -> Option<&str> {
        self.path("name").and_then(Value::as_str)
    }

    /// The retry counter carried by recovery messages. Zero when absent.
    pub fn retry_count(&self) -> u32 {
        self.path("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }
}

/// Walk `value` down a dotted path, one object key per segment.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_body() {
        let event = Event::parse(r#"{"name":"ping","payload":{"id":"42"}}"#);
        assert!(event.decoded().is_some());
        assert_eq!(event.name(), Some("ping"));
        assert_eq!(event.path("payload.id"), Some(&json!("42")));
    }

    #[test]
    fn test_parse_non_json_body() {
        let event = Event::parse("plain text");
        assert!(event.decoded().is_none());
        assert!(event.name().is_none());
        assert_eq!(event.retry_count(), 0);
    }

    #[test]
    fn test_path_str_renders_scalars() {
        let event = Event::parse(r#"{"a":{"b":7},"c":"seven","d":true,"e":[1]}"#);
        assert_eq!(event.path_str("a.b"), Some("7".to_string()));
        assert_eq!(event.path_str("c"), Some("seven".to_string()));
        assert_eq!(event.path_str("d"), Some("true".to_string()));
        assert_eq!(event.path_str("e"), None);
        assert_eq!(event.path_str("missing"), None);
    }

    #[test]
    fn test_retry_count() {
        let event = Event::parse(r#"{"name":"x","retry_count":2}"#);
        assert_eq!(event.retry_count(), 2);
    }

    #[test]
    fn test_lookup_path_stops_at_non_objects() {
        let doc = json!({"a": [1, 2, 3]});
        assert!(lookup_path(&doc, "a.0").is_none());
        assert_eq!(lookup_path(&doc, "a"), Some(&json!([1, 2, 3])));
    }
}
