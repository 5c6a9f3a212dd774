//! Template expansion.
//!
//! Syntax:
//! - `{{ path }}`: dotted path into the context (`user.name`); required.
//! - `{{ path | default: "text" }}`: falls back to the quoted literal when
//!   the path is absent.
//!
//! Strings are inserted raw, `null` as the empty string, numbers and booleans
//! in their JSON form, arrays and objects as compact JSON. Rendering is a pure
//! function: retries re-render before re-dispatching and must produce the
//! same bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::RenderError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A rendered message body plus its content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPayload {
    pub body: String,
    /// Lowercase hex SHA-256 of `body`; stored as the execution record's
    /// payload reference.
    pub digest: String,
}

/// Expand `template` against `context`.
///
/// # Errors
/// - [`RenderError::MissingVariable`] for a required path absent from `context`.
/// - [`RenderError::Malformed`] for invalid template syntax.
pub fn render(template: &str, context: &Value) -> Result<RenderedPayload, RenderError> {
    let mut body = String::with_capacity(template.len());

    for segment in parse(template)? {
        match segment {
            Segment::Text(text) => body.push_str(text),
            Segment::Var { path, default } => match lookup(context, path) {
                Some(value) => push_value(&mut body, value),
                None => match default {
                    Some(fallback) => body.push_str(fallback),
                    None => {
                        return Err(RenderError::MissingVariable {
                            name: path.to_owned(),
                        })
                    }
                },
            },
        }
    }

    let digest = hex::encode(Sha256::digest(body.as_bytes()));
    Ok(RenderedPayload { body, digest })
}

/// Paths the template needs from the context (those without a default),
/// in order of first appearance.
pub fn required_variables(template: &str) -> Result<Vec<String>, RenderError> {
    let mut required: Vec<String> = Vec::new();
    for segment in parse(template)? {
        if let Segment::Var { path, default: None } = segment {
            if !required.iter().any(|p| p == path) {
                required.push(path.to_owned());
            }
        }
    }
    Ok(required)
}

/// Whether the template contains any placeholder at all.
pub fn has_placeholders(template: &str) -> bool {
    template.contains(OPEN)
}

/// Resolve a dotted path against a JSON value. Object keys only.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(context, |value, key| value.as_object()?.get(key))
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Var {
        path: &'a str,
        default: Option<&'a str>,
    },
}

fn malformed(message: impl Into<String>) -> RenderError {
    RenderError::Malformed {
        message: message.into(),
    }
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, RenderError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        let Some(open) = rest.find(OPEN) else {
            check_text(rest)?;
            segments.push(Segment::Text(rest));
            break;
        };

        let text = &rest[..open];
        check_text(text)?;
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        let after_open = &rest[open + OPEN.len()..];
        let close = after_open
            .find(CLOSE)
            .ok_or_else(|| malformed("unterminated '{{'"))?;
        let inner = &after_open[..close];
        if inner.contains(OPEN) {
            return Err(malformed("nested '{{' inside a placeholder"));
        }

        segments.push(parse_placeholder(inner)?);
        rest = &after_open[close + CLOSE.len()..];
    }

    Ok(segments)
}

fn check_text(text: &str) -> Result<(), RenderError> {
    if text.contains(CLOSE) {
        return Err(malformed("'}}' without a matching '{{'"));
    }
    Ok(())
}

fn parse_placeholder(inner: &str) -> Result<Segment<'_>, RenderError> {
    let (path, filter) = match inner.split_once('|') {
        Some((path, filter)) => (path.trim(), Some(filter.trim())),
        None => (inner.trim(), None),
    };

    if path.is_empty() {
        return Err(malformed("empty placeholder"));
    }
    let valid_path = path.split('.').all(|key| {
        !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    });
    if !valid_path {
        return Err(malformed(format!("invalid variable path '{path}'")));
    }

    let default = match filter {
        None => None,
        Some(filter) => Some(parse_default(filter)?),
    };

    Ok(Segment::Var { path, default })
}

/// Parses `default: "text"` (single or double quotes).
fn parse_default(filter: &str) -> Result<&str, RenderError> {
    let argument = filter
        .strip_prefix("default")
        .and_then(|s| s.trim_start().strip_prefix(':'))
        .map(str::trim)
        .ok_or_else(|| malformed(format!("unknown filter '{filter}'")))?;

    let mut chars = argument.chars();
    let quote = match chars.next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Err(malformed("default value must be a quoted string")),
    };
    let body = &argument[1..];
    match body.find(quote) {
        Some(end) if end + 1 == body.len() => Ok(&body[..end]),
        Some(_) => Err(malformed("unexpected text after default value")),
        None => Err(malformed("unterminated default value")),
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_paths() {
        let ctx = json!({ "user": { "name": "Ada", "age": 36 }, "vip": true });
        let out = render("Hi {{ user.name }} ({{user.age}}), vip={{ vip }}", &ctx).unwrap();
        assert_eq!(out.body, "Hi Ada (36), vip=true");
    }

    #[test]
    fn identical_inputs_render_identical_bytes() {
        let ctx = json!({ "items": [1, 2], "meta": { "b": 1, "a": 2 } });
        let first = render("{{ items }} {{ meta }}", &ctx).unwrap();
        let second = render("{{ items }} {{ meta }}", &ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.digest.len(), 64);
    }

    #[test]
    fn missing_variable_is_reported() {
        let err = render("Hello {{ userName }}", &json!({})).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingVariable {
                name: "userName".into()
            }
        );
    }

    #[test]
    fn default_covers_missing_variable() {
        let out = render(r#"Hello {{ userName | default: "friend" }}!"#, &json!({})).unwrap();
        assert_eq!(out.body, "Hello friend!");

        let out = render("Hello {{ userName | default: 'friend' }}!", &json!({ "userName": "Bo" }))
            .unwrap();
        assert_eq!(out.body, "Hello Bo!");
    }

    #[test]
    fn null_renders_empty() {
        let out = render("[{{ x }}]", &json!({ "x": null })).unwrap();
        assert_eq!(out.body, "[]");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for bad in [
            "Hello {{ name",
            "Hello name }}",
            "{{ }}",
            "{{ a..b }}",
            "{{ a | upper }}",
            "{{ a | default: friend }}",
            "{{ a | default: \"x\" y }}",
            "{{ a {{ b }} }}",
        ] {
            assert!(
                matches!(render(bad, &json!({ "a": 1, "name": "x" })), Err(RenderError::Malformed { .. })),
                "expected malformed: {bad}"
            );
        }
    }

    #[test]
    fn required_variables_skip_defaults() {
        let vars = required_variables(
            r#"{{ a }} {{ b | default: "x" }} {{ c.d }} {{ a }}"#,
        )
        .unwrap();
        assert_eq!(vars, vec!["a", "c.d"]);
    }

    #[test]
    fn plain_text_passes_through() {
        let out = render("no placeholders here", &json!({})).unwrap();
        assert_eq!(out.body, "no placeholders here");
        assert!(!has_placeholders("no placeholders here"));
    }
}
