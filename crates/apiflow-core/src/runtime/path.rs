//! JSONPath-lite extraction and the flattened request/response view.
//!
//! Supported syntax: `$`, `.name`, `['name']`, `[n]` (negative counts from
//! the end), `*`, `[*]` and `..name` descendant search. A bare numeric
//! segment (`data.0.id`) indexes arrays. Extraction never fails: anything
//! unparsable or unmatched yields `None`.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static BARE_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\.)(\d+)\.").expect("failed to compile bare index regex")
});

/// Rewrite bare numeric segments into bracket form and anchor at `$`.
///
/// `0.userId` → `$.[0].userId`, `data.0.name` → `$.data[0].name`.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let bracketed = BARE_INDEX.replace_all(path, "[${1}].").into_owned();
    if bracketed.starts_with('$') {
        bracketed
    } else {
        format!("$.{bracketed}")
    }
}

/// First value matched by `path` inside `context`.
pub fn extract(context: &Value, path: &str) -> Option<Value> {
    let segments = parse(&normalize_path(path))?;
    let mut current = vec![context];
    for segment in &segments {
        current = apply(segment, current);
        if current.is_empty() {
            return None;
        }
    }
    current.first().map(|v| (*v).clone())
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    Descendant(Box<Segment>),
}

fn parse(path: &str) -> Option<Vec<Segment>> {
    let rest = path.strip_prefix('$')?;
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' if chars.get(i + 1) == Some(&'.') => {
                i += 2;
                let (inner, next) = match chars.get(i) {
                    Some('[') => parse_bracket(&chars, i)?,
                    _ => parse_name(&chars, i)?,
                };
                segments.push(Segment::Descendant(Box::new(inner)));
                i = next;
            }
            '.' if chars.get(i + 1) == Some(&'[') => i += 1,
            '.' => {
                let (segment, next) = parse_name(&chars, i + 1)?;
                segments.push(segment);
                i = next;
            }
            '[' => {
                let (segment, next) = parse_bracket(&chars, i)?;
                segments.push(segment);
                i = next;
            }
            _ => return None,
        }
    }
    Some(segments)
}

fn parse_name(chars: &[char], start: usize) -> Option<(Segment, usize)> {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    let name: String = chars[start..end].iter().collect();
    let name = name.trim();
    match name {
        "" => None,
        "*" => Some((Segment::Wildcard, end)),
        _ => Some((Segment::Field(name.to_string()), end)),
    }
}

fn parse_bracket(chars: &[char], open: usize) -> Option<(Segment, usize)> {
    let mut i = open + 1;
    if let Some(&quote) = chars.get(i).filter(|c| **c == '\'' || **c == '"') {
        i += 1;
        let mut name = String::new();
        loop {
            match chars.get(i)? {
                '\\' => {
                    name.push(*chars.get(i + 1)?);
                    i += 2;
                }
                c if *c == quote => {
                    i += 1;
                    break;
                }
                c => {
                    name.push(*c);
                    i += 1;
                }
            }
        }
        return (chars.get(i) == Some(&']')).then_some((Segment::Field(name), i + 1));
    }

    let close = open + chars[open..].iter().position(|c| *c == ']')?;
    let inner: String = chars[open + 1..close].iter().collect();
    let inner = inner.trim();
    let segment = if inner == "*" {
        Segment::Wildcard
    } else {
        Segment::Index(inner.parse().ok()?)
    };
    Some((segment, close + 1))
}

fn apply<'a>(segment: &Segment, values: Vec<&'a Value>) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for value in values {
        match segment {
            Segment::Field(name) => match value {
                Value::Object(map) => out.extend(map.get(name)),
                Value::Array(items) => {
                    if let Ok(index) = name.parse::<usize>() {
                        out.extend(items.get(index));
                    }
                }
                _ => {}
            },
            Segment::Index(index) => {
                if let Value::Array(items) = value {
                    let resolved = if *index < 0 {
                        items.len().checked_sub(index.unsigned_abs() as usize)
                    } else {
                        Some(*index as usize)
                    };
                    out.extend(resolved.and_then(|i| items.get(i)));
                }
            }
            Segment::Wildcard => match value {
                Value::Object(map) => out.extend(map.values()),
                Value::Array(items) => out.extend(items.iter()),
                _ => {}
            },
            Segment::Descendant(inner) => {
                let mut all = Vec::new();
                collect_descendants(value, &mut all);
                out.extend(apply(inner, all));
            }
        }
    }
    out
}

fn collect_descendants<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(value);
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_descendants(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_descendants(v, out)),
        _ => {}
    }
}

// ============================================================================
// Flattened context
// ============================================================================

/// Which half of a recorded exchange is being flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeSide {
    Request,
    Response,
}

/// True when `field` addresses an array root directly (`0.id`, `[2]`).
pub fn addresses_index(field: &str) -> bool {
    field
        .trim_start_matches("$.")
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '[')
}

/// Build the view that short field paths are evaluated against.
///
/// Responses expose `status` and `headers`; requests expose `method`, `url`,
/// `headers` and `params`. An object body has its keys lifted to the root
/// and is also kept under `body`. An array body becomes the root itself
/// when `field` starts with an index, otherwise it is reachable only as
/// `body`.
pub fn flatten_exchange(side: ExchangeSide, record: &Value, field: &str) -> Value {
    let (body_key, base_keys): (&str, &[&str]) = match side {
        ExchangeSide::Response => ("body", &["status", "headers"]),
        ExchangeSide::Request => ("json", &["method", "url", "headers", "params"]),
    };
    let body = record.get(body_key).cloned().unwrap_or(Value::Null);

    if body.is_array() && addresses_index(field) {
        return body;
    }

    let mut context = Map::new();
    for key in base_keys {
        context.insert(
            (*key).to_string(),
            record.get(*key).cloned().unwrap_or(Value::Null),
        );
    }
    if let Value::Object(fields) = &body {
        for (key, value) in fields {
            match side {
                // Body fields shadow status/headers on responses.
                ExchangeSide::Response => {
                    context.insert(key.clone(), value.clone());
                }
                ExchangeSide::Request => {
                    context.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
    context.insert("body".to_string(), body);
    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_bare_indices() {
        assert_eq!(normalize_path("0.userId"), "$.[0].userId");
        assert_eq!(normalize_path("data.0.name"), "$.data[0].name");
        assert_eq!(normalize_path("$.data.id"), "$.data.id");
        assert_eq!(normalize_path("token"), "$.token");
    }

    #[test]
    fn bare_and_bracket_indices_are_equivalent() {
        let ctx = json!([{"userId": 7}, {"userId": 8}]);
        assert_eq!(extract(&ctx, "0.userId"), Some(json!(7)));
        assert_eq!(extract(&ctx, "[0].userId"), extract(&ctx, "0.userId"));
        assert_eq!(extract(&ctx, "[1].userId"), Some(json!(8)));
    }

    #[test]
    fn nested_fields_and_quoted_keys() {
        let ctx = json!({"data": {"items": [{"id": "a"}, {"id": "b"}], "odd key": 1}});
        assert_eq!(extract(&ctx, "data.items[1].id"), Some(json!("b")));
        assert_eq!(extract(&ctx, "data.items.0.id"), Some(json!("a")));
        assert_eq!(extract(&ctx, "$.data['odd key']"), Some(json!(1)));
        assert_eq!(extract(&ctx, "data.items[-1].id"), Some(json!("b")));
        assert_eq!(extract(&ctx, "data.items.1"), Some(json!({"id": "b"})));
    }

    #[test]
    fn wildcard_and_descendants_return_first_match() {
        let ctx = json!({"a": {"deep": {"token": "t1"}}, "list": [{"n": 1}, {"n": 2}]});
        assert_eq!(extract(&ctx, "list[*].n"), Some(json!(1)));
        assert_eq!(extract(&ctx, "$..token"), Some(json!("t1")));
    }

    #[test]
    fn misses_and_garbage_yield_none() {
        let ctx = json!({"a": 1});
        assert_eq!(extract(&ctx, "b"), None);
        assert_eq!(extract(&ctx, "a.b.c"), None);
        assert_eq!(extract(&ctx, "a[oops"), None);
        assert_eq!(extract(&ctx, "a[x]"), None);
        assert_eq!(extract(&ctx, ""), None);
    }

    #[test]
    fn null_values_are_matches() {
        let ctx = json!({"data": null});
        assert_eq!(extract(&ctx, "data"), Some(Value::Null));
    }

    #[test]
    fn response_flattening_lifts_object_body() {
        let response = json!({"status": 200, "headers": {"x": "1"}, "body": {"token": "abc", "status": "ok"}});
        let flat = flatten_exchange(ExchangeSide::Response, &response, "token");
        assert_eq!(flat["token"], json!("abc"));
        assert_eq!(flat["status"], json!("ok"));
        assert_eq!(flat["body"]["token"], json!("abc"));
        assert_eq!(flat["headers"]["x"], json!("1"));
    }

    #[test]
    fn response_flattening_exposes_array_for_index_fields() {
        let response = json!({"status": 200, "headers": {}, "body": [{"id": 1}]});
        let by_index = flatten_exchange(ExchangeSide::Response, &response, "0.id");
        assert_eq!(extract(&by_index, "0.id"), Some(json!(1)));

        let by_name = flatten_exchange(ExchangeSide::Response, &response, "body");
        assert_eq!(by_name["status"], json!(200));
        assert_eq!(extract(&by_name, "body[0].id"), Some(json!(1)));
    }

    #[test]
    fn request_flattening_keeps_base_fields() {
        let request = json!({"method": "POST", "url": "http://x/y", "headers": {}, "params": {}, "json": {"method": "shadow", "name": "n"}});
        let flat = flatten_exchange(ExchangeSide::Request, &request, "name");
        assert_eq!(flat["method"], json!("POST"));
        assert_eq!(flat["name"], json!("n"));
        assert_eq!(flat["body"]["method"], json!("shadow"));
    }
}
