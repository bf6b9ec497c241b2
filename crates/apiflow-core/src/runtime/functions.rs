//! Runtime functions invoked from templates as `${{name(args)}}`.
//!
//! Dispatch is by name over a fixed catalog. A string that is exactly one
//! call resolves to the function's native value; calls embedded in larger
//! text are replaced by their string form.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Local;
use chrono::format::{Item, StrftimeItems};
use rand::Rng;
use rand::distr::Alphanumeric;
use regex::{Captures, Regex};
use serde_json::{Number, Value};
use std::fmt::Write;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use super::value_to_text;

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{(\w+)\((.*?)\)\}\}").expect("failed to compile runtime function regex")
});

/// Upper bound on generated string lengths.
const MAX_GENERATED_LEN: usize = 1024;

const PHONE_PREFIXES: &[&str] = &[
    "130", "131", "132", "133", "134", "135", "136", "137", "138", "139", "150", "151", "152",
    "153", "155", "156", "157", "158", "159", "180", "181", "182", "183", "184", "185", "186",
    "187", "188", "189",
];

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("Unknown runtime function: {0}")]
    Unknown(String),

    #[error("{function}: {message}")]
    InvalidArgument { function: String, message: String },
}

fn invalid(function: &str, message: impl Into<String>) -> FunctionError {
    FunctionError::InvalidArgument {
        function: function.to_string(),
        message: message.into(),
    }
}

// ============================================================================
// Template resolution
// ============================================================================

/// Resolve every `${{name(args)}}` call in `text`.
///
/// Calls that fail (unknown name, bad arguments) are logged and left in
/// place as literal text.
pub fn resolve_runtime_functions(text: &str) -> Value {
    let calls: Vec<Captures<'_>> = CALL_RE.captures_iter(text).collect();
    if calls.is_empty() {
        return Value::String(text.to_string());
    }

    if let [only] = calls.as_slice() {
        if only.get(0).is_some_and(|m| m.len() == text.len()) {
            return match invoke(&only[1], &only[2]) {
                Ok(value) => value,
                Err(e) => {
                    error!("Runtime function call failed: {}", e);
                    Value::String(text.to_string())
                }
            };
        }
    }

    let resolved = CALL_RE.replace_all(text, |caps: &Captures<'_>| match invoke(&caps[1], &caps[2]) {
        Ok(value) => value_to_text(&value),
        Err(e) => {
            error!("Runtime function call failed: {}", e);
            caps[0].to_string()
        }
    });
    Value::String(resolved.into_owned())
}

fn invoke(name: &str, raw_args: &str) -> Result<Value, FunctionError> {
    let args = parse_arguments(raw_args);
    call_function(name, &args)
}

// ============================================================================
// Argument parsing
// ============================================================================

/// Parse a call's argument list.
///
/// The strict grammar accepts comma-separated quoted strings, numbers and
/// booleans. Anything else falls back to splitting on commas and stripping
/// quotes, yielding string arguments.
pub fn parse_arguments(raw: &str) -> Vec<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match tokenize_arguments(raw) {
        Ok(args) => args,
        Err(reason) => {
            warn!("Falling back to loose argument parsing for ({}): {}", raw, reason);
            raw.split(',')
                .map(|part| {
                    let part = part.trim().trim_matches(|c| c == '"' || c == '\'');
                    Value::String(part.to_string())
                })
                .collect()
        }
    }
}

fn tokenize_arguments(raw: &str) -> Result<Vec<Value>, String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        while chars.get(i).is_some_and(|c| c.is_whitespace()) {
            i += 1;
        }
        let Some(&c) = chars.get(i) else {
            // A trailing comma is allowed, an empty argument is not.
            if args.is_empty() {
                return Err("empty argument list".to_string());
            }
            break;
        };

        let (value, next) = if c == '"' || c == '\'' {
            read_quoted(&chars, i)?
        } else {
            read_bare(&chars, i)?
        };
        args.push(value);
        i = next;

        while chars.get(i).is_some_and(|c| c.is_whitespace()) {
            i += 1;
        }
        match chars.get(i) {
            None => break,
            Some(',') => i += 1,
            Some(other) => return Err(format!("unexpected '{other}' at {i}")),
        }
    }
    Ok(args)
}

fn read_quoted(chars: &[char], open: usize) -> Result<(Value, usize), String> {
    let quote = chars[open];
    let mut text = String::new();
    let mut i = open + 1;
    loop {
        match chars.get(i) {
            None => return Err("unterminated string".to_string()),
            Some('\\') => {
                let escaped = chars.get(i + 1).ok_or("dangling escape")?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            Some(c) if *c == quote => return Ok((Value::String(text), i + 1)),
            Some(c) => {
                text.push(*c);
                i += 1;
            }
        }
    }
}

fn read_bare(chars: &[char], start: usize) -> Result<(Value, usize), String> {
    let mut end = start;
    while end < chars.len() && chars[end] != ',' && !chars[end].is_whitespace() {
        end += 1;
    }
    let token: String = chars[start..end].iter().collect();
    let value = match token.as_str() {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => parse_number(&token).ok_or_else(|| format!("bad literal '{token}'"))?,
    };
    Ok((value, end))
}

fn parse_number(token: &str) -> Option<Value> {
    if let Ok(i) = token.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    token
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
        .map(Value::Number)
}

// ============================================================================
// Catalog
// ============================================================================

/// Invoke a catalog function with already-parsed arguments.
pub fn call_function(name: &str, args: &[Value]) -> Result<Value, FunctionError> {
    let mut rng = rand::rng();
    let value = match name {
        "random" => {
            let length = int_arg(name, args, 0, 8)?;
            Value::String(random_digits(&mut rng, generated_len(length)))
        }
        "randomInt" => {
            let min = int_arg(name, args, 0, 0)?;
            let max = int_arg(name, args, 1, 1000)?;
            if min > max {
                return Err(invalid(name, format!("min {min} exceeds max {max}")));
            }
            Value::Number(rng.random_range(min..=max).into())
        }
        "uuid" | "guid" => Value::String(Uuid::new_v4().to_string()),
        "randomString" => {
            let length = int_arg(name, args, 0, 10)?;
            Value::String(random_alnum(&mut rng, generated_len(length)))
        }
        "randomEmail" => Value::String(format!("{}@example.com", random_alnum(&mut rng, 8))),
        "randomPhone" => {
            let prefix = PHONE_PREFIXES[rng.random_range(0..PHONE_PREFIXES.len())];
            Value::String(format!("{prefix}{}", random_digits(&mut rng, 8)))
        }
        "timestamp" => Value::Number(Local::now().timestamp().into()),
        "timestampMs" => Value::Number(Local::now().timestamp_millis().into()),
        "datetime" => {
            let pattern = text_arg(args, 0).unwrap_or_else(|| "%Y-%m-%d %H:%M:%S".to_string());
            Value::String(format_now(name, &pattern)?)
        }
        "date" => Value::String(format_now(name, "%Y-%m-%d")?),
        "time" => Value::String(format_now(name, "%H:%M:%S")?),
        "base64Encode" => {
            let text = required_text(name, args)?;
            Value::String(BASE64_STANDARD.encode(text.as_bytes()))
        }
        "base64Decode" => {
            let text = required_text(name, args)?;
            let bytes = BASE64_STANDARD
                .decode(text.trim())
                .map_err(|e| invalid(name, e.to_string()))?;
            Value::String(String::from_utf8(bytes).map_err(|e| invalid(name, e.to_string()))?)
        }
        "urlEncode" => {
            let text = required_text(name, args)?;
            Value::String(urlencoding::encode(&text).into_owned())
        }
        "md5" => {
            let text = required_text(name, args)?;
            Value::String(format!("{:x}", md5::compute(text.as_bytes())))
        }
        "randomBoolean" => Value::Bool(rng.random_bool(0.5)),
        "randomFloat" => {
            let min = float_arg(name, args, 0, 0.0)?;
            let max = float_arg(name, args, 1, 1.0)?;
            let decimals = int_arg(name, args, 2, 2)?.clamp(0, 15) as i32;
            let raw = if min < max {
                rng.random_range(min..=max)
            } else {
                min
            };
            let factor = 10f64.powi(decimals);
            Number::from_f64((raw * factor).round() / factor)
                .map(Value::Number)
                .ok_or_else(|| invalid(name, "result is not a finite number"))?
        }
        other => return Err(FunctionError::Unknown(other.to_string())),
    };
    Ok(value)
}

fn generated_len(requested: i64) -> usize {
    usize::try_from(requested.max(0)).map_or(MAX_GENERATED_LEN, |len| len.min(MAX_GENERATED_LEN))
}

fn random_digits(rng: &mut impl Rng, length: usize) -> String {
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

fn random_alnum(rng: &mut impl Rng, length: usize) -> String {
    (0..length)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}

/// Format the local time, accepting `YYYY-MM-DD HH:mm:ss` style tokens as
/// well as strftime directives.
fn format_now(function: &str, pattern: &str) -> Result<String, FunctionError> {
    let pattern = pattern
        .replace("YYYY", "%Y")
        .replace("MM", "%m")
        .replace("DD", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S");
    let items: Vec<Item<'_>> = StrftimeItems::new(&pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(invalid(function, format!("bad format string '{pattern}'")));
    }
    let mut out = String::new();
    write!(out, "{}", Local::now().format_with_items(items.into_iter()))
        .map_err(|_| invalid(function, format!("cannot format with '{pattern}'")))?;
    Ok(out)
}

fn text_arg(args: &[Value], index: usize) -> Option<String> {
    args.get(index).map(value_to_text)
}

fn required_text(function: &str, args: &[Value]) -> Result<String, FunctionError> {
    text_arg(args, 0).ok_or_else(|| invalid(function, "missing text argument"))
}

fn int_arg(function: &str, args: &[Value], index: usize, default: i64) -> Result<i64, FunctionError> {
    match args.get(index) {
        None => Ok(default),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| invalid(function, format!("argument {index} is not an integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| invalid(function, format!("argument {index} is not an integer: {s}"))),
        Some(other) => Err(invalid(function, format!("argument {index} is not an integer: {other}"))),
    }
}

fn float_arg(function: &str, args: &[Value], index: usize, default: f64) -> Result<f64, FunctionError> {
    match args.get(index) {
        None => Ok(default),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| invalid(function, format!("argument {index} is not a number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| invalid(function, format!("argument {index} is not a number: {s}"))),
        Some(other) => Err(invalid(function, format!("argument {index} is not a number: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_call_keeps_native_type() {
        let value = resolve_runtime_functions("${{randomInt(5, 5)}}");
        assert_eq!(value, json!(5));
        assert!(resolve_runtime_functions("${{randomBoolean()}}").is_boolean());
        assert!(resolve_runtime_functions("${{timestamp()}}").is_i64());
    }

    #[test]
    fn embedded_calls_are_stringified() {
        let value = resolve_runtime_functions("user_${{randomInt(7, 7)}}_${{md5('abc')}}");
        assert_eq!(value, json!("user_7_900150983cd24fb0d6963f7d28e17f72"));
    }

    #[test]
    fn uuid_is_not_memoized() {
        let a = resolve_runtime_functions("${{uuid()}}");
        let b = resolve_runtime_functions("${{uuid()}}");
        assert_ne!(a, b);
        assert_eq!(a.as_str().map(str::len), Some(36));
    }

    #[test]
    fn unknown_function_is_left_as_text() {
        assert_eq!(
            resolve_runtime_functions("${{nope()}}"),
            json!("${{nope()}}")
        );
        assert_eq!(
            resolve_runtime_functions("id-${{nope(1)}}-${{randomInt(2,2)}}"),
            json!("id-${{nope(1)}}-2")
        );
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(resolve_runtime_functions("hello"), json!("hello"));
    }

    #[test]
    fn strict_arguments() {
        assert_eq!(
            parse_arguments(r#"1, -2.5, "a,b", 'c', true,"#),
            vec![json!(1), json!(-2.5), json!("a,b"), json!("c"), json!(true)]
        );
        assert!(parse_arguments("  ").is_empty());
    }

    #[test]
    fn loose_fallback_splits_on_commas() {
        assert_eq!(
            parse_arguments("YYYY-MM-DD, 'x"),
            vec![json!("YYYY-MM-DD"), json!("x")]
        );
    }

    #[test]
    fn generated_lengths_are_capped() {
        let digits = call_function("random", &[json!(1_000_000_000)]).unwrap();
        assert_eq!(digits.as_str().map(str::len), Some(MAX_GENERATED_LEN));

        let text = call_function("randomString", &[json!("1000000000")]).unwrap();
        assert_eq!(text.as_str().map(str::len), Some(MAX_GENERATED_LEN));

        let empty = call_function("randomString", &[json!(-3)]).unwrap();
        assert_eq!(empty, json!(""));
    }

    #[test]
    fn random_lengths() {
        let digits = call_function("random", &[json!(12)]).unwrap();
        let digits = digits.as_str().unwrap();
        assert_eq!(digits.len(), 12);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));

        let text = call_function("randomString", &[json!("4")]).unwrap();
        assert_eq!(text.as_str().map(str::len), Some(4));

        let email = call_function("randomEmail", &[]).unwrap();
        assert!(email.as_str().unwrap().ends_with("@example.com"));

        let phone = call_function("randomPhone", &[]).unwrap();
        assert_eq!(phone.as_str().map(str::len), Some(11));
    }

    #[test]
    fn encoding_functions() {
        assert_eq!(call_function("base64Encode", &[json!("hi there")]).unwrap(), json!("aGkgdGhlcmU="));
        assert_eq!(call_function("base64Decode", &[json!("aGkgdGhlcmU=")]).unwrap(), json!("hi there"));
        assert_eq!(call_function("urlEncode", &[json!("a b&c")]).unwrap(), json!("a%20b%26c"));
        assert!(call_function("base64Decode", &[json!("%%%")]).is_err());
        assert!(call_function("md5", &[]).is_err());
    }

    #[test]
    fn datetime_accepts_both_token_styles() {
        let dashed = call_function("datetime", &[json!("YYYY-MM-DD")]).unwrap();
        let native = call_function("datetime", &[json!("%Y-%m-%d")]).unwrap();
        assert_eq!(dashed.as_str().map(str::len), Some(10));
        assert_eq!(native.as_str().map(str::len), Some(10));
        assert_eq!(call_function("date", &[]).unwrap().as_str().map(str::len), Some(10));
        assert_eq!(call_function("time", &[]).unwrap().as_str().map(str::len), Some(8));
    }

    #[test]
    fn random_float_rounds() {
        let value = call_function("randomFloat", &[json!(1), json!(2), json!(1)]).unwrap();
        let f = value.as_f64().unwrap();
        assert!((1.0..=2.0).contains(&f));
        assert!(((f * 10.0).round() - f * 10.0).abs() < 1e-9);
    }

    #[test]
    fn random_int_rejects_inverted_range() {
        assert!(matches!(
            call_function("randomInt", &[json!(5), json!(1)]),
            Err(FunctionError::InvalidArgument { .. })
        ));
        assert!(matches!(
            call_function("bogus", &[]),
            Err(FunctionError::Unknown(name)) if name == "bogus"
        ));
    }
}
