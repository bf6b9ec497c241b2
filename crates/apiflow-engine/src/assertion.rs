//! Assertion evaluation against a response or an explicit context.

use std::sync::LazyLock;

use apiflow_core::runtime::path::{ExchangeSide, extract, flatten_exchange};
use apiflow_core::runtime::{VariableStore, value_to_text};
use apiflow_core::{Assertion, AssertionOperator, AssertionResult, ExpectedType};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// `${path}` or `$(path)` inside an expected value.
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^{}]+)\}|\$\(([^()]+)\)").expect("reference pattern is valid")
});

/// What a field path is evaluated against when it is not a step reference.
#[derive(Debug, Clone, Copy)]
pub enum AssertionScope<'a> {
    /// A raw `{status, headers, body}` response, flattened per field.
    Response(&'a Value),
    /// A prebuilt context, read as-is.
    Context(&'a Value),
}

impl AssertionScope<'_> {
    fn lookup(&self, field: &str) -> Option<Value> {
        match self {
            AssertionScope::Response(response) => extract(
                &flatten_exchange(ExchangeSide::Response, response, field),
                field,
            ),
            AssertionScope::Context(context) => extract(context, field),
        }
    }
}

/// True when `path` addresses recorded step data rather than a field of the
/// response at hand: it starts with `step_` or `current.`, or its first
/// segment names a step that already ran.
pub fn is_step_reference(path: &str, store: &VariableStore) -> bool {
    let path = path.trim();
    if path.starts_with("step_") || path.starts_with("current.") {
        return true;
    }
    match path.split_once('.') {
        Some((head, _)) => store.has_step(head),
        None => false,
    }
}

/// Evaluate assertions in order. With `stop_on_failure`, evaluation ends at
/// the first failure and later assertions are not reported.
pub fn execute_assertions(
    assertions: &[Assertion],
    scope: AssertionScope<'_>,
    store: &VariableStore,
    stop_on_failure: bool,
) -> Vec<AssertionResult> {
    let mut results = Vec::with_capacity(assertions.len());
    for assertion in assertions {
        let result = evaluate_assertion(assertion, scope, store);
        let failed = !result.success;
        results.push(result);
        if failed && stop_on_failure {
            break;
        }
    }
    results
}

pub fn evaluate_assertion(
    assertion: &Assertion,
    scope: AssertionScope<'_>,
    store: &VariableStore,
) -> AssertionResult {
    let actual = if is_step_reference(&assertion.field, store) {
        store.resolve_path(&assertion.field)
    } else {
        scope.lookup(&assertion.field)
    }
    .unwrap_or(Value::Null);

    let expected = match &assertion.expected {
        Value::String(text) => resolve_expected_references(text, store),
        other => other.clone(),
    };
    let expected = coerce_expected(expected, assertion.expected_type);

    let (success, message) = compare(&actual, &assertion.operator, &expected);
    debug!(
        field = %assertion.field,
        operator = assertion.operator.as_str(),
        success,
        "Assertion evaluated"
    );

    AssertionResult {
        field: assertion.field.clone(),
        operator: assertion.operator.as_str().to_string(),
        expected,
        actual,
        success,
        message,
    }
}

/// A string that is exactly one reference keeps the referenced value's type;
/// references embedded in text are spliced in as text.
fn resolve_expected_references(text: &str, store: &VariableStore) -> Value {
    let path_of = |caps: &regex::Captures<'_>| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default()
    };

    let mut matches = REFERENCE.captures_iter(text);
    let Some(first) = matches.next() else {
        return Value::String(text.to_string());
    };
    let whole = first.get(0).is_some_and(|m| m.start() == 0 && m.end() == text.len());
    if whole && matches.next().is_none() {
        return store.resolve_path(&path_of(&first)).unwrap_or(Value::Null);
    }

    let replaced = REFERENCE.replace_all(text, |caps: &regex::Captures<'_>| {
        store
            .resolve_path(&path_of(caps))
            .map(|v| value_to_text(&v))
            .unwrap_or_default()
    });
    Value::String(replaced.into_owned())
}

fn coerce_expected(expected: Value, expected_type: ExpectedType) -> Value {
    match expected_type {
        ExpectedType::Auto => match &expected {
            Value::String(text) => infer_literal(text).unwrap_or(expected),
            _ => expected,
        },
        ExpectedType::String => Value::String(value_to_text(&expected)),
        ExpectedType::Number => match &expected {
            Value::String(text) => parse_number(text).unwrap_or(expected),
            _ => expected,
        },
        ExpectedType::Boolean => match &expected {
            Value::String(text) => {
                Value::Bool(matches!(text.to_lowercase().as_str(), "true" | "1" | "yes"))
            }
            other => Value::Bool(truthy(other)),
        },
        ExpectedType::Object | ExpectedType::Array => match &expected {
            Value::String(text) => serde_json::from_str(text).unwrap_or(expected),
            _ => expected,
        },
    }
}

fn infer_literal(text: &str) -> Option<Value> {
    if let Some(number) = parse_number(text) {
        return Some(number);
    }
    match text.to_lowercase().as_str() {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    serde_json::from_str(text).ok()
}

/// Float when the text has a `.`, integer otherwise.
fn parse_number(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.contains('.') {
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
    } else {
        text.parse::<i64>().ok().map(Value::from)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality where `1` and `1.0` compare equal, recursively.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if x.is_f64() || y.is_f64() {
                x.as_f64() == y.as_f64()
            } else {
                x == y
            }
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loose_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| loose_eq(x, y)))
        }
        _ => a == b,
    }
}

fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match actual {
        Value::String(text) => Some(text.contains(&value_to_text(expected))),
        Value::Array(items) => Some(items.iter().any(|item| loose_eq(item, expected))),
        Value::Object(map) => Some(map.values().any(|item| loose_eq(item, expected))),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        other => value_to_text(other),
    }
}

fn compare(actual: &Value, operator: &AssertionOperator, expected: &Value) -> (bool, String) {
    let (a, e) = (render(actual), render(expected));
    match operator {
        AssertionOperator::Equals => (loose_eq(actual, expected), format!("expected {a} == {e}")),
        AssertionOperator::NotEquals => {
            (!loose_eq(actual, expected), format!("expected {a} != {e}"))
        }
        AssertionOperator::Contains => (
            contains(actual, expected).unwrap_or(false),
            format!("expected {a} to contain {e}"),
        ),
        AssertionOperator::NotContains => (
            contains(actual, expected).map_or(true, |found| !found),
            format!("expected {a} not to contain {e}"),
        ),
        AssertionOperator::GreaterThan | AssertionOperator::LessThan => {
            let symbol = if *operator == AssertionOperator::GreaterThan { ">" } else { "<" };
            match (as_number(actual), as_number(expected)) {
                (Some(x), Some(y)) => {
                    let success = if symbol == ">" { x > y } else { x < y };
                    (success, format!("expected {a} {symbol} {e}"))
                }
                _ => (
                    false,
                    format!("comparison failed: {a} {symbol} {e} needs two numbers"),
                ),
            }
        }
        AssertionOperator::Exists => (
            !actual.is_null(),
            format!("expected field to exist, exists: {}", !actual.is_null()),
        ),
        AssertionOperator::NotExists => (
            actual.is_null(),
            format!("expected field to be absent, absent: {}", actual.is_null()),
        ),
        AssertionOperator::Unknown(name) => (false, format!("unknown assertion operator: {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiflow_core::runtime::StepResult;
    use serde_json::json;

    fn assertion(field: &str, operator: &str, expected: Value) -> Assertion {
        serde_json::from_value(json!({
            "field": field,
            "operator": operator,
            "expected": expected,
        }))
        .unwrap()
    }

    fn typed(field: &str, operator: &str, expected: Value, expected_type: &str) -> Assertion {
        serde_json::from_value(json!({
            "field": field,
            "operator": operator,
            "expected": expected,
            "expectedType": expected_type,
        }))
        .unwrap()
    }

    fn check(actual: Value, operator: &str, expected: Value) -> bool {
        let context = json!({"value": actual});
        evaluate_assertion(
            &assertion("value", operator, expected),
            AssertionScope::Context(&context),
            &VariableStore::default(),
        )
        .success
    }

    fn store_with_step_1() -> VariableStore {
        let mut store = VariableStore::default();
        store.set_step_result(
            "step_1",
            StepResult::Exchange {
                request: json!({}),
                response: json!({"status": 200, "headers": {}, "body": {"data": {"id": "abc", "n": 3}}}),
            },
        );
        store
    }

    #[test]
    fn contains_covers_text_sequences_and_mappings() {
        assert!(check(json!("hello world"), "contains", json!("world")));
        assert!(check(json!([1, 2, 3]), "contains", json!(2)));
        assert!(check(json!({"a": 1}), "contains", json!(1)));
        assert!(!check(json!(42), "contains", json!(4)));
        assert!(check(json!(42), "notContains", json!(4)));
        assert!(check(json!(["x"]), "notContains", json!("y")));
    }

    #[test]
    fn full_reference_keeps_native_value() {
        let store = store_with_step_1();
        let response = json!({"status": 200, "headers": {}, "body": {"token": "abc"}});
        let result = evaluate_assertion(
            &assertion("token", "equals", json!("${step_1.response.data.id}")),
            AssertionScope::Response(&response),
            &store,
        );
        assert!(result.success, "{}", result.message);
        assert_eq!(result.expected, json!("abc"));
        assert_eq!(result.actual, json!("abc"));
    }

    #[test]
    fn full_reference_to_number_stays_numeric() {
        let store = store_with_step_1();
        let response = json!({"status": 200, "headers": {}, "body": {"count": 3}});
        let result = evaluate_assertion(
            &assertion("count", "equals", json!("$(step_1.response.data.n)")),
            AssertionScope::Response(&response),
            &store,
        );
        assert!(result.success);
        assert_eq!(result.expected, json!(3));
    }

    #[test]
    fn partial_references_interpolate_text() {
        let store = store_with_step_1();
        let response = json!({"status": 200, "headers": {}, "body": {"path": "/users/abc/3"}});
        let result = evaluate_assertion(
            &assertion(
                "path",
                "equals",
                json!("/users/${step_1.response.data.id}/${step_1.response.data.n}"),
            ),
            AssertionScope::Response(&response),
            &store,
        );
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn step_fields_resolve_through_the_store() {
        let store = store_with_step_1();
        let empty = json!({});
        let result = evaluate_assertion(
            &assertion("step_1.response.data.id", "equals", json!("abc")),
            AssertionScope::Context(&empty),
            &store,
        );
        assert!(result.success);
    }

    #[test]
    fn auto_coercion() {
        assert!(check(json!(200), "equals", json!("200")));
        assert!(check(json!(1.5), "equals", json!("1.5")));
        assert!(check(json!(true), "equals", json!("TRUE")));
        assert!(check(json!([1, 2]), "equals", json!("[1,2]")));
        assert!(check(json!("plain"), "equals", json!("plain")));
        assert!(check(json!(2), "equals", json!(2.0)));
    }

    #[test]
    fn explicit_types() {
        let context = json!({"v": "200", "flag": true, "obj": {"a": 1}});
        let store = VariableStore::default();
        let run = |a: Assertion| {
            evaluate_assertion(&a, AssertionScope::Context(&context), &store).success
        };
        assert!(run(typed("v", "equals", json!("200"), "string")));
        assert!(!run(typed("v", "equals", json!("200"), "number")));
        assert!(run(typed("flag", "equals", json!("yes"), "boolean")));
        assert!(run(typed("obj", "equals", json!("{\"a\": 1}"), "object")));
    }

    #[test]
    fn ordering_comparisons() {
        assert!(check(json!(10), "greaterThan", json!("9")));
        assert!(check(json!("3"), "lessThan", json!(4)));
        assert!(!check(json!(3), "greaterThan", json!(3)));

        let context = json!({"value": null});
        let result = evaluate_assertion(
            &assertion("value", "greaterThan", json!(1)),
            AssertionScope::Context(&context),
            &VariableStore::default(),
        );
        assert!(!result.success);
        assert!(result.message.starts_with("comparison failed"));
    }

    #[test]
    fn existence_checks() {
        let response = json!({"status": 200, "headers": {}, "body": {"id": 1}});
        let store = VariableStore::default();
        let exists = assertion("id", "exists", Value::Null);
        let absent = assertion("missing", "notExists", Value::Null);
        assert!(evaluate_assertion(&exists, AssertionScope::Response(&response), &store).success);
        assert!(evaluate_assertion(&absent, AssertionScope::Response(&response), &store).success);
    }

    #[test]
    fn unknown_operator_fails_with_diagnostic() {
        let result = evaluate_assertion(
            &assertion("value", "matches", json!("x")),
            AssertionScope::Context(&json!({"value": "x"})),
            &VariableStore::default(),
        );
        assert!(!result.success);
        assert_eq!(result.operator, "matches");
        assert!(result.message.contains("matches"));
    }

    #[test]
    fn array_bodies_are_indexed_directly() {
        let response = json!({"status": 200, "headers": {}, "body": [{"id": 5}]});
        let result = evaluate_assertion(
            &assertion("0.id", "equals", json!(5)),
            AssertionScope::Response(&response),
            &VariableStore::default(),
        );
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn stop_on_failure_skips_the_rest() {
        let response = json!({"status": 500, "headers": {}, "body": {}});
        let list = vec![
            assertion("status", "equals", json!(200)),
            assertion("status", "equals", json!(500)),
        ];
        let store = VariableStore::default();
        let stopped = execute_assertions(&list, AssertionScope::Response(&response), &store, true);
        assert_eq!(stopped.len(), 1);
        let all = execute_assertions(&list, AssertionScope::Response(&response), &store, false);
        assert_eq!(all.len(), 2);
        assert!(all[1].success);
        assert!(!all[0].success);
    }

    #[test]
    fn step_reference_heuristic() {
        let store = store_with_step_1();
        assert!(is_step_reference("step_9.response.x", &store));
        assert!(is_step_reference("current.response.status", &store));
        assert!(!is_step_reference("data.token", &store));
        assert!(!is_step_reference("status", &store));

        let mut store = VariableStore::default();
        store.set_step_result(
            "node-a",
            StepResult::Exchange {
                request: json!({}),
                response: json!({}),
            },
        );
        assert!(is_step_reference("node-a.response.id", &store));
    }
}
