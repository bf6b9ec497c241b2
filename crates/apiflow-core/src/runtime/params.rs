use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::VariableStore;
use super::functions::resolve_runtime_functions;
use crate::{ParamValue, RequestConfig};

/// Request config with every parameter resolved to a concrete value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRequestConfig {
    pub path_params: BTreeMap<String, Value>,
    pub query_params: BTreeMap<String, Value>,
    pub headers: BTreeMap<String, Value>,
    pub body: Option<Value>,
}

/// Rebuild a JSON tree, letting `leaf` replace any node it recognizes.
///
/// `leaf` sees every node top-down. Returning `Some` substitutes that node
/// (its children are not visited); returning `None` keeps the node, with
/// objects and arrays rebuilt from their walked children.
pub fn map_tree<F>(value: &Value, leaf: &F) -> Value
where
    F: Fn(&Value) -> Option<Value>,
{
    if let Some(replaced) = leaf(value) {
        return replaced;
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_tree(v, leaf)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_tree(v, leaf)).collect()),
        other => other.clone(),
    }
}

/// Resolve runtime-function templates in every string of a tree.
pub fn resolve_value_with_functions(value: &Value) -> Value {
    map_tree(value, &|node| match node {
        Value::String(text) => Some(resolve_runtime_functions(text)),
        _ => None,
    })
}

/// Parse a string that looks like a JSON array or object literal.
fn parse_json_literal(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let looks_structured = (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'));
    if !looks_structured {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Objects of the form `{"valueType": "fixed"|"variable", ...}`.
fn as_param_value(value: &Value) -> Option<ParamValue> {
    let tag = value.get("valueType")?.as_str()?;
    if tag != "fixed" && tag != "variable" {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

impl VariableStore {
    pub fn resolve_param_value(&self, param: &ParamValue) -> Value {
        match param {
            ParamValue::Fixed { value } => match value {
                Value::String(text) => {
                    parse_json_literal(text).unwrap_or_else(|| value.clone())
                }
                other => other.clone(),
            },
            ParamValue::Variable { variable, template } => {
                let resolved = variable
                    .as_deref()
                    .and_then(|path| self.resolve_path(path))
                    .unwrap_or(Value::Null);
                match template {
                    Some(template) => {
                        Value::String(template.replace("{value}", &super::value_to_text(&resolved)))
                    }
                    None => resolved,
                }
            }
        }
    }

    /// Resolve a param value and then any runtime functions inside it.
    fn resolve_entry(&self, param: &ParamValue) -> Value {
        resolve_value_with_functions(&self.resolve_param_value(param))
    }

    fn resolve_params(&self, params: &BTreeMap<String, ParamValue>) -> BTreeMap<String, Value> {
        params
            .iter()
            .map(|(key, param)| (key.clone(), self.resolve_entry(param)))
            .collect()
    }

    /// Resolve a request body tree, keeping its container structure.
    pub fn resolve_body(&self, body: &Value) -> Value {
        map_tree(body, &|node| match node {
            Value::Object(_) => as_param_value(node).map(|param| self.resolve_entry(&param)),
            Value::String(text) => Some(resolve_runtime_functions(text)),
            _ => None,
        })
    }

    pub fn resolve_request_config(&self, config: &RequestConfig) -> ResolvedRequestConfig {
        ResolvedRequestConfig {
            path_params: self.resolve_params(&config.path_params),
            query_params: self.resolve_params(&config.query_params),
            headers: self.resolve_params(&config.headers),
            body: config.body.as_ref().map(|body| self.resolve_body(body)),
        }
    }
}

/// Substitute `{key}` placeholders literally, without encoding.
pub fn replace_url_params(url: &str, params: &BTreeMap<String, Value>) -> String {
    params.iter().fold(url.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), &super::value_to_text(value))
    })
}
