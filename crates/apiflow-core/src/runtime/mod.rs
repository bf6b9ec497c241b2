//! Per-run variable state and path resolution.
//!
//! A [`VariableStore`] lives for exactly one test-case run. It holds the
//! global variables (seeded from the flow graph, extended by extraction
//! rules) and the `{request, response}` pair recorded for every executed
//! node. Step results are write-once.

pub mod functions;
pub mod params;
pub mod path;

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use path::{ExchangeSide, extract, flatten_exchange};

/// What a node left behind for later steps to reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepResult {
    Exchange { request: Value, response: Value },
    /// Parallel groups record each successful branch's response by branch id.
    Parallel { parallel: Map<String, Value> },
}

/// Final state handed back with a test-case result.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableSnapshot {
    pub variables: Map<String, Value>,
    pub step_results: HashMap<String, StepResult>,
}

#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    variables: Map<String, Value>,
    step_results: HashMap<String, StepResult>,
    current_step_id: Option<String>,
}

impl VariableStore {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            variables: initial,
            ..Default::default()
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Record a node's result. A second write for the same id is ignored.
    pub fn set_step_result(&mut self, step_id: impl Into<String>, result: StepResult) {
        let step_id = step_id.into();
        if self.step_results.contains_key(&step_id) {
            warn!(step_id = %step_id, "Step result already recorded, keeping the first one");
            return;
        }
        self.step_results.insert(step_id, result);
    }

    pub fn step_results(&self) -> &HashMap<String, StepResult> {
        &self.step_results
    }

    pub fn set_current_step(&mut self, step_id: impl Into<String>) {
        self.current_step_id = Some(step_id.into());
    }

    /// True when `id` names a node that has already recorded a result.
    pub fn has_step(&self, id: &str) -> bool {
        self.step_results.contains_key(id)
    }

    pub fn snapshot(&self) -> VariableSnapshot {
        VariableSnapshot {
            variables: self.variables.clone(),
            step_results: self.step_results.clone(),
        }
    }

    /// Resolve a dotted reference.
    ///
    /// - `name` → global variable
    /// - `current.…` → the executing node's id is substituted for `current`
    /// - `<id>.response[.rest]` / `<id>.request[.rest]` → that step's
    ///   recorded exchange, with `rest` evaluated against the flattened view
    /// - `<id>.parallel.<branch>[.rest]` → a branch response of a parallel group
    /// - anything else → the full dotted key, or a nested lookup in the
    ///   globals
    ///
    /// Misses resolve to `None`.
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        if !path.contains('.') {
            return self.variables.get(path).cloned();
        }

        let (head, tail) = path.split_once('.')?;
        let head = match (head, self.current_step_id.as_deref()) {
            ("current", Some(current)) => current,
            _ => head,
        };
        let (section, rest) = match tail.split_once('.') {
            Some((section, rest)) => (section, Some(rest)),
            None => (tail, None),
        };

        match section {
            "response" | "request" => {
                let Some(StepResult::Exchange { request, response }) = self.step_results.get(head)
                else {
                    return None;
                };
                let (side, record) = if section == "response" {
                    (ExchangeSide::Response, response)
                } else {
                    (ExchangeSide::Request, request)
                };
                match rest {
                    None => Some(record.clone()),
                    Some(rest) => extract(&flatten_exchange(side, record, rest), rest),
                }
            }
            _ => {
                let full = format!("{head}.{tail}");
                if let Some(value) = self.variables.get(&full) {
                    return Some(value.clone());
                }
                if section == "parallel" {
                    if let Some(found) = self.resolve_branch(head, rest) {
                        return Some(found);
                    }
                }
                extract(&Value::Object(self.variables.clone()), &full)
            }
        }
    }

    fn resolve_branch(&self, group_id: &str, rest: Option<&str>) -> Option<Value> {
        let Some(StepResult::Parallel { parallel }) = self.step_results.get(group_id) else {
            return None;
        };
        let rest = rest?;
        let (branch_id, field) = match rest.split_once('.') {
            Some((branch_id, field)) => (branch_id, Some(field)),
            None => (rest, None),
        };
        let response = parallel.get(branch_id)?;
        match field {
            None => Some(response.clone()),
            Some(field) => extract(
                &flatten_exchange(ExchangeSide::Response, response, field),
                field,
            ),
        }
    }
}

/// Text form used when a value is spliced into a string. Strings are
/// inserted raw and `null` becomes the empty string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
