//! The request pipeline shared by API nodes and parallel branches.

use std::collections::BTreeMap;

use apiflow_core::hooks::{LogLevel, LogType, StepRecordUpdate};
use apiflow_core::runtime::params::replace_url_params;
use apiflow_core::runtime::path::{ExchangeSide, extract, flatten_exchange};
use apiflow_core::runtime::{StepResult, VariableStore, value_to_text};
use apiflow_core::{ApiNodeData, AssertionFailureStrategy, AssertionResult, EnvironmentConfig, WaitConfig};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::trace::{StepTrace, truncate_for_log};
use super::{NodeError, TestCaseExecutor};
use crate::assertion::{AssertionScope, execute_assertions, is_step_reference};
use crate::transport::{HttpRequest, HttpTransport};
use crate::wait::{wait, wait_with_context};

/// Where a call's results land in the variable store.
#[derive(Debug, Clone, Copy)]
pub(crate) enum VariableScope<'a> {
    /// A standalone API node: extracted variables are global and the
    /// exchange is recorded under the node id.
    Global,
    /// A parallel branch: variables are namespaced and the exchange is
    /// reported back to the group instead of recorded.
    Branch { group_id: &'a str, branch_id: &'a str },
}

impl VariableScope<'_> {
    pub fn key(&self, variable: &str) -> String {
        match self {
            VariableScope::Global => variable.to_string(),
            VariableScope::Branch { group_id, branch_id } => {
                format!("{group_id}.parallel.{branch_id}.{variable}")
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct ApiOutcome {
    /// `{method, url, headers, params, json}`
    pub request: Value,
    /// `{status, headers, body}`; absent when the request never completed.
    pub response: Option<Value>,
    pub assertions: Vec<AssertionResult>,
    /// Extracted values keyed by the configured variable name.
    pub extracted: Map<String, Value>,
    pub error: Option<NodeError>,
}

impl ApiOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Drop any literal query string or fragment.
pub(crate) fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

/// Prefix relative URLs with `base`; swap the origin of absolute ones.
pub(crate) fn apply_base_url(url: &str, base: &str) -> String {
    let base = base.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        match url::Url::parse(url) {
            Ok(parsed) => format!("{base}{}", parsed.path()),
            Err(e) => {
                warn!(url, "Could not parse absolute URL, keeping it: {e}");
                url.to_string()
            }
        }
    } else {
        format!("{base}/{}", url.trim_start_matches('/'))
    }
}

/// Apply auth and session injection to resolved headers.
pub(crate) fn inject_environment_headers(
    headers: &mut BTreeMap<String, String>,
    environment: &EnvironmentConfig,
) {
    if let Some((key, value)) = environment.auth_header() {
        headers.insert(key.to_string(), value.to_string());
    }
    if let Some(session) = environment.session_cookies() {
        let existing = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
            .map(|(name, value)| (name.clone(), value.clone()));
        match existing {
            Some((name, value)) if !value.is_empty() => {
                headers.insert(name, format!("{value}; {session}"));
            }
            Some((name, _)) => {
                headers.insert(name, session.to_string());
            }
            None => {
                headers.insert("Cookie".to_string(), session.to_string());
            }
        }
    }
}

/// Query pairs in order; arrays repeat their key and nulls are skipped.
fn query_pairs(params: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => pairs.extend(
                items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| (key.clone(), value_to_text(item))),
            ),
            other => pairs.push((key.clone(), value_to_text(other))),
        }
    }
    pairs
}

fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn display_url(url: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query)
        .finish();
    format!("{url}?{encoded}")
}

impl<T: HttpTransport> TestCaseExecutor<T> {
    /// The URL a node calls before parameter substitution. A canonical URL
    /// from the hooks wins unless the node's own URL carries placeholders.
    fn base_request_url(&self, api: &ApiNodeData) -> String {
        let Some(api_id) = api.api_id.as_deref().filter(|_| !api.url.contains('{')) else {
            return api.url.clone();
        };
        match self.hooks.canonical_api_url(api_id) {
            Ok(Some(url)) if !url.trim().is_empty() => url,
            Ok(_) => api.url.clone(),
            Err(e) => {
                warn!(api_id, "Canonical URL lookup failed: {e:#}");
                api.url.clone()
            }
        }
    }

    /// Build the outbound request from a node config and the current store.
    pub(crate) fn build_request(&self, api: &ApiNodeData, store: &VariableStore) -> (HttpRequest, Value) {
        let resolved = store.resolve_request_config(&api.request_config);

        let url = replace_url_params(&self.base_request_url(api), &resolved.path_params);
        let mut url = strip_query(&url).to_string();
        if let Some(base) = self.environment.base_url() {
            url = apply_base_url(&url, base);
        }

        let mut headers: BTreeMap<String, String> = resolved
            .headers
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value_to_text(value)))
            .collect();
        inject_environment_headers(&mut headers, &self.environment);

        let query = query_pairs(&resolved.query_params);
        let body = resolved.body.filter(|body| !is_empty_body(body));
        let method = api.method.to_uppercase();

        let params: Map<String, Value> = resolved
            .query_params
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        let snapshot = json!({
            "method": method,
            "url": display_url(&url, &query),
            "headers": headers,
            "params": params,
            "json": body.clone().unwrap_or(Value::Null),
        });

        let request = HttpRequest {
            method,
            url,
            headers,
            query,
            body,
        };
        (request, snapshot)
    }

    /// Run one API call end to end: request, record, extract, assert, wait.
    ///
    /// Never fails outright; every problem ends up in `ApiOutcome::error`.
    pub(crate) async fn call_api(
        &self,
        api: &ApiNodeData,
        node_id: &str,
        store: &mut VariableStore,
        scope: VariableScope<'_>,
        trace: &StepTrace,
    ) -> ApiOutcome {
        let (request, request_snapshot) = self.build_request(api, store);
        let target = request_snapshot["url"].as_str().unwrap_or_default().to_string();
        info!(node_id, method = %request.method, url = %target, "Sending API request");
        self.log(
            trace,
            LogLevel::Info,
            LogType::Request,
            format!("{} {target}", request.method),
            Some(request_snapshot.clone()),
        );

        let mut outcome = ApiOutcome {
            request: request_snapshot,
            response: None,
            assertions: Vec::new(),
            extracted: Map::new(),
            error: None,
        };

        self.transport.clear_cookies();
        let started = Instant::now();
        let response = match self.transport.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id, url = %target, "API request failed: {e}");
                outcome.error = Some(e.into());
                return outcome;
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let response_snapshot = response.snapshot();
        info!(node_id, status = response.status, elapsed_ms, "Received API response");

        let mut message = format!("received {}", response.status);
        if !is_empty_body(&response.body) {
            message.push_str(&format!(
                "\nbody: {}",
                truncate_for_log(&value_to_text(&response.body), 500)
            ));
        }
        let level = if (200..300).contains(&response.status) {
            LogLevel::Success
        } else {
            LogLevel::Warning
        };
        self.log(trace, level, LogType::Response, message, Some(response_snapshot.clone()));

        if let VariableScope::Global = scope {
            self.update_step(
                trace,
                &StepRecordUpdate {
                    request: Some(outcome.request.clone()),
                    response: Some(response_snapshot.clone()),
                    response_time_ms: Some(elapsed_ms),
                    ..Default::default()
                },
            );
            store.set_step_result(
                node_id,
                StepResult::Exchange {
                    request: outcome.request.clone(),
                    response: response_snapshot.clone(),
                },
            );
        }

        for rule in &api.response_extract {
            let value = extract(&response_snapshot, &rule.path).unwrap_or(Value::Null);
            debug!(variable = %rule.variable, path = %rule.path, "Extracted variable");
            store.set_variable(scope.key(&rule.variable), value.clone());
            outcome.extracted.insert(rule.variable.clone(), value);
        }
        if !outcome.extracted.is_empty() {
            let listing = outcome
                .extracted
                .iter()
                .map(|(name, value)| format!("\n  {name} = {}", truncate_for_log(&value_to_text(value), 100)))
                .collect::<String>();
            self.log(
                trace,
                LogLevel::Success,
                LogType::Variable,
                format!("extracted {} variables:{listing}", outcome.extracted.len()),
                Some(json!({ "variables": outcome.extracted })),
            );
        }

        if !api.assertions.is_empty() {
            let stop_on_failure = api.assertion_failure_strategy == AssertionFailureStrategy::StopOnFailure;
            outcome.assertions = execute_assertions(
                &api.assertions,
                AssertionScope::Response(&response_snapshot),
                store,
                stop_on_failure,
            );
            let passed = outcome.assertions.iter().filter(|r| r.success).count();
            let failed = outcome.assertions.len() - passed;
            self.log(
                trace,
                if failed == 0 { LogLevel::Success } else { LogLevel::Error },
                LogType::Assertion,
                format!("assertions: {passed} passed, {failed} failed"),
                Some(json!({
                    "total": outcome.assertions.len(),
                    "passed": passed,
                    "failed": failed,
                    "results": outcome.assertions,
                })),
            );
            if let Some(first) = outcome.assertions.iter().find(|r| !r.success) {
                outcome.error = Some(NodeError::Assertion(first.message.clone()));
            }
        }

        outcome.response = Some(response_snapshot);
        if outcome.error.is_none() {
            if let Some(config) = &api.wait {
                if let Err(e) = self.wait_after_call(config, node_id, store, scope, &outcome).await {
                    outcome.error = Some(e);
                }
            }
        }
        outcome
    }

    /// A condition on a bare field reads the response just received; step
    /// references and time waits go through the store.
    async fn wait_after_call(
        &self,
        config: &WaitConfig,
        node_id: &str,
        store: &mut VariableStore,
        scope: VariableScope<'_>,
        outcome: &ApiOutcome,
    ) -> Result<(), NodeError> {
        if let WaitConfig::Condition { condition, .. } = config {
            if !is_step_reference(&condition.variable, store) {
                let response = outcome.response.as_ref().unwrap_or(&Value::Null);
                let context = flatten_exchange(ExchangeSide::Response, response, &condition.variable);
                return wait_with_context(config, &context, &self.config)
                    .await
                    .map_err(NodeError::from);
            }
        }
        if let VariableScope::Global = scope {
            store.set_current_step(node_id);
        }
        wait(config, store, &self.config).await.map_err(NodeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_and_fragment_are_stripped() {
        assert_eq!(strip_query("/users?id=1#top"), "/users");
        assert_eq!(strip_query("/users#top"), "/users");
        assert_eq!(strip_query("/users"), "/users");
    }

    #[test]
    fn base_url_prefixes_relative_and_replaces_origin() {
        assert_eq!(apply_base_url("users/1", "http://qa.test/"), "http://qa.test/users/1");
        assert_eq!(apply_base_url("/users/1", "http://qa.test"), "http://qa.test/users/1");
        assert_eq!(
            apply_base_url("https://prod.example.com/api/users", "http://qa.test/v2"),
            "http://qa.test/v2/api/users"
        );
    }

    #[test]
    fn session_cookie_merges_case_insensitively() {
        let environment = EnvironmentConfig {
            session_enabled: true,
            session_cookies: Some("sid=abc".into()),
            auth_token_enabled: true,
            auth_token_key: Some("Authorization".into()),
            auth_token_value: Some("Bearer t".into()),
            ..Default::default()
        };
        let mut headers = BTreeMap::from([("cookie".to_string(), "theme=dark".to_string())]);
        inject_environment_headers(&mut headers, &environment);
        assert_eq!(headers["cookie"], "theme=dark; sid=abc");
        assert_eq!(headers["Authorization"], "Bearer t");
        assert!(!headers.contains_key("Cookie"));

        let mut headers = BTreeMap::new();
        inject_environment_headers(&mut headers, &environment);
        assert_eq!(headers["Cookie"], "sid=abc");
    }

    #[test]
    fn query_pairs_skip_nulls_and_repeat_arrays() {
        let params = BTreeMap::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), Value::Null),
            ("tags".to_string(), json!(["x", "y"])),
        ]);
        assert_eq!(
            query_pairs(&params),
            vec![
                ("a".to_string(), "1".to_string()),
                ("tags".to_string(), "x".to_string()),
                ("tags".to_string(), "y".to_string()),
            ]
        );
        let pairs = query_pairs(&params);
        assert_eq!(display_url("/s", &pairs), "/s?a=1&tags=x&tags=y");
    }

    #[test]
    fn empty_bodies_are_dropped() {
        assert!(is_empty_body(&json!({})));
        assert!(is_empty_body(&json!([])));
        assert!(is_empty_body(&json!("")));
        assert!(!is_empty_body(&json!(0)));
        assert!(!is_empty_body(&json!({"a": 1})));
    }

    #[test]
    fn branch_scope_namespaces_variables() {
        let scope = VariableScope::Branch {
            group_id: "p1",
            branch_id: "b2",
        };
        assert_eq!(scope.key("token"), "p1.parallel.b2.token");
        assert_eq!(VariableScope::Global.key("token"), "token");
    }
}
