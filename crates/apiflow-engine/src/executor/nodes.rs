use apiflow_core::hooks::{LogLevel, LogType};
use apiflow_core::runtime::path::{ExchangeSide, flatten_exchange};
use apiflow_core::runtime::{StepResult, VariableStore};
use apiflow_core::{
    ApiNodeData, AssertionFailureStrategy, AssertionNodeData, Node, NodeKind, StepExecutionResult,
    WaitConfig, WaitNodeData,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::api_call::VariableScope;
use super::trace::StepTrace;
use super::{NodeError, TestCaseExecutor};
use crate::assertion::{AssertionScope, execute_assertions};
use crate::transport::HttpTransport;
use crate::wait::wait;

/// Context for standalone assertion nodes: every recorded step keyed by id,
/// with responses flattened, plus the globals under `variables`.
pub(crate) fn cross_step_context(store: &VariableStore) -> Value {
    let mut context = Map::new();
    for (step_id, result) in store.step_results() {
        let entry = match result {
            StepResult::Exchange { request, response } => json!({
                "response": flatten_exchange(ExchangeSide::Response, response, ""),
                "request": request,
            }),
            StepResult::Parallel { parallel } => json!({ "parallel": parallel }),
        };
        context.insert(step_id.clone(), entry);
    }
    context.insert("variables".to_string(), Value::Object(store.variables().clone()));
    Value::Object(context)
}

impl<T: HttpTransport> TestCaseExecutor<T> {
    /// Execute one node. Failures are reported in the returned step, never
    /// propagated.
    pub(crate) async fn execute_node(
        &self,
        node: &Node,
        store: &mut VariableStore,
        order: usize,
    ) -> StepExecutionResult {
        let mut step = StepExecutionResult::begin(node);
        let trace = self.open_step(node, order);
        debug!(node_id = %node.id, kind = %node.kind.tag(), order, "Executing node");
        self.log(
            &trace,
            LogLevel::Info,
            LogType::System,
            format!("starting {} node {}", node.kind.tag(), step.step_name),
            None,
        );

        match &node.kind {
            NodeKind::Api(api) => self.execute_api_node(node, api, store, &trace, &mut step).await,
            NodeKind::Wait(data) => self.execute_wait_node(data, store, &trace, &mut step).await,
            NodeKind::Assertion(data) => self.execute_assertion_node(data, store, &trace, &mut step),
            NodeKind::Parallel(data) => {
                self.execute_parallel_node(node, data, store, &trace, &mut step)
                    .await
            }
            NodeKind::Start(_) | NodeKind::End(_) => {}
        }

        step.finish();
        if let Some(error) = &step.error {
            warn!(node_id = %node.id, duration_ms = step.duration_ms, "Node failed: {error}");
        } else {
            info!(node_id = %node.id, duration_ms = step.duration_ms, "Node succeeded");
        }
        self.close_step(&trace, &step);
        step
    }

    async fn execute_api_node(
        &self,
        node: &Node,
        api: &ApiNodeData,
        store: &mut VariableStore,
        trace: &StepTrace,
        step: &mut StepExecutionResult,
    ) {
        let outcome = self
            .call_api(api, &node.id, store, VariableScope::Global, trace)
            .await;
        step.request = Some(outcome.request);
        step.response = outcome.response;
        step.assertions = outcome.assertions;
        step.extracted_variables = outcome.extracted;
        if let Some(error) = outcome.error {
            step.fail(error.to_string());
        }
    }

    async fn execute_wait_node(
        &self,
        data: &WaitNodeData,
        store: &VariableStore,
        trace: &StepTrace,
        step: &mut StepExecutionResult,
    ) {
        let description = match &data.wait {
            WaitConfig::Time { value } => format!("wait type: time\nduration: {value}ms"),
            WaitConfig::Condition {
                condition,
                timeout,
                check_interval,
            } => format!(
                "wait type: condition\ncondition: {} {} {}\ntimeout: {}ms\ninterval: {}ms",
                condition.variable,
                condition.operator,
                condition.expected,
                timeout.unwrap_or(self.config.default_condition_timeout_ms),
                check_interval.unwrap_or(self.config.default_condition_interval_ms),
            ),
        };
        self.log(trace, LogLevel::Info, LogType::System, description, None);

        if let Err(e) = wait(&data.wait, store, &self.config).await {
            step.fail(NodeError::from(e).to_string());
        }
    }

    fn execute_assertion_node(
        &self,
        data: &AssertionNodeData,
        store: &VariableStore,
        trace: &StepTrace,
        step: &mut StepExecutionResult,
    ) {
        if data.assertions.is_empty() {
            return;
        }
        let context = cross_step_context(store);
        let stop_on_failure = data.assertion_failure_strategy == AssertionFailureStrategy::StopOnFailure;
        step.assertions = execute_assertions(
            &data.assertions,
            AssertionScope::Context(&context),
            store,
            stop_on_failure,
        );

        let passed = step.assertions.iter().filter(|r| r.success).count();
        let failed = step.assertions.len() - passed;
        self.log(
            trace,
            if failed == 0 { LogLevel::Success } else { LogLevel::Error },
            LogType::Assertion,
            format!("assertions: {passed} passed, {failed} failed"),
            Some(json!({ "results": step.assertions })),
        );
        if let Some(first) = step.assertions.iter().find(|r| !r.success) {
            let message = NodeError::Assertion(first.message.clone()).to_string();
            step.fail(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_step_context_flattens_every_step() {
        let mut store = VariableStore::new(Map::from_iter([("env".to_string(), json!("qa"))]));
        store.set_step_result(
            "login",
            StepResult::Exchange {
                request: json!({"method": "POST"}),
                response: json!({"status": 200, "headers": {}, "body": {"token": "t"}}),
            },
        );
        store.set_step_result(
            "fan",
            StepResult::Parallel {
                parallel: Map::from_iter([("b1".to_string(), json!({"status": 204}))]),
            },
        );

        let context = cross_step_context(&store);
        assert_eq!(context["login"]["response"]["token"], json!("t"));
        assert_eq!(context["login"]["response"]["status"], json!(200));
        assert_eq!(context["login"]["request"]["method"], json!("POST"));
        assert_eq!(context["fan"]["parallel"]["b1"]["status"], json!(204));
        assert_eq!(context["variables"]["env"], json!("qa"));
    }
}
