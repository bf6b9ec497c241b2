use std::collections::BTreeMap;

use apiflow_core::runtime::VariableStore;
use apiflow_core::{Node, StepExecutionResult, TestCase, TestCaseResult};
use chrono::Utc;
use tracing::{info, warn};

use super::TestCaseExecutor;
use crate::events::{
    ExecutionEvent, NodeOutcome, NodeStatus, RunCompleted, RunFailed, RunStarted, StepStarted,
};
use crate::transport::HttpTransport;

const CLEANUP_PREFIX: &str = "[cleanup] ";

impl<T: HttpTransport> TestCaseExecutor<T> {
    /// Run a test case to completion.
    ///
    /// Normal nodes run in plan order and stop at the first failure. Cleanup
    /// nodes always run afterwards, each regardless of the others' outcome.
    pub async fn execute(&self, test_case: &TestCase) -> TestCaseResult {
        let flow = &test_case.flow_config;
        let plan = flow.execution_plan();
        let total_steps = plan.total_steps();

        let mut result = TestCaseResult::begin(&test_case.id, &test_case.name);
        result.total_steps = total_steps;
        let mut store = VariableStore::new(flow.variables.clone());
        let mut node_statuses = BTreeMap::new();

        info!(
            test_case = %test_case.name,
            total_steps,
            cleanup_steps = plan.cleanup.len(),
            "Starting test case"
        );
        if flow.start_node().is_none() {
            warn!(test_case = %test_case.name, "Flow has no start node, nothing to run");
        }
        self.emit(ExecutionEvent::Start(RunStarted {
            test_case_id: test_case.id.clone(),
            test_case_name: test_case.name.clone(),
            total_steps,
            start_time: result.start_time,
        }));

        for (idx, node) in plan.normal.iter().enumerate() {
            let step = self
                .run_step(node, &mut store, idx + 1, total_steps, false)
                .await;
            record_status(&mut node_statuses, &step);
            let failure = (!step.success).then(|| {
                (
                    step.step_name.clone(),
                    step.error.clone().unwrap_or_default(),
                )
            });
            result.record_step(step);

            if let Some((name, error)) = failure {
                result.success = false;
                result.error = Some(format!("step '{name}' failed: {error}"));
                warn!(node_id = %node.id, "Stopping normal phase after failure");
                self.emit(ExecutionEvent::Error(RunFailed {
                    message: format!("step '{name}' failed"),
                    error: Some(error),
                    node_id: Some(node.id.clone()),
                    executed_steps: result.executed_steps,
                    passed_steps: result.passed_steps,
                    failed_steps: result.failed_steps,
                }));
                break;
            }
        }

        if !plan.cleanup.is_empty() {
            info!(
                count = plan.cleanup.len(),
                after_failure = !result.success,
                "Running cleanup nodes"
            );
        }
        for (idx, node) in plan.cleanup.iter().enumerate() {
            let order = plan.normal.len() + idx + 1;
            let step = self.run_step(node, &mut store, order, total_steps, true).await;
            record_status(&mut node_statuses, &step);
            if !step.success {
                result.success = false;
                if result.error.is_none() {
                    result.error = Some(format!(
                        "cleanup step '{}' failed: {}",
                        step.step_name,
                        step.error.as_deref().unwrap_or_default()
                    ));
                }
            }
            result.record_step(step);
        }

        result.finish(store.snapshot());
        info!(
            test_case = %test_case.name,
            success = result.success,
            passed = result.passed_steps,
            failed = result.failed_steps,
            duration_ms = result.duration_ms,
            "Test case finished"
        );
        self.emit(ExecutionEvent::Complete(RunCompleted {
            success: result.success,
            total_steps,
            executed_steps: result.executed_steps,
            passed_steps: result.passed_steps,
            failed_steps: result.failed_steps,
            variables: store.variables().clone(),
            end_time: result.end_time.unwrap_or_else(Utc::now),
            node_statuses,
        }));
        result
    }

    async fn run_step(
        &self,
        node: &Node,
        store: &mut VariableStore,
        step_index: usize,
        total_steps: usize,
        is_cleanup: bool,
    ) -> StepExecutionResult {
        let name = node.display_name();
        self.emit(ExecutionEvent::StepStart(StepStarted {
            step_index,
            total_steps,
            node_id: node.id.clone(),
            node_type: node.kind.tag(),
            node_name: if is_cleanup {
                format!("{CLEANUP_PREFIX}{name}")
            } else {
                name
            },
            start_time: Utc::now(),
            is_cleanup,
        }));

        let mut step = self.execute_node(node, store, step_index).await;
        step.is_cleanup = is_cleanup;
        self.emit(ExecutionEvent::step_finished(step_index, &step));
        step
    }
}

fn record_status(statuses: &mut BTreeMap<String, NodeStatus>, step: &StepExecutionResult) {
    statuses.insert(
        step.node_id.clone(),
        NodeStatus {
            status: if step.success {
                NodeOutcome::Success
            } else {
                NodeOutcome::Error
            },
            duration_ms: step.duration_ms,
            is_cleanup: step.is_cleanup,
        },
    );
}
