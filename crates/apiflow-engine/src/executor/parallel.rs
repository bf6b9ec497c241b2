//! Fan-out of a parallel group's branches onto a `JoinSet`.

use std::collections::HashMap;

use apiflow_core::hooks::{LogLevel, LogType};
use apiflow_core::runtime::{StepResult, VariableStore};
use apiflow_core::{AssertionResult, Node, ParallelBranch, ParallelFailureStrategy, ParallelNodeData, StepExecutionResult};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::task::{self, JoinSet};
use tracing::{info, warn};

use super::api_call::{ApiOutcome, VariableScope};
use super::trace::StepTrace;
use super::{NodeError, TestCaseExecutor};
use crate::transport::HttpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum BranchStatus {
    Success,
    Failed,
    Cancelled,
}

/// Per-branch entry of a parallel group's `logs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BranchLog {
    pub api_id: String,
    pub api_name: String,
    pub method: String,
    pub url: String,
    pub status: BranchStatus,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub assertions: Vec<AssertionResult>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extracted_variables: Map<String, Value>,
    pub error: Option<String>,
}

impl BranchLog {
    fn cancelled(branch: &ParallelBranch) -> Self {
        Self {
            api_id: branch.id.clone(),
            api_name: branch.display_name(),
            method: branch.api.method.to_uppercase(),
            url: branch.api.url.clone(),
            status: BranchStatus::Cancelled,
            request: None,
            response: None,
            assertions: Vec::new(),
            extracted_variables: Map::new(),
            error: Some("cancelled after another branch failed".to_string()),
        }
    }

    fn task_failed(branch: &ParallelBranch, error: String) -> Self {
        Self {
            status: BranchStatus::Failed,
            error: Some(error),
            ..Self::cancelled(branch)
        }
    }

    fn finished(branch: &ParallelBranch, outcome: &ApiOutcome) -> Self {
        let url = outcome.request["url"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| branch.api.url.clone());
        Self {
            api_id: branch.id.clone(),
            api_name: branch.display_name(),
            method: branch.api.method.to_uppercase(),
            url,
            status: if outcome.success() {
                BranchStatus::Success
            } else {
                BranchStatus::Failed
            },
            request: Some(outcome.request.clone()),
            response: outcome.response.clone(),
            assertions: outcome.assertions.clone(),
            extracted_variables: outcome.extracted.clone(),
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }
}

impl<T: HttpTransport> TestCaseExecutor<T> {
    /// Run every branch concurrently against a snapshot of the store.
    ///
    /// Branch results are merged back as they complete: extracted variables
    /// under `<group>.parallel.<branch>.<name>`, and successful responses
    /// into the group's step result. Under `stopAll` the first failure
    /// aborts every branch still running.
    pub(crate) async fn execute_parallel_node(
        &self,
        node: &Node,
        data: &ParallelNodeData,
        store: &mut VariableStore,
        trace: &StepTrace,
        step: &mut StepExecutionResult,
    ) {
        let stop_all = data.failure_strategy == ParallelFailureStrategy::StopAll;
        self.log(
            trace,
            LogLevel::Info,
            LogType::System,
            format!(
                "starting parallel group with {} branches, failure strategy: {}",
                data.apis.len(),
                if stop_all { "stopAll" } else { "continueAll" }
            ),
            None,
        );

        let mut join_set: JoinSet<ApiOutcome> = JoinSet::new();
        let mut task_index: HashMap<task::Id, usize> = HashMap::with_capacity(data.apis.len());
        for (index, branch) in data.apis.iter().enumerate() {
            let executor = self.clone();
            let mut branch_store = store.clone();
            let api = branch.api.clone();
            let branch_id = branch.id.clone();
            let group_id = node.id.clone();
            let trace = trace.clone();
            let handle = join_set.spawn(async move {
                let scope = VariableScope::Branch {
                    group_id: &group_id,
                    branch_id: &branch_id,
                };
                executor
                    .call_api(&api, &group_id, &mut branch_store, scope, &trace)
                    .await
            });
            task_index.insert(handle.id(), index);
        }

        let mut logs: Vec<BranchLog> = Vec::with_capacity(data.apis.len());
        let mut responses = Map::new();
        let mut errors = Vec::new();
        let mut aborted = false;

        // Aborted tasks still come back through `join_next_with_id`, so every
        // branch yields exactly one log entry. Branches that completed before
        // the abort landed keep their real outcome.
        while let Some(joined) = join_set.join_next_with_id().await {
            let (id, joined) = match joined {
                Ok((id, outcome)) => (id, Ok(outcome)),
                Err(e) => (e.id(), Err(e)),
            };
            let Some(&index) = task_index.get(&id) else {
                warn!(node_id = %node.id, "Unknown parallel task {id}");
                continue;
            };
            let branch = &data.apis[index];

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => {
                    info!(node_id = %node.id, branch_id = %branch.id, "Parallel branch cancelled");
                    self.record_branch(trace, BranchLog::cancelled(branch), &mut logs);
                    continue;
                }
                Err(e) => {
                    warn!(node_id = %node.id, branch_id = %branch.id, "Parallel branch task failed: {e}");
                    let message = format!("branch task failed: {e}");
                    errors.push(format!("branch '{}' failed: {message}", branch.display_name()));
                    self.record_branch(trace, BranchLog::task_failed(branch, message), &mut logs);
                    if stop_all && !aborted {
                        join_set.abort_all();
                        aborted = true;
                    }
                    continue;
                }
            };

            let scope = VariableScope::Branch {
                group_id: &node.id,
                branch_id: &branch.id,
            };
            for (name, value) in &outcome.extracted {
                store.set_variable(scope.key(name), value.clone());
            }
            self.record_branch(trace, BranchLog::finished(branch, &outcome), &mut logs);

            match (&outcome.error, outcome.response) {
                (None, Some(response)) => {
                    responses.insert(branch.id.clone(), response);
                }
                (Some(error), _) => {
                    errors.push(format!("branch '{}' failed: {error}", branch.display_name()));
                    if stop_all && !aborted {
                        join_set.abort_all();
                        aborted = true;
                    }
                }
                (None, None) => {}
            }
        }

        let succeeded = responses.len();
        store.set_step_result(
            node.id.clone(),
            StepResult::Parallel {
                parallel: responses.clone(),
            },
        );
        step.response = Some(json!({ "parallel": responses, "logs": logs }));

        let summary = format!(
            "parallel group finished: {succeeded}/{} branches succeeded",
            data.apis.len()
        );
        if errors.is_empty() {
            self.log(trace, LogLevel::Success, LogType::System, summary, None);
        } else {
            let message = errors.join("; ");
            self.log(
                trace,
                LogLevel::Error,
                LogType::System,
                format!("{summary}\n{message}"),
                None,
            );
            step.fail(NodeError::Parallel(message).to_string());
        }
    }

    fn record_branch(&self, trace: &StepTrace, log: BranchLog, logs: &mut Vec<BranchLog>) {
        let level = match log.status {
            BranchStatus::Success => LogLevel::Success,
            BranchStatus::Failed => LogLevel::Error,
            BranchStatus::Cancelled => LogLevel::Warning,
        };
        self.log(
            trace,
            level,
            LogType::Request,
            branch_message(&log),
            serde_json::to_value(&log).ok(),
        );
        logs.push(log);
    }
}

fn branch_message(log: &BranchLog) -> String {
    let status = match log.status {
        BranchStatus::Success => "succeeded",
        BranchStatus::Failed => "failed",
        BranchStatus::Cancelled => "cancelled",
    };
    let mut message = format!("parallel branch [{}] {status}", log.api_name);
    if log.request.is_some() {
        message.push_str(&format!("\nrequest: {} {}", log.method, log.url));
    }
    if let Some(status) = log.response.as_ref().and_then(|r| r.get("status")) {
        message.push_str(&format!("\nresponse: {status}"));
    }
    if let Some(error) = &log.error {
        message.push_str(&format!("\nerror: {error}"));
    }
    message
}
