use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runtime::VariableSnapshot;
use crate::{Node, NodeKindTag};

/// Outcome of a single assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub field: String,
    pub operator: String,
    /// Expected value after reference resolution and type coercion.
    pub expected: Value,
    pub actual: Value,
    pub success: bool,
    pub message: String,
}

/// Execution record for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    pub step_id: String,
    pub step_name: String,
    pub node_id: String,
    pub node_kind: NodeKindTag,
    pub success: bool,
    #[serde(default)]
    pub is_cleanup: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub request: Option<Value>,
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<AssertionResult>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extracted_variables: Map<String, Value>,
    pub error: Option<String>,
}

impl StepExecutionResult {
    pub fn begin(node: &Node) -> Self {
        Self {
            step_id: node.id.clone(),
            step_name: node.display_name(),
            node_id: node.id.clone(),
            node_kind: node.kind.tag(),
            success: true,
            is_cleanup: node.kind.is_cleanup(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0,
            request: None,
            response: None,
            assertions: Vec::new(),
            extracted_variables: Map::new(),
            error: None,
        }
    }

    /// Mark the step failed. The first recorded error wins.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn finish(&mut self) {
        let end = Utc::now();
        self.duration_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(end);
    }
}

/// Aggregate result of one test-case run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub success: bool,
    pub test_case_id: String,
    pub test_case_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub total_steps: usize,
    pub executed_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub steps: Vec<StepExecutionResult>,
    pub error: Option<String>,
    pub variables: VariableSnapshot,
}

impl TestCaseResult {
    pub fn begin(test_case_id: impl Into<String>, test_case_name: impl Into<String>) -> Self {
        Self {
            success: true,
            test_case_id: test_case_id.into(),
            test_case_name: test_case_name.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0,
            total_steps: 0,
            executed_steps: 0,
            passed_steps: 0,
            failed_steps: 0,
            steps: Vec::new(),
            error: None,
            variables: VariableSnapshot::default(),
        }
    }

    pub fn record_step(&mut self, step: StepExecutionResult) {
        self.executed_steps += 1;
        if step.success {
            self.passed_steps += 1;
        } else {
            self.failed_steps += 1;
        }
        self.steps.push(step);
    }

    pub fn finish(&mut self, variables: VariableSnapshot) {
        let end = Utc::now();
        self.duration_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(end);
        self.variables = variables;
    }
}
