//! Progress events streamed to the caller while a test case runs.

use std::collections::BTreeMap;

use apiflow_core::{AssertionResult, NodeKindTag, StepExecutionResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One progress event, serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Start(RunStarted),
    StepStart(StepStarted),
    StepComplete(StepFinished),
    StepError(StepFinished),
    Complete(RunCompleted),
    Error(RunFailed),
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Start(_) => "start",
            ExecutionEvent::StepStart(_) => "step_start",
            ExecutionEvent::StepComplete(_) => "step_complete",
            ExecutionEvent::StepError(_) => "step_error",
            ExecutionEvent::Complete(_) => "complete",
            ExecutionEvent::Error(_) => "error",
        }
    }

    /// `step_complete` for a passing step, `step_error` otherwise.
    pub(crate) fn step_finished(step_index: usize, step: &StepExecutionResult) -> Self {
        let data = StepFinished {
            step_index,
            node_id: step.node_id.clone(),
            node_type: step.node_kind,
            node_name: step.step_name.clone(),
            success: step.success,
            duration_ms: step.duration_ms,
            end_time: step.end_time.unwrap_or_else(Utc::now),
            is_cleanup: step.is_cleanup,
            request: step.request.clone(),
            response: step.response.clone(),
            assertions: step.assertions.clone(),
            extracted_variables: step.extracted_variables.clone(),
            error: step.error.clone(),
        };
        if step.success {
            ExecutionEvent::StepComplete(data)
        } else {
            ExecutionEvent::StepError(data)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub test_case_id: String,
    pub test_case_name: String,
    pub total_steps: usize,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStarted {
    /// 1-based, counted across the normal and cleanup phases.
    pub step_index: usize,
    pub total_steps: usize,
    pub node_id: String,
    pub node_type: NodeKindTag,
    pub node_name: String,
    pub start_time: DateTime<Utc>,
    pub is_cleanup: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFinished {
    pub step_index: usize,
    pub node_id: String,
    pub node_type: NodeKindTag,
    pub node_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub end_time: DateTime<Utc>,
    pub is_cleanup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<AssertionResult>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extracted_variables: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub status: NodeOutcome,
    pub duration_ms: u64,
    pub is_cleanup: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompleted {
    pub success: bool,
    pub total_steps: usize,
    pub executed_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub variables: Map<String, Value>,
    pub end_time: DateTime<Utc>,
    pub node_statuses: BTreeMap<String, NodeStatus>,
}

/// Sent after a normal-phase step fails, before cleanup runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailed {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub executed_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_as_type_and_data() {
        let event = ExecutionEvent::Error(RunFailed {
            message: "step 'Login' failed".into(),
            error: Some("HTTP error: 500".into()),
            node_id: Some("n1".into()),
            executed_steps: 1,
            passed_steps: 0,
            failed_steps: 1,
        });
        assert_eq!(event.name(), "error");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("error"));
        assert_eq!(value["data"]["nodeId"], json!("n1"));
        assert_eq!(value["data"]["failedSteps"], json!(1));
    }

    #[test]
    fn step_start_uses_snake_case_tag() {
        let event = ExecutionEvent::StepStart(StepStarted {
            step_index: 2,
            total_steps: 3,
            node_id: "n2".into(),
            node_type: NodeKindTag::Wait,
            node_name: "[cleanup] Pause".into(),
            start_time: Utc::now(),
            is_cleanup: true,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("step_start"));
        assert_eq!(value["data"]["nodeType"], json!("wait"));
        assert_eq!(value["data"]["isCleanup"], json!(true));
    }
}
