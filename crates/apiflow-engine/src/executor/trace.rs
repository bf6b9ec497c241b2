use apiflow_core::hooks::{ExecutionLogEntry, LogLevel, LogType, NewStepRecord, StepRecordUpdate, StepStatus};
use apiflow_core::{Node, StepExecutionResult};
use serde_json::Value;
use tracing::{debug, warn};

use super::TestCaseExecutor;
use crate::events::ExecutionEvent;
use crate::transport::HttpTransport;

/// Identifies the step record that logs of a running node attach to.
#[derive(Debug, Clone)]
pub(crate) struct StepTrace {
    pub record_id: Option<String>,
    pub node_id: String,
    pub node_name: String,
}

/// Keep long bodies out of log messages.
pub(crate) fn truncate_for_log(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...(truncated)", &text[..end]),
        None => text.to_string(),
    }
}

impl<T: HttpTransport> TestCaseExecutor<T> {
    pub(crate) fn emit(&self, event: ExecutionEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        let name = event.name();
        if tx.send(event).is_err() {
            debug!(event = name, "Event receiver dropped");
        }
    }

    /// Create the persisted record for a starting node. A failing hook leaves
    /// the step without a record; execution continues.
    pub(crate) fn open_step(&self, node: &Node, order: usize) -> StepTrace {
        let record = NewStepRecord {
            case_execution_id: self.case_execution_id.clone(),
            node_id: node.id.clone(),
            node_name: node.display_name(),
            node_kind: node.kind.tag().to_string(),
            order,
            node_snapshot: serde_json::to_value(node).unwrap_or(Value::Null),
        };
        let record_id = match self.hooks.create_step_record(&record) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(node_id = %node.id, "Failed to create step record: {e:#}");
                None
            }
        };
        StepTrace {
            record_id,
            node_id: record.node_id,
            node_name: record.node_name,
        }
    }

    pub(crate) fn update_step(&self, trace: &StepTrace, update: &StepRecordUpdate) {
        let Some(record_id) = &trace.record_id else {
            return;
        };
        if let Err(e) = self.hooks.update_step_record(record_id, update) {
            warn!(node_id = %trace.node_id, "Failed to update step record: {e:#}");
        }
    }

    /// Final record update for a finished node.
    pub(crate) fn close_step(&self, trace: &StepTrace, step: &StepExecutionResult) {
        let update = StepRecordUpdate {
            status: Some(if step.success {
                StepStatus::Success
            } else {
                StepStatus::Failed
            }),
            end_time: step.end_time,
            duration_ms: Some(step.duration_ms),
            response: step.response.clone(),
            assertion_results: (!step.assertions.is_empty()).then(|| step.assertions.clone()),
            extracted_variables: (!step.extracted_variables.is_empty())
                .then(|| step.extracted_variables.clone()),
            error_message: step.error.clone(),
            ..Default::default()
        };
        self.update_step(trace, &update);

        match &step.error {
            None => self.log(
                trace,
                LogLevel::Success,
                LogType::System,
                format!("{} finished in {}ms", step.step_name, step.duration_ms),
                None,
            ),
            Some(error) => self.log(
                trace,
                LogLevel::Error,
                LogType::Error,
                format!("{} failed: {error}", step.step_name),
                Some(serde_json::json!({ "error": error })),
            ),
        }
    }

    pub(crate) fn log(
        &self,
        trace: &StepTrace,
        level: LogLevel,
        log_type: LogType,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        let mut entry = ExecutionLogEntry::new(level, log_type, message);
        entry.step_record_id = trace.record_id.clone();
        entry.case_execution_id = self.case_execution_id.clone();
        entry.suite_execution_id = self.suite_execution_id.clone();
        entry.node_id = Some(trace.node_id.clone());
        entry.node_name = Some(trace.node_name.clone());
        entry.details = details;
        if let Err(e) = self.hooks.create_execution_log(&entry) {
            warn!(node_id = %trace.node_id, "Failed to write execution log: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_snaps_to_chars() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("héllo world", 5), "héllo...(truncated)");
    }
}
