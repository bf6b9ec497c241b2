//! Persistence hooks called by the executor while a test case runs.
//!
//! Implementations may fail; callers log the error and carry on.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AssertionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogType {
    System,
    Request,
    Response,
    Variable,
    Assertion,
    Error,
}

/// Written when a node starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStepRecord {
    pub case_execution_id: Option<String>,
    pub node_id: String,
    pub node_name: String,
    pub node_kind: String,
    /// 1-based position across both phases.
    pub order: usize,
    pub node_snapshot: Value,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertion_results: Option<Vec<AssertionResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_variables: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub log_type: LogType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ExecutionLogEntry {
    pub fn new(level: LogLevel, log_type: LogType, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            log_type,
            message: message.into(),
            step_record_id: None,
            case_execution_id: None,
            suite_execution_id: None,
            node_id: None,
            node_name: None,
            details: None,
        }
    }
}

pub trait PersistenceHooks: Send + Sync {
    /// Create a record for a starting node and return its id.
    fn create_step_record(&self, record: &NewStepRecord) -> Result<String>;

    fn update_step_record(&self, step_record_id: &str, update: &StepRecordUpdate) -> Result<()>;

    fn create_execution_log(&self, entry: &ExecutionLogEntry) -> Result<()>;

    /// Canonical URL registered for an API definition, if the store knows one.
    fn canonical_api_url(&self, _api_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Hooks that record nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl PersistenceHooks for NoopHooks {
    fn create_step_record(&self, record: &NewStepRecord) -> Result<String> {
        Ok(format!("{}-{}", record.order, record.node_id))
    }

    fn update_step_record(&self, _step_record_id: &str, _update: &StepRecordUpdate) -> Result<()> {
        Ok(())
    }

    fn create_execution_log(&self, _entry: &ExecutionLogEntry) -> Result<()> {
        Ok(())
    }
}
