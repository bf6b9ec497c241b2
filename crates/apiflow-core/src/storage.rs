use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::hooks::{ExecutionLogEntry, NewStepRecord, PersistenceHooks, StepRecordUpdate, StepStatus};

/// Sanitizes a name for use as a path component.
///
/// Lowercases, replaces non-alphanumeric chars with `-`, collapses consecutive
/// dashes, and trims leading/trailing dashes.
pub fn sanitize_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            result.push(ch.to_ascii_lowercase());
        } else {
            result.push('-');
        }
    }
    let collapsed: String = result
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        return "unnamed".to_string();
    }
    collapsed
}

/// Formats an execution directory name as `YYYY-MM-DD_HH-MM-SS_<short_uuid>`.
fn format_execution_dirname(started_at: DateTime<Utc>, execution_id: Uuid) -> String {
    let short_id = &execution_id.to_string()[..12];
    format!("{}_{short_id}", started_at.format("%Y-%m-%d_%H-%M-%S"))
}

/// File-backed persistence hooks.
///
/// Directory layout:
/// ```text
/// runs/<sanitized_case_name>/
///   <YYYY-MM-DD_HH-MM-SS_shortid>/   ← one per test-case execution
///     steps/
///       <order>-<sanitized_node_name>.json
///     logs.jsonl
/// ```
pub struct RunStore {
    /// Points to `runs/<case_dir>/`
    base_path: PathBuf,
    /// The current execution directory name (set by `begin_execution`).
    execution_dir: Option<String>,
    /// Serializes file writes from concurrent parallel branches.
    write_lock: Mutex<()>,
}

impl RunStore {
    pub fn new(root: &Path, case_name: &str) -> Self {
        Self {
            base_path: root.join("runs").join(sanitize_name(case_name)),
            execution_dir: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Start a new execution directory. Returns its name, which doubles as
    /// the case execution id.
    pub fn begin_execution(&mut self) -> Result<String> {
        let dirname = format_execution_dirname(Utc::now(), Uuid::new_v4());
        std::fs::create_dir_all(self.base_path.join(&dirname).join("steps"))
            .context("Failed to create execution directory")?;
        self.execution_dir = Some(dirname.clone());
        Ok(dirname)
    }

    fn execution_path(&self, caller: &str) -> Result<PathBuf> {
        let dir = self
            .execution_dir
            .as_ref()
            .with_context(|| format!("begin_execution() must be called before {caller}()"))?;
        Ok(self.base_path.join(dir))
    }

    fn step_path(&self, step_record_id: &str, caller: &str) -> Result<PathBuf> {
        Ok(self
            .execution_path(caller)?
            .join("steps")
            .join(format!("{step_record_id}.json")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("run store write lock poisoned"))
    }

    /// Load a step record written by this store.
    pub fn load_step_record(&self, step_record_id: &str) -> Result<Value> {
        let path = self.step_path(step_record_id, "load_step_record")?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).context("Failed to parse step record")
    }

    /// All log entries of the current execution, in write order.
    pub fn load_logs(&self) -> Result<Vec<ExecutionLogEntry>> {
        let path = self.execution_path("load_logs")?.join("logs.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path).context("Failed to read logs.jsonl")?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse log line"))
            .collect()
    }
}

impl PersistenceHooks for RunStore {
    fn create_step_record(&self, record: &NewStepRecord) -> Result<String> {
        let step_record_id = format!("{:03}-{}", record.order, sanitize_name(&record.node_name));
        let path = self.step_path(&step_record_id, "create_step_record")?;

        let mut json = serde_json::to_value(record).context("Failed to serialize step record")?;
        if let Value::Object(map) = &mut json {
            map.insert("id".to_string(), Value::String(step_record_id.clone()));
            map.insert("status".to_string(), serde_json::to_value(StepStatus::Running)?);
            map.insert("startTime".to_string(), serde_json::to_value(Utc::now())?);
        }

        let _guard = self.lock()?;
        let text = serde_json::to_string_pretty(&json).context("Failed to serialize step record")?;
        std::fs::write(&path, text).context("Failed to write step record")?;
        Ok(step_record_id)
    }

    fn update_step_record(&self, step_record_id: &str, update: &StepRecordUpdate) -> Result<()> {
        let path = self.step_path(step_record_id, "update_step_record")?;
        let _guard = self.lock()?;

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Step record {step_record_id} does not exist"))?;
        let mut record: Value = serde_json::from_str(&text).context("Failed to parse step record")?;
        let patch = serde_json::to_value(update).context("Failed to serialize update")?;
        if let (Value::Object(target), Value::Object(fields)) = (&mut record, patch) {
            target.extend(fields);
        }

        let text = serde_json::to_string_pretty(&record).context("Failed to serialize step record")?;
        std::fs::write(&path, text).context("Failed to write step record")?;
        Ok(())
    }

    fn create_execution_log(&self, entry: &ExecutionLogEntry) -> Result<()> {
        let path = self.execution_path("create_execution_log")?.join("logs.jsonl");
        let mut line = serde_json::to_string(entry).context("Failed to serialize log entry")?;
        line.push('\n');

        let _guard = self.lock()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open logs.jsonl")?;
        file.write_all(line.as_bytes())
            .context("Failed to write log entry")?;
        Ok(())
    }
}
