//! Fixed delays and condition polling.

use std::time::Duration;

use apiflow_core::runtime::VariableStore;
use apiflow_core::runtime::path::extract;
use apiflow_core::{ConditionOperator, EngineConfig, WaitCondition, WaitConfig};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::assertion::loose_eq;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(
        "condition wait timed out after {timeout_ms}ms\ncondition: {condition}\nlast value: {last_value}\nchecks: {checks}"
    )]
    ConditionTimeout {
        timeout_ms: u64,
        condition: String,
        last_value: Value,
        checks: u32,
    },
}

/// Run a wait, reading condition variables through the store.
pub async fn wait(
    config: &WaitConfig,
    store: &VariableStore,
    settings: &EngineConfig,
) -> Result<(), WaitError> {
    run(config, settings, |path| store.resolve_path(path)).await
}

/// Run a wait, reading condition variables as fields of `context`.
pub async fn wait_with_context(
    config: &WaitConfig,
    context: &Value,
    settings: &EngineConfig,
) -> Result<(), WaitError> {
    run(config, settings, |path| extract(context, path)).await
}

async fn run<F>(config: &WaitConfig, settings: &EngineConfig, read_value: F) -> Result<(), WaitError>
where
    F: Fn(&str) -> Option<Value>,
{
    match config {
        WaitConfig::Time { value } => {
            wait_time(*value, settings).await;
            Ok(())
        }
        WaitConfig::Condition {
            condition,
            timeout,
            check_interval,
        } => {
            let timeout_ms = timeout
                .filter(|t| *t > 0)
                .unwrap_or(settings.default_condition_timeout_ms);
            let interval_ms = check_interval
                .filter(|i| *i > 0)
                .unwrap_or(settings.default_condition_interval_ms);
            wait_condition(condition, timeout_ms, interval_ms, read_value).await
        }
    }
}

async fn wait_time(duration_ms: u64, settings: &EngineConfig) {
    if duration_ms == 0 {
        return;
    }
    if duration_ms <= settings.time_wait_chunk_threshold_ms || settings.time_wait_chunk_ms == 0 {
        debug!(duration_ms, "Waiting");
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        return;
    }

    info!(duration_ms, "Starting long wait");
    let mut elapsed = 0u64;
    while elapsed < duration_ms {
        let chunk = settings.time_wait_chunk_ms.min(duration_ms - elapsed);
        tokio::time::sleep(Duration::from_millis(chunk)).await;
        elapsed += chunk;
        info!(
            percent = elapsed * 100 / duration_ms,
            elapsed_ms = elapsed,
            remaining_ms = duration_ms - elapsed,
            "Wait progress"
        );
    }
}

fn condition_holds(condition: &WaitCondition, actual: &Value) -> bool {
    match condition.operator {
        ConditionOperator::Equals => loose_eq(actual, &condition.expected),
        ConditionOperator::NotEquals => !loose_eq(actual, &condition.expected),
        ConditionOperator::Exists => !actual.is_null(),
    }
}

async fn wait_condition<F>(
    condition: &WaitCondition,
    timeout_ms: u64,
    interval_ms: u64,
    read_value: F,
) -> Result<(), WaitError>
where
    F: Fn(&str) -> Option<Value>,
{
    let started = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    let mut checks = 0u32;
    let mut last_value = Value::Null;

    loop {
        if started.elapsed() >= timeout {
            return Err(WaitError::ConditionTimeout {
                timeout_ms,
                condition: format!(
                    "{} {} {}",
                    condition.variable, condition.operator, condition.expected
                ),
                last_value,
                checks,
            });
        }

        checks += 1;
        last_value = read_value(&condition.variable).unwrap_or(Value::Null);
        if condition_holds(condition, &last_value) {
            debug!(variable = %condition.variable, checks, "Wait condition met");
            return Ok(());
        }
        debug!(variable = %condition.variable, actual = %last_value, checks, "Wait condition not met");
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}
