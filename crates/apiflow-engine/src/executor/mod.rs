mod api_call;
mod nodes;
mod parallel;
mod run_loop;
mod trace;


use std::sync::Arc;

use apiflow_core::hooks::{NoopHooks, PersistenceHooks};
use apiflow_core::{EngineConfig, EnvironmentConfig};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::events::ExecutionEvent;
use crate::transport::{HttpTransport, ReqwestTransport, TransportError};
use crate::wait::WaitError;

/// Why a node failed. Rendered into the step's `error` text.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error(transparent)]
    Wait(#[from] WaitError),

    /// Aggregated branch failures of a parallel group.
    #[error("{0}")]
    Parallel(String),
}

/// Runs test cases against one environment.
///
/// Cloning is cheap; parallel branches run on clones that share the
/// transport, configuration and hooks.
pub struct TestCaseExecutor<T: HttpTransport = ReqwestTransport> {
    transport: Arc<T>,
    environment: Arc<EnvironmentConfig>,
    config: Arc<EngineConfig>,
    hooks: Arc<dyn PersistenceHooks>,
    event_tx: Option<UnboundedSender<ExecutionEvent>>,
    case_execution_id: Option<String>,
    suite_execution_id: Option<String>,
}

impl<T: HttpTransport> Clone for TestCaseExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            environment: Arc::clone(&self.environment),
            config: Arc::clone(&self.config),
            hooks: Arc::clone(&self.hooks),
            event_tx: self.event_tx.clone(),
            case_execution_id: self.case_execution_id.clone(),
            suite_execution_id: self.suite_execution_id.clone(),
        }
    }
}

impl TestCaseExecutor {
    pub fn new(environment: EnvironmentConfig, config: EngineConfig) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(transport, environment, config))
    }
}

impl<T: HttpTransport> TestCaseExecutor<T> {
    pub fn with_transport(transport: T, environment: EnvironmentConfig, config: EngineConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            environment: Arc::new(environment),
            config: Arc::new(config),
            hooks: Arc::new(NoopHooks),
            event_tx: None,
            case_execution_id: None,
            suite_execution_id: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PersistenceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Stream progress events to `tx`. Events are dropped silently once the
    /// receiver is gone.
    pub fn with_events(mut self, tx: UnboundedSender<ExecutionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Swap in a fresh transport so no connection or cookie state carries
    /// over from an earlier test case. Keeps the current one if building
    /// fails.
    pub fn with_fresh_transport(mut self) -> Self {
        match self.transport.fresh() {
            Ok(Some(transport)) => self.transport = Arc::new(transport),
            Ok(None) => {}
            Err(e) => warn!("Failed to build a fresh HTTP client, reusing the current one: {e}"),
        }
        self
    }

    pub fn with_execution_ids(
        mut self,
        case_execution_id: Option<String>,
        suite_execution_id: Option<String>,
    ) -> Self {
        self.case_execution_id = case_execution_id;
        self.suite_execution_id = suite_execution_id;
        self
    }
}
