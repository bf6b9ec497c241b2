//! Sequential execution of a list of test cases.

use std::sync::Arc;

use apiflow_core::hooks::PersistenceHooks;
use apiflow_core::{TestCase, TestCaseResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::TestCaseExecutor;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Hooks and execution id prepared for one test case.
pub struct CaseHooks {
    pub hooks: Arc<dyn PersistenceHooks>,
    pub case_execution_id: String,
}

pub type HooksFactory = Box<dyn Fn(&TestCase) -> anyhow::Result<CaseHooks> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SuiteStatus {
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteResult {
    pub suite_execution_id: String,
    pub status: SuiteStatus,
    pub total_cases: usize,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<TestCaseResult>,
}

pub struct SuiteRunner<T: HttpTransport = ReqwestTransport> {
    executor: TestCaseExecutor<T>,
    cancel: CancellationToken,
    hooks_factory: Option<HooksFactory>,
    suite_execution_id: String,
}

impl<T: HttpTransport> SuiteRunner<T> {
    pub fn new(executor: TestCaseExecutor<T>, cancel: CancellationToken) -> Self {
        Self {
            executor,
            cancel,
            hooks_factory: None,
            suite_execution_id: Uuid::new_v4().to_string(),
        }
    }

    /// Give every test case its own hooks, e.g. a fresh run directory.
    pub fn with_hooks_factory(mut self, factory: HooksFactory) -> Self {
        self.hooks_factory = Some(factory);
        self
    }

    pub fn suite_execution_id(&self) -> &str {
        &self.suite_execution_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run cases in order. Failed cases do not stop the suite; cancellation
    /// is honored between cases, never mid-case.
    pub async fn run(&self, cases: &[TestCase]) -> SuiteResult {
        let start_time = Utc::now();
        let mut status = SuiteStatus::Completed;
        let mut results = Vec::with_capacity(cases.len());
        info!(suite_execution_id = %self.suite_execution_id, cases = cases.len(), "Starting suite");

        for (idx, case) in cases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = cases.len() - idx, "Suite stopped before running all cases");
                status = SuiteStatus::Stopped;
                break;
            }
            info!("[{}/{}] Running test case {}", idx + 1, cases.len(), case.name);

            let executor = self.executor_for(case);
            let result = executor.execute(case).await;
            if !result.success {
                warn!(test_case = %case.name, error = ?result.error, "Test case failed");
            }
            results.push(result);
        }

        let end_time = Utc::now();
        let passed_cases = results.iter().filter(|r| r.success).count();
        let suite = SuiteResult {
            suite_execution_id: self.suite_execution_id.clone(),
            status,
            total_cases: cases.len(),
            passed_cases,
            failed_cases: results.len() - passed_cases,
            passed_steps: results.iter().map(|r| r.passed_steps).sum(),
            failed_steps: results.iter().map(|r| r.failed_steps).sum(),
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
            results,
        };
        info!(
            status = ?suite.status,
            passed = suite.passed_cases,
            failed = suite.failed_cases,
            "Suite finished"
        );
        suite
    }

    /// Each case gets its own transport, plus its own hooks when a factory
    /// is set.
    fn executor_for(&self, case: &TestCase) -> TestCaseExecutor<T> {
        let suite_id = Some(self.suite_execution_id.clone());
        let executor = self.executor.clone().with_fresh_transport();
        let Some(factory) = &self.hooks_factory else {
            return executor.with_execution_ids(Some(Uuid::new_v4().to_string()), suite_id);
        };
        match factory(case) {
            Ok(prepared) => executor
                .with_hooks(prepared.hooks)
                .with_execution_ids(Some(prepared.case_execution_id), suite_id),
            Err(e) => {
                warn!(test_case = %case.name, "Failed to prepare case hooks: {e:#}");
                executor.with_execution_ids(Some(Uuid::new_v4().to_string()), suite_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpRequest, HttpResponse, TransportError};
    use apiflow_core::hooks::NoopHooks;
    use apiflow_core::{EngineConfig, EnvironmentConfig, FlowGraph};
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers 500 for any URL containing `fail`, 200 otherwise.
    struct StatusTransport;

    #[async_trait]
    impl HttpTransport for StatusTransport {
        fn clear_cookies(&self) {}

        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            let status = if request.url.contains("fail") { 500 } else { 200 };
            Ok(HttpResponse {
                status,
                headers: Map::new(),
                body: json!({}),
            })
        }
    }

    /// Tags every response with the generation of the transport that sent it.
    struct GenerationTransport {
        generation: usize,
        built: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HttpTransport for GenerationTransport {
        fn clear_cookies(&self) {}

        async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 200,
                headers: Map::new(),
                body: json!({"generation": self.generation}),
            })
        }

        fn fresh(&self) -> Result<Option<Self>, TransportError> {
            Ok(Some(Self {
                generation: self.built.fetch_add(1, Ordering::SeqCst) + 1,
                built: Arc::clone(&self.built),
            }))
        }
    }

    fn case(name: &str, url: &str) -> TestCase {
        let flow = FlowGraph::from_json(json!({
            "nodes": [
                {"id": "start", "type": "start", "data": {}},
                {"id": "call", "type": "api", "data": {
                    "method": "GET",
                    "url": url,
                    "assertions": [{"field": "status", "operator": "equals", "expected": 200}]
                }}
            ],
            "edges": [{"id": "e1", "source": "start", "target": "call"}]
        }))
        .unwrap();
        TestCase {
            id: name.to_string(),
            name: name.to_string(),
            description: None,
            flow_config: flow,
        }
    }

    fn runner() -> SuiteRunner<StatusTransport> {
        let executor = TestCaseExecutor::with_transport(
            StatusTransport,
            EnvironmentConfig::default(),
            EngineConfig::default(),
        );
        SuiteRunner::new(executor, CancellationToken::new())
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_suite() {
        let cases = vec![
            case("first", "http://api.test/ok"),
            case("second", "http://api.test/fail"),
            case("third", "http://api.test/ok"),
        ];

        let result = runner().run(&cases).await;

        assert_eq!(result.status, SuiteStatus::Completed);
        assert_eq!(result.total_cases, 3);
        assert_eq!(result.passed_cases, 2);
        assert_eq!(result.failed_cases, 1);
        assert_eq!(result.passed_steps, 2);
        assert_eq!(result.failed_steps, 1);
        let names: Vec<&str> = result.results.iter().map(|r| r.test_case_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_cases() {
        let runner = runner();
        runner.cancellation_token().cancel();

        let result = runner.run(&[case("only", "http://api.test/ok")]).await;

        assert_eq!(result.status, SuiteStatus::Stopped);
        assert_eq!(result.total_cases, 1);
        assert!(result.results.is_empty());
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["status"], json!("stopped"));
    }

    #[tokio::test]
    async fn hooks_factory_runs_once_per_case() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let runner = runner().with_hooks_factory(Box::new(move |case: &TestCase| -> anyhow::Result<CaseHooks> {
            recorder.lock().unwrap().push(case.name.clone());
            if case.name == "broken" {
                anyhow::bail!("no run directory");
            }
            Ok(CaseHooks {
                hooks: Arc::new(NoopHooks),
                case_execution_id: format!("exec-{}", case.name),
            })
        }));

        let result = runner
            .run(&[case("a", "http://api.test/ok"), case("broken", "http://api.test/ok")])
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "broken"]);
        assert_eq!(result.passed_cases, 2);
        assert!(!runner.suite_execution_id().is_empty());
    }

    #[tokio::test]
    async fn every_case_gets_its_own_transport() {
        let built = Arc::new(AtomicUsize::new(0));
        let transport = GenerationTransport {
            generation: 0,
            built: Arc::clone(&built),
        };
        let executor = TestCaseExecutor::with_transport(
            transport,
            EnvironmentConfig::default(),
            EngineConfig::default(),
        );
        let runner = SuiteRunner::new(executor, CancellationToken::new());

        let result = runner
            .run(&[case("one", "http://api.test/ok"), case("two", "http://api.test/ok")])
            .await;

        assert_eq!(built.load(Ordering::SeqCst), 2);
        let generations: Vec<Value> = result
            .results
            .iter()
            .map(|r| r.steps[0].response.as_ref().unwrap()["body"]["generation"].clone())
            .collect();
        assert_eq!(generations, vec![json!(1), json!(2)]);
    }
}
