use anyhow::{Context, Result};
use apiflow_core::storage::RunStore;
use apiflow_core::{EngineConfig, EnvironmentConfig, FlowGraph, TestCase};
use apiflow_engine::{CaseHooks, SuiteResult, SuiteRunner, TestCaseExecutor};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// ── CLI ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "apiflow", about = "Run API test flows")]
struct Cli {
    /// Test case or flow graph JSON files, run in order
    #[arg(required = true)]
    cases: Vec<PathBuf>,

    /// Environment config JSON (base URL, auth token, session cookies)
    #[arg(long)]
    env: Option<PathBuf>,

    /// Engine config JSON (timeouts, wait defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persist step records and execution logs under this directory
    #[arg(long)]
    runs_dir: Option<PathBuf>,

    /// Stream progress events to stdout as JSON lines, ending with a
    /// `result` line instead of the pretty-printed summary
    #[arg(long)]
    events: bool,

    /// Directory for the rolling trace log
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

// ── Loading ─────────────────────────────────────────────────────

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Accepts a full test case (`{id, name, flowConfig}`) or a bare flow graph,
/// which is named after its file.
fn load_case(path: &Path) -> Result<TestCase> {
    let value: Value = read_json(path)?;
    if value.get("flowConfig").is_some() {
        let mut case: TestCase = serde_json::from_value(value)
            .with_context(|| format!("Invalid test case in {}", path.display()))?;
        if case.name.is_empty() {
            case.name = file_stem(path);
        }
        return Ok(case);
    }

    let flow = FlowGraph::from_json(value)
        .with_context(|| format!("Invalid flow graph in {}", path.display()))?;
    let name = file_stem(path);
    Ok(TestCase {
        id: name.clone(),
        name,
        description: None,
        flow_config: flow,
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flow".to_string())
}

// ── Logging ─────────────────────────────────────────────────────

fn init_tracing(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("apiflow")
        .filename_suffix("jsonl")
        .build(log_dir)
        .context("Failed to create log file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_filter = EnvFilter::new("trace");

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(file_filter),
        )
        .init();
    Ok(guard)
}

// ── Main ────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = init_tracing(&cli.log_dir)?;
    let stream_events = cli.events;

    let result = run(cli).await?;
    println!("{}", render_result(&result, stream_events)?);

    drop(guard);
    if result.failed_cases > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// With `--events` the summary is one more line of the event stream, so
/// consumers can read stdout line by line.
fn render_result(result: &SuiteResult, stream_events: bool) -> Result<String> {
    if stream_events {
        Ok(serde_json::to_string(&json!({ "type": "result", "data": result }))?)
    } else {
        Ok(serde_json::to_string_pretty(result)?)
    }
}

async fn run(cli: Cli) -> Result<SuiteResult> {
    let environment: EnvironmentConfig = match &cli.env {
        Some(path) => read_json(path)?,
        None => EnvironmentConfig::default(),
    };
    let config: EngineConfig = match &cli.config {
        Some(path) => read_json(path)?,
        None => EngineConfig::default(),
    };
    let cases = cli
        .cases
        .iter()
        .map(|path| load_case(path))
        .collect::<Result<Vec<_>>>()?;
    info!(cases = cases.len(), base_url = ?environment.base_url(), "Loaded test cases");

    let mut executor = TestCaseExecutor::new(environment, config)
        .context("Failed to build HTTP client")?;

    let printer = if cli.events {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        executor = executor.with_events(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Failed to serialize event: {e}"),
                }
            }
        }))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let mut runner = SuiteRunner::new(executor, cancel.clone());
    if let Some(runs_dir) = cli.runs_dir {
        runner = runner.with_hooks_factory(Box::new(move |case: &TestCase| -> Result<CaseHooks> {
            let mut store = RunStore::new(&runs_dir, &case.name);
            let case_execution_id = store.begin_execution()?;
            info!(path = %store.base_path().join(&case_execution_id).display(), "Recording run");
            Ok(CaseHooks {
                hooks: Arc::new(store),
                case_execution_id,
            })
        }));
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current test case");
            cancel.cancel();
        }
    });

    let result = runner.run(&cases).await;
    drop(runner);
    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            warn!("Event printer failed: {e}");
        }
    }
    Ok(result)
}
