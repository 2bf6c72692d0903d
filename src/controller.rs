use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::coverage::{self, CoverageMetrics};
use crate::error::{Error, Result};
use crate::event::{tally, Action, TestEvent, TestResult};
use crate::group::GroupedEvents;
use crate::gotool;
use crate::hub::Hub;
use crate::parser::{EventParser, ParseMode};
use crate::process::{resolve_working_dir, ProcessRunner};
use crate::project;
use crate::runlog::RunLogger;
use crate::snapshot::{CommandMessage, Envelope};
use crate::tree::{TestTree, TreeHandle};

/// Quiet period after a file change before a run starts.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Filesystem change notification consumed from the external watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: PathBuf,
    pub op: FileOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Create,
    Write,
    Remove,
}

/// What one completed pipeline pass produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub tree: Arc<TestTree>,
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Non-fatal trouble the run finished with: a decode error, a timeout, or
    /// a package build failure. The tree still reflects what arrived.
    pub error: Option<Error>,
    pub coverage: Option<CoverageMetrics>,
}

impl RunOutcome {
    /// Launcher exit code: 0 all passed, 1 tests failed, 2 process trouble.
    pub fn exit_code(&self) -> u8 {
        match self.error {
            Some(Error::Package { .. }) => 1,
            Some(_) => 2,
            None if self.failed > 0 => 1,
            None => 0,
        }
    }
}

/// Orchestrates the pipeline: change → runner → parser → grouper →
/// aggregator → hub. Holds at most one inflight run; change bursts coalesce
/// into a single pending run.
pub struct Controller {
    config: RunConfig,
    hub: Arc<Hub>,
    tree: TreeHandle,
    run_gate: tokio::sync::Mutex<()>,
    run_counter: AtomicU64,
    /// Tee parsed events to the run log directory.
    log_runs: bool,
}

impl Controller {
    pub fn new(config: RunConfig) -> Self {
        let hub = Arc::new(Hub::with_concurrency(config.broadcast_concurrency));
        Self {
            config,
            hub,
            tree: TreeHandle::new(),
            run_gate: tokio::sync::Mutex::new(()),
            run_counter: AtomicU64::new(0),
            log_runs: true,
        }
    }

    pub fn without_run_logs(mut self) -> Self {
        self.log_runs = false;
        self
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn tree(&self) -> &TreeHandle {
        &self.tree
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute one full pipeline pass and publish the result.
    ///
    /// Fails with `AlreadyRunning` when a pass is inflight, and with
    /// `Cancelled` when `token` fires before completion — a cancelled run
    /// publishes nothing.
    pub async fn run_once(&self, token: CancellationToken) -> Result<RunOutcome> {
        let _gate = self
            .run_gate
            .try_lock()
            .map_err(|_| Error::AlreadyRunning)?;

        self.hub.set_throttle(self.config.broadcast_throttle).await;

        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started = std::time::Instant::now();
        let cwd = resolve_working_dir(&self.config);
        let module = project::module_name(&cwd);
        let packages = gotool::expand_packages(&self.config, &cwd).await?;

        let mut config = self.config.clone();
        config.cwd = Some(cwd.clone());

        let mode = if config.json_output {
            ParseMode::Json
        } else {
            ParseMode::Text
        };
        let mut parser = EventParser::new(mode);
        let mut events: Vec<TestEvent> = Vec::new();
        let mut run_error: Option<Error> = None;

        for package in &packages {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let runner = ProcessRunner::new(config.clone());
            let (line_tx, mut line_rx) = mpsc::channel::<String>(256);

            let run_fut = runner.run(token.clone(), package, line_tx);
            let collect_fut = async {
                let mut stopped = false;
                while let Some(line) = line_rx.recv().await {
                    if stopped {
                        continue; // keep draining so the runner is not stalled
                    }
                    match parser.push_line(&line) {
                        Ok(parsed) => events.extend(parsed),
                        Err(e) => {
                            tracing::warn!("event decode failed, flushing buffered events: {e}");
                            if run_error.is_none() {
                                run_error = Some(e);
                            }
                            stopped = true;
                        }
                    }
                }
            };

            let (run_result, ()) = tokio::join!(run_fut, collect_fut);
            match run_result {
                Ok(summary) => {
                    tracing::debug!(
                        package = %package,
                        exit_code = summary.exit_code,
                        lines = summary.lines,
                        "package run finished"
                    );
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e @ Error::Timeout(_)) => {
                    // The tree still reflects everything before the deadline.
                    if run_error.is_none() {
                        run_error = Some(e);
                    }
                    break;
                }
                Err(Error::Package {
                    package: pkg,
                    code,
                    output,
                }) => {
                    // Build failure: surface it as a failing package node.
                    for line in output.lines() {
                        events.push(synthetic_event(Action::Output, &pkg, Some(line)));
                    }
                    events.push(synthetic_event(Action::Fail, &pkg, None));
                    if run_error.is_none() {
                        run_error = Some(Error::Package {
                            package: pkg,
                            code,
                            output,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        events.extend(parser.finish());
        for (i, event) in events.iter_mut().enumerate() {
            event.seq = i as u64;
        }

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut logger = self.make_run_logger(run_id);
        if let Some(ref mut logger) = logger {
            for event in &events {
                logger.log_event(event);
            }
        }

        let grouped = GroupedEvents::from_events(&events);
        let results = grouped.summarize();
        let (passed, failed, skipped) = tally(&results);
        let tree = TestTree::build(&grouped, module.as_deref());
        self.tree.publish(tree);
        let tree = self.tree.latest();

        self.broadcast_results(&results, &tree).await;

        let coverage = if config.coverage && failed == 0 && run_error.is_none() {
            match self.collect_coverage(&config, &cwd, &packages).await {
                Ok(metrics) => {
                    if let Ok(line) = Envelope::coverage(metrics.clone()).encode_line() {
                        self.hub.broadcast(&line).await;
                    }
                    Some(metrics)
                }
                Err(e) => {
                    // The published tree is unaffected by a coverage failure.
                    tracing::warn!("coverage ingestion failed: {e}");
                    run_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        let success = failed == 0 && run_error.is_none();
        if let Some(ref mut logger) = logger {
            logger.finalize(success, Some(started.elapsed().as_millis() as u64));
        }

        Ok(RunOutcome {
            tree,
            results,
            passed,
            failed,
            skipped,
            error: run_error,
            coverage,
        })
    }

    async fn broadcast_results(&self, results: &[TestResult], tree: &TestTree) {
        for result in results {
            if let Ok(line) = Envelope::test_status(result).encode_line() {
                self.hub.broadcast(&line).await;
            }
        }
        if let Ok(line) = Envelope::tree_snapshot(tree).encode_line() {
            self.hub.broadcast(&line).await;
        }
    }

    async fn collect_coverage(
        &self,
        config: &RunConfig,
        cwd: &std::path::Path,
        packages: &[String],
    ) -> Result<CoverageMetrics> {
        coverage::validate_profile_path(&config.coverage_path)?;
        let binary = gotool::resolve_go_binary(config)?;
        let args = gotool::build_coverage_args(config, packages)?;

        let output = tokio::process::Command::new(&binary)
            .args(&args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(Error::ProcessStart)?;
        if !output.status.success() {
            return Err(Error::CoverageParse(format!(
                "coverage run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let profile = std::fs::read_to_string(cwd.join(&config.coverage_path))?;
        coverage::parse_profile(&profile)
    }

    fn make_run_logger(&self, run_id: u64) -> Option<RunLogger> {
        if !self.log_runs {
            return None;
        }
        match RunLogger::new(&format!("run-{run_id}"), &self.config.package_pattern) {
            Ok(logger) => Some(logger),
            Err(e) => {
                tracing::warn!("run log disabled: {e}");
                None
            }
        }
    }

    /// Consume file-change notifications until the channel closes or `token`
    /// fires. Changes are debounced; a change during a run cancels it (the
    /// cancelled run reports `Cancelled` and publishes nothing) and the newest
    /// request becomes the pending run.
    pub async fn watch(
        self: Arc<Self>,
        mut file_events: mpsc::Receiver<FileEvent>,
        token: CancellationToken,
    ) {
        self.notify(CommandMessage::WatchStatusChanged { enabled: true })
            .await;

        let mut inflight: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = file_events.recv() => {
                    let Some(event) = maybe else { break };
                    if !is_relevant(&event) {
                        continue;
                    }
                    tracing::debug!(path = %event.path.display(), op = ?event.op, "file change");

                    // Debounce: swallow the burst, keep only the fact that
                    // something changed.
                    let quiet = tokio::time::sleep(DEBOUNCE);
                    tokio::pin!(quiet);
                    loop {
                        tokio::select! {
                            _ = &mut quiet => break,
                            more = file_events.recv() => {
                                if more.is_none() {
                                    break;
                                }
                                quiet.as_mut().reset(tokio::time::Instant::now() + DEBOUNCE);
                            }
                        }
                    }

                    // Cancel the inflight run and wait for its cleanup.
                    if let Some((run_token, handle)) = inflight.take() {
                        run_token.cancel();
                        let _ = handle.await;
                    }

                    let run_token = token.child_token();
                    let this = self.clone();
                    let spawn_token = run_token.clone();
                    let handle = tokio::spawn(async move {
                        match this.run_once(spawn_token).await {
                            Ok(outcome) => {
                                tracing::info!(
                                    passed = outcome.passed,
                                    failed = outcome.failed,
                                    skipped = outcome.skipped,
                                    "run complete"
                                );
                            }
                            Err(Error::Cancelled) => {
                                tracing::debug!("run cancelled by newer change");
                            }
                            Err(e) => {
                                tracing::error!("run failed: {e}");
                            }
                        }
                    });
                    inflight = Some((run_token, handle));
                }
            }
        }

        if let Some((run_token, handle)) = inflight.take() {
            run_token.cancel();
            let _ = handle.await;
        }
        self.notify(CommandMessage::WatchStatusChanged { enabled: false })
            .await;
    }

    async fn notify(&self, message: CommandMessage) {
        if let Ok(line) = Envelope::Command(message).encode_line() {
            self.hub.broadcast(&line).await;
        }
    }
}

fn synthetic_event(action: Action, package: &str, output: Option<&str>) -> TestEvent {
    TestEvent {
        time: String::new(),
        action,
        package: package.to_string(),
        test: None,
        output: output.map(str::to_string),
        elapsed: None,
        seq: 0,
    }
}

/// Only changes to Go source files trigger runs.
fn is_relevant(event: &FileEvent) -> bool {
    event
        .path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("go"))
}
