use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::event::TestEvent;
use crate::gotool;

/// Maximum bytes of forwarded output retained for error reporting.
const MAX_TAIL_BYTES: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL for the process group.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Tears down the child's whole process group, at most once.
///
/// Every exit path calls [`kill`](ChildGuard::kill) explicitly; the `Drop`
/// impl is the backstop for early returns. Teardown also happens after a
/// normal exit, since the test tool can leave helper children behind.
pub(crate) struct ChildGuard {
    pid: u32,
    done: AtomicBool,
}

impl ChildGuard {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            done: AtomicBool::new(false),
        }
    }

    /// Kill the process group. Later calls are no-ops.
    pub(crate) fn kill(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            kill_group(self.pid);
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// SIGTERM the group, give it [`KILL_GRACE`], then SIGKILL whatever remains.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => {
            std::thread::spawn(move || {
                std::thread::sleep(KILL_GRACE);
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    tracing::debug!(pid, "follow-up SIGKILL not delivered: {e}");
                }
            });
        }
        // The group is already gone; nothing to escalate to.
        Err(e) => tracing::debug!(pid, "group SIGTERM skipped: {e}"),
    }
}

/// taskkill with the tree + force options takes descendants down with it.
#[cfg(windows)]
fn kill_group(pid: u32) {
    let taskkill = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
    if let Err(e) = taskkill {
        tracing::debug!(pid, "taskkill failed: {e}");
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_group(pid: u32) {
    tracing::warn!(pid, "process-tree cleanup not supported on this platform");
}

/// Lifecycle of a single runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Starting,
    Streaming,
    Draining,
    Terminated,
}

/// What a completed (non-failed) run looked like from the runner's side.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Child exit code. Non-zero with events forwarded means "tests failed",
    /// which the aggregator surfaces — not a process error.
    pub exit_code: i32,
    /// Total non-empty lines forwarded to the sink.
    pub lines: u64,
    /// Lines that decoded as test events (or matched legacy test markers).
    pub event_lines: u64,
}

/// Supervises one `go test` invocation at a time: spawns the command, streams
/// every non-empty stdout/stderr line to the sink in arrival order, enforces
/// the deadline and inactivity guards, and tears down the process tree.
pub struct ProcessRunner {
    config: RunConfig,
    state: Arc<Mutex<RunnerState>>,
}

impl ProcessRunner {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RunnerState::Idle)),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: RunnerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Run the test command for one package, forwarding output lines to `sink`.
    ///
    /// Returns when the process exits or `token` is cancelled. Exactly one run
    /// may be active per runner; concurrent calls fail with `AlreadyRunning`.
    pub async fn run(
        &self,
        token: CancellationToken,
        package: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<RunSummary> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != RunnerState::Idle {
                return Err(Error::AlreadyRunning);
            }
            *state = RunnerState::Starting;
        }

        let result = self.run_inner(token, package, sink).await;
        self.set_state(RunnerState::Idle);
        result
    }

    async fn run_inner(
        &self,
        token: CancellationToken,
        package: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<RunSummary> {
        let binary = gotool::resolve_go_binary(&self.config)?;
        let args = gotool::build_test_args(&self.config, package)?;
        let cwd = self
            .config
            .cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        validate_cwd(&cwd)?;

        tracing::debug!(
            binary = %binary.display(),
            args = ?args,
            cwd = %cwd.display(),
            "spawning test process"
        );

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // On Unix, create a new process group so we can kill the entire tree.
        #[cfg(unix)]
        cmd.process_group(0);

        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(Error::ProcessStart)?;

        let child_pid = child
            .id()
            .ok_or_else(|| Error::Other("failed to get child process ID".into()))?;
        let guard = ChildGuard::new(child_pid);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("failed to capture stderr".into()))?;

        // Both pipes feed one channel so the sink sees lines in arrival order.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        let stdout_task = spawn_line_reader(stdout, line_tx.clone());
        let stderr_task = spawn_line_reader(stderr, line_tx);

        let wait_handle = tokio::spawn(async move { child.wait().await });

        self.set_state(RunnerState::Streaming);

        let deadline = (!self.config.timeout.is_zero())
            .then(|| Instant::now() + self.config.timeout);
        let inactivity = self.config.inactivity_threshold;
        let mut ticker = tokio::time::interval(if inactivity.is_zero() {
            Duration::from_secs(3600)
        } else {
            inactivity
        });
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();

        let mut last_activity = Instant::now();
        let mut warned_inactive = false;
        let mut lines: u64 = 0;
        let mut event_lines: u64 = 0;
        let mut tail = String::new();
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            let deadline_sleep = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = deadline_sleep => {
                    let banner = format!(
                        "[runner] Test timed out after {}s",
                        self.config.timeout.as_secs()
                    );
                    let _ = sink.send(banner).await;
                    timed_out = true;
                    break;
                }
                _ = ticker.tick() => {
                    if !inactivity.is_zero()
                        && last_activity.elapsed() >= inactivity
                        && !warned_inactive
                    {
                        warned_inactive = true;
                        let warning = format!(
                            "[runner warning] No activity detected for {}s, possible hanging test in package {package}",
                            inactivity.as_secs()
                        );
                        tracing::warn!("{warning}");
                        let _ = sink.send(warning).await;
                    }
                }
                line = line_rx.recv() => {
                    match line {
                        Some(line) => {
                            last_activity = Instant::now();
                            warned_inactive = false;
                            lines += 1;
                            if counts_as_event(&self.config, &line) {
                                event_lines += 1;
                            }
                            append_capped(&mut tail, &line);
                            if sink.send(line).await.is_err() {
                                // Receiver gone; treat like cancellation.
                                cancelled = true;
                                break;
                            }
                        }
                        None => break, // both pipes closed
                    }
                }
            }
        }

        self.set_state(RunnerState::Draining);

        // Kill the process group on every path: cancellation, timeout, and
        // normal completion (the tool may have left helper children).
        guard.kill();
        stdout_task.abort();
        stderr_task.abort();

        if cancelled {
            self.set_state(RunnerState::Terminated);
            return Err(Error::Cancelled);
        }
        if timed_out {
            self.set_state(RunnerState::Terminated);
            return Err(Error::Timeout(self.config.timeout.as_secs()));
        }

        let status = match wait_handle.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.set_state(RunnerState::Terminated);
                return Err(Error::Io(e));
            }
            Err(e) => {
                self.set_state(RunnerState::Terminated);
                return Err(Error::Other(format!("join error: {e}")));
            }
        };

        self.set_state(RunnerState::Terminated);

        let exit_code = status.code().unwrap_or(-1);
        if !status.success() && event_lines == 0 {
            // Build failure or missing package: no test ever reported.
            return Err(Error::Package {
                package: package.to_string(),
                code: exit_code,
                output: tail,
            });
        }

        Ok(RunSummary {
            exit_code,
            lines,
            event_lines,
        })
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if tx.send(line).await.is_err() {
                return;
            }
        }
    })
}

/// Whether a forwarded line carries test lifecycle information. Used to tell
/// "tests failed" apart from "nothing ran" on a non-zero exit.
fn counts_as_event(config: &RunConfig, line: &str) -> bool {
    if config.json_output {
        line.starts_with('{') && serde_json::from_str::<TestEvent>(line).is_ok()
    } else {
        let trimmed = line.trim_start();
        trimmed.starts_with("=== RUN")
            || trimmed.starts_with("--- PASS")
            || trimmed.starts_with("--- FAIL")
            || trimmed.starts_with("--- SKIP")
            || line.starts_with("ok ")
            || line.starts_with("FAIL\t")
            || line.starts_with("FAIL ")
    }
}

fn append_capped(tail: &mut String, line: &str) {
    if tail.len() >= MAX_TAIL_BYTES {
        return;
    }
    if !tail.is_empty() {
        tail.push('\n');
    }
    let remaining = MAX_TAIL_BYTES - tail.len();
    if line.len() > remaining {
        tail.push_str(&line[..remaining]);
    } else {
        tail.push_str(line);
    }
}

fn validate_cwd(cwd: &Path) -> Result<()> {
    // One metadata call answers both "is it there" and "is it a directory".
    match std::fs::metadata(cwd) {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(Error::InvalidWorkDir(cwd.to_path_buf())),
    }
}

/// Resolve the working directory for a run: explicit config value, else the
/// nearest ancestor with a module descriptor, else the current directory.
pub fn resolve_working_dir(config: &RunConfig) -> PathBuf {
    if let Some(ref cwd) = config.cwd {
        return cwd.clone();
    }
    let here = std::env::current_dir().unwrap_or_default();
    crate::project::find_project_root(&here).unwrap_or(here)
}
