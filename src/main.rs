use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sentinel::{
    config::RunConfig,
    controller::{Controller, FileEvent},
    coverage,
    error::{Error, Result},
    gotool,
    hub::Subscriber,
    settings::Settings,
    CancellationToken,
};

#[derive(Parser)]
#[command(
    name = "sentinel",
    about = "Interactive test watcher for Go projects",
    long_about = "Runs `go test` over a package pattern, aggregates JSON test events and\n\
                  coverage into a result tree, and streams NDJSON snapshots to stdout.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test pipeline once and exit.
    Run {
        /// Package pattern to test (e.g. "./...", "./pkg/foo")
        pattern: Option<String>,

        /// Working directory (defaults to the nearest go.mod ancestor)
        #[arg(short = 'd', long)]
        cwd: Option<PathBuf>,

        /// Per-run deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Only run tests matching this name filter
        #[arg(long = "run", value_name = "FILTER")]
        test_filter: Option<String>,

        /// Parse legacy text output instead of -json events
        #[arg(long)]
        no_json: bool,

        /// Collect a coverage profile after a passing run
        #[arg(long)]
        cover: bool,

        /// Override the go binary path
        #[arg(long)]
        go: Option<PathBuf>,

        /// Disable the NDJSON run log
        #[arg(long)]
        no_run_log: bool,

        /// Enable verbose (debug-level) logging to stderr
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Watch for file changes (NDJSON FileEvents on stdin) and re-run tests.
    Watch {
        /// Package pattern to test
        pattern: Option<String>,

        /// Working directory (defaults to the nearest go.mod ancestor)
        #[arg(short = 'd', long)]
        cwd: Option<PathBuf>,

        /// Per-run deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Only run tests matching this name filter
        #[arg(long = "run", value_name = "FILTER")]
        test_filter: Option<String>,

        /// Collect a coverage profile after each passing run
        #[arg(long)]
        cover: bool,

        /// Override the go binary path
        #[arg(long)]
        go: Option<PathBuf>,

        /// Enable verbose (debug-level) logging to stderr
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Ingest a coverage profile and print its metrics.
    Coverage {
        /// Profile path (defaults to coverage.out)
        #[arg(default_value = "coverage.out")]
        profile: String,

        /// Also render an HTML report to this path via `go tool cover`
        #[arg(long)]
        html: Option<String>,
    },

    /// Manage configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the fully resolved configuration (global + project merged).
    Show,
    /// Create a template sentinel.toml in the current directory.
    Init,
    /// Print the global config file path.
    Path,
}

/// Writes hub messages to stdout, one JSON line per message.
struct StdoutSink {
    out: std::sync::Mutex<std::io::Stdout>,
}

impl StdoutSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            out: std::sync::Mutex::new(std::io::stdout()),
        })
    }
}

#[async_trait]
impl Subscriber for StdoutSink {
    async fn send(&self, message: &[u8]) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| Error::Other("stdout lock poisoned".into()))?;
        out.write_all(message)?;
        out.flush()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let raw_args: Vec<String> = std::env::args().collect();
    let verbose_requested = raw_args.iter().any(|a| a == "--verbose" || a == "-v");

    let cwd = std::env::current_dir().ok();
    let settings = Settings::load_with_project(cwd.as_deref());

    // RUST_LOG takes precedence, then --verbose, then settings.
    let default_level = if verbose_requested {
        "debug"
    } else {
        settings.log_level.as_deref().unwrap_or("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            pattern,
            cwd,
            timeout,
            test_filter,
            no_json,
            cover,
            go,
            no_run_log,
            verbose: _,
        } => {
            let config = build_config(
                &settings,
                pattern,
                cwd,
                timeout,
                test_filter,
                no_json,
                cover,
                go,
            );

            let mut controller = Controller::new(config);
            if no_run_log {
                controller = controller.without_run_logs();
            }
            let controller = Arc::new(controller);
            let conn = controller.hub().add(StdoutSink::new()).await;

            let token = CancellationToken::new();
            spawn_ctrl_c(token.clone());

            let result = controller.run_once(token).await;
            controller.hub().remove(&conn).await;

            match result {
                Ok(outcome) => {
                    if let Some(ref e) = outcome.error {
                        eprintln!("warning: {e}");
                    }
                    eprintln!(
                        "{} passed, {} failed, {} skipped",
                        outcome.passed, outcome.failed, outcome.skipped
                    );
                    ExitCode::from(outcome.exit_code())
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(2)
                }
            }
        }

        Commands::Watch {
            pattern,
            cwd,
            timeout,
            test_filter,
            cover,
            go,
            verbose: _,
        } => {
            let config = build_config(
                &settings,
                pattern,
                cwd,
                timeout,
                test_filter,
                false,
                cover,
                go,
            );

            let controller = Arc::new(Controller::new(config));
            controller.hub().add(StdoutSink::new()).await;

            let token = CancellationToken::new();
            spawn_ctrl_c(token.clone());

            let (tx, rx) = tokio::sync::mpsc::channel::<FileEvent>(64);
            tokio::spawn(read_file_events(tx));

            controller.watch(rx, token).await;
            ExitCode::SUCCESS
        }

        Commands::Coverage { profile, html } => match run_coverage(&profile, html.as_deref()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(2)
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                match toml::to_string_pretty(&settings) {
                    Ok(text) => {
                        println!("{text}");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("error: {e}");
                        ExitCode::from(2)
                    }
                }
            }
            ConfigAction::Init => {
                let path = PathBuf::from("sentinel.toml");
                if path.exists() {
                    eprintln!("error: sentinel.toml already exists");
                    return ExitCode::from(2);
                }
                match std::fs::write(&path, Settings::template()) {
                    Ok(()) => {
                        println!("created {}", path.display());
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("error: {e}");
                        ExitCode::from(2)
                    }
                }
            }
            ConfigAction::Path => match Settings::config_path() {
                Some(path) => {
                    println!("{}", path.display());
                    ExitCode::SUCCESS
                }
                None => {
                    eprintln!("error: cannot determine config directory");
                    ExitCode::from(2)
                }
            },
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    settings: &Settings,
    pattern: Option<String>,
    cwd: Option<PathBuf>,
    timeout: Option<u64>,
    test_filter: Option<String>,
    no_json: bool,
    cover: bool,
    go: Option<PathBuf>,
) -> RunConfig {
    let pattern = pattern
        .or_else(|| settings.default_package_pattern.clone())
        .unwrap_or_else(|| "./...".to_string());

    let mut config = RunConfig::new(pattern);
    settings.apply(&mut config);

    // CLI flags win over settings.
    if let Some(cwd) = cwd {
        config.cwd = Some(cwd);
    }
    if let Some(secs) = timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(filter) = test_filter {
        config.test_name_filter = Some(filter);
    }
    if no_json {
        config.json_output = false;
    }
    if cover {
        config.coverage = true;
    }
    if let Some(go) = go {
        config.go_binary = Some(go);
    }
    config
}

fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
}

/// Read NDJSON `FileEvent`s from stdin and forward them to the controller.
/// This is the external watcher's event contract; any watcher that emits
/// `{"path": "...", "op": "write"}` lines can drive the watch loop.
async fn read_file_events(tx: tokio::sync::mpsc::Sender<FileEvent>) {
    use futures::StreamExt;
    use tokio::io::AsyncBufReadExt;
    use tokio_stream::wrappers::LinesStream;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = LinesStream::new(stdin.lines());
    while let Some(Ok(line)) = lines.next().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FileEvent>(&line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("ignoring malformed file event: {e}"),
        }
    }
}

fn run_coverage(profile: &str, html: Option<&str>) -> Result<()> {
    let metrics = coverage::ingest_profile(profile)?;
    println!(
        "statements: {:.1}%  lines: {:.1}%  branches: {:.1}%",
        metrics.statement, metrics.line, metrics.branch
    );
    let mut files: Vec<_> = metrics.file_metrics.iter().collect();
    files.sort_by(|a, b| a.0.cmp(b.0));
    for (file, fm) in files {
        println!("  {file}: {:.1}% ({} uncovered lines)", fm.line, fm.uncovered_lines.len());
    }

    if let Some(html_out) = html {
        let config = RunConfig::default();
        let binary = gotool::resolve_go_binary(&config)?;
        let args = gotool::build_cover_report_args(profile, html_out)?;
        let status = std::process::Command::new(&binary)
            .args(&args)
            .status()
            .map_err(Error::ProcessStart)?;
        if !status.success() {
            return Err(Error::Other(format!(
                "go tool cover exited with {}",
                status.code().unwrap_or(-1)
            )));
        }
        println!("wrote {html_out}");
    }
    Ok(())
}
