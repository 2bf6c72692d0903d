use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-run deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default no-activity warning threshold.
pub const DEFAULT_INACTIVITY: Duration = Duration::from_secs(30);

/// Default number of concurrent subscriber writes during a broadcast.
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 16;

/// Default coverage profile output location, relative to the project root.
pub const DEFAULT_COVERAGE_PATH: &str = "coverage.out";

/// Everything needed to run the test pipeline over a package set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Package pattern to test (e.g. `./...`, `./pkg/foo`).
    pub package_pattern: String,

    /// Working directory; defaults to the detected project root.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Per-run deadline. The test tool is also told about it via `-timeout`.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// How long the runner tolerates silence before warning about a
    /// possible hanging test.
    #[serde(default = "default_inactivity")]
    pub inactivity_threshold: Duration,

    /// Bound on concurrent subscriber writes per broadcast.
    #[serde(default = "default_broadcast_concurrency")]
    pub broadcast_concurrency: usize,

    /// Pause between broadcasts; zero means no throttling.
    #[serde(default)]
    pub broadcast_throttle: Duration,

    /// Where the coverage profile is written when coverage is requested.
    #[serde(default = "default_coverage_path")]
    pub coverage_path: String,

    /// Optional `-run` filter passed to the test tool.
    #[serde(default)]
    pub test_name_filter: Option<String>,

    /// Request `-json` event output; legacy text parsing is used when false.
    #[serde(default = "default_true")]
    pub json_output: bool,

    /// Collect a coverage profile after a successful run.
    #[serde(default)]
    pub coverage: bool,

    /// Override the `go` binary path.
    #[serde(default)]
    pub go_binary: Option<PathBuf>,

    /// Additional environment variables for the test process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_inactivity() -> Duration {
    DEFAULT_INACTIVITY
}

fn default_broadcast_concurrency() -> usize {
    DEFAULT_BROADCAST_CONCURRENCY
}

fn default_coverage_path() -> String {
    DEFAULT_COVERAGE_PATH.to_string()
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    pub fn new(package_pattern: impl Into<String>) -> Self {
        Self {
            package_pattern: package_pattern.into(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
            inactivity_threshold: DEFAULT_INACTIVITY,
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
            broadcast_throttle: Duration::ZERO,
            coverage_path: DEFAULT_COVERAGE_PATH.to_string(),
            test_name_filter: None,
            json_output: true,
            coverage: false,
            go_binary: None,
            env: HashMap::new(),
        }
    }

    /// Create a builder for `RunConfig`.
    pub fn builder(package_pattern: impl Into<String>) -> RunConfigBuilder {
        RunConfigBuilder::new(package_pattern)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new("./...")
    }
}

/// Fluent builder for `RunConfig`.
///
/// ```rust,no_run
/// use sentinel::config::RunConfig;
/// use std::time::Duration;
/// let config = RunConfig::builder("./...")
///     .timeout(Duration::from_secs(60))
///     .test_name_filter("TestParser")
///     .build();
/// ```
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn new(package_pattern: impl Into<String>) -> Self {
        Self {
            config: RunConfig::new(package_pattern),
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.config.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn inactivity_threshold(mut self, threshold: Duration) -> Self {
        self.config.inactivity_threshold = threshold;
        self
    }

    pub fn broadcast_concurrency(mut self, workers: usize) -> Self {
        self.config.broadcast_concurrency = workers;
        self
    }

    pub fn broadcast_throttle(mut self, throttle: Duration) -> Self {
        self.config.broadcast_throttle = throttle;
        self
    }

    pub fn coverage_path(mut self, path: impl Into<String>) -> Self {
        self.config.coverage_path = path.into();
        self
    }

    pub fn test_name_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.test_name_filter = Some(filter.into());
        self
    }

    pub fn json_output(mut self, json: bool) -> Self {
        self.config.json_output = json;
        self
    }

    pub fn coverage(mut self, coverage: bool) -> Self {
        self.config.coverage = coverage;
        self
    }

    pub fn go_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.go_binary = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}
