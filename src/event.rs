use serde::{Deserialize, Serialize};

/// Lifecycle transition reported by `go test -json` for a test or package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Run,
    Pause,
    #[serde(rename = "cont")]
    Continue,
    Pass,
    Fail,
    Skip,
    Output,
}

impl Action {
    /// A terminal action ends the lifecycle of its test or package.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Pass | Action::Fail | Action::Skip)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Run => f.write_str("run"),
            Action::Pause => f.write_str("pause"),
            Action::Continue => f.write_str("cont"),
            Action::Pass => f.write_str("pass"),
            Action::Fail => f.write_str("fail"),
            Action::Skip => f.write_str("skip"),
            Action::Output => f.write_str("output"),
        }
    }
}

/// A single structured record from the test tool's JSON stream.
///
/// Field names mirror the `go test -json` wire shape so that decoding a raw
/// line and re-serializing it round-trips. An event with no `test` field
/// refers to the package as a whole. Events are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    /// RFC3339 timestamp. For legacy text input this is a synthetic monotonic
    /// stamp, not wall-clock — order-sensitive consumers should use `seq`.
    #[serde(rename = "Time", default, skip_serializing_if = "String::is_empty")]
    pub time: String,

    #[serde(rename = "Action")]
    pub action: Action,

    #[serde(rename = "Package", default, skip_serializing_if = "String::is_empty")]
    pub package: String,

    #[serde(rename = "Test", default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,

    #[serde(rename = "Output", default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(rename = "Elapsed", default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,

    /// Ingestion sequence number assigned by the parser, monotonic per run.
    /// Not part of the wire shape.
    #[serde(skip)]
    pub seq: u64,
}

impl TestEvent {
    /// Whether this event refers to the package rather than a single test.
    pub fn is_package_event(&self) -> bool {
        self.test.is_none()
    }

    /// Key identifying a test globally: `(package, test)`.
    pub fn key(&self) -> (&str, &str) {
        (self.package.as_str(), self.test.as_deref().unwrap_or(""))
    }
}

impl std::fmt::Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.test, &self.output) {
            (Some(test), _) => write!(f, "[{}] {} {}", self.action, self.package, test),
            (None, Some(out)) => write!(f, "[{}] {} {}", self.action, self.package, out.trim_end()),
            (None, None) => write!(f, "[{}] {}", self.action, self.package),
        }
    }
}

/// Source location extracted from failing test output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub file: String,
    pub line: u32,
}

/// Structured failure context derived from a failing test's output lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<ErrorLocation>,
}

/// Derived per-test outcome, produced by the grouper.
///
/// Terminal state is only set once a pass/fail/skip event has arrived for the
/// test; events after the terminal one are discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub package: String,
    pub test: String,
    pub passed: bool,
    pub skipped: bool,
    /// Seconds, from the terminal event's elapsed field.
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<ErrorContext>,
    pub output_lines: Vec<String>,
}

/// Sum the durations of a slice of results.
pub fn total_duration(results: &[TestResult]) -> f64 {
    results.iter().map(|r| r.duration).sum()
}

/// Count of `(passed, failed, skipped)` across results.
pub fn tally(results: &[TestResult]) -> (usize, usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for r in results {
        if r.skipped {
            skipped += 1;
        } else if r.passed {
            passed += 1;
        } else {
            failed += 1;
        }
    }
    (passed, failed, skipped)
}
