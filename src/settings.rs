use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// User settings loaded from `~/.config/sentinel/config.toml` and optionally
/// merged with a project-level `sentinel.toml` found by walking up from the
/// working directory. Project values win for scalar fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Package pattern when the CLI argument is omitted.
    #[serde(default)]
    pub default_package_pattern: Option<String>,

    /// Per-run deadline in seconds.
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// No-activity warning threshold in seconds.
    #[serde(default)]
    pub inactivity_secs: Option<u64>,

    /// Concurrent subscriber writes per broadcast.
    #[serde(default)]
    pub broadcast_concurrency: Option<usize>,

    /// Pause between broadcasts, in milliseconds.
    #[serde(default)]
    pub broadcast_throttle_ms: Option<u64>,

    /// Coverage profile output location.
    #[serde(default)]
    pub coverage_path: Option<String>,

    /// Override the `go` binary path.
    #[serde(default)]
    pub go_binary: Option<String>,

    /// Request JSON event output from the test tool.
    #[serde(default)]
    pub json_output: Option<bool>,

    /// Log level for tracing output (e.g. "debug", "info", "warn").
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Settings {
    /// Load settings from the default config file.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(Some(path)),
            None => Self::default(),
        }
    }

    /// Load global settings, then merge project-level overrides from `cwd`.
    pub fn load_with_project(cwd: Option<&Path>) -> Self {
        let global = Self::load();
        match cwd.and_then(Self::load_project) {
            Some((project, _path)) => global.merge(&project),
            None => global,
        }
    }

    /// Load settings from a specific path. A missing or unusable file is
    /// logged and treated as empty settings, never as a hard failure.
    pub fn load_from(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::parse_file(&path) {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(file = %path.display(), "ignoring settings: {e}");
                Self::default()
            }
        }
    }

    /// Fallible core of settings loading: `Ok(None)` when the file does not
    /// exist, `Err` when it exists but cannot be read or parsed.
    fn parse_file(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        let settings =
            toml::from_str(&text).map_err(|e| Error::Other(format!("invalid TOML: {e}")))?;
        Ok(Some(settings))
    }

    /// Walk up from `start` looking for `sentinel.toml`, returning the parsed
    /// settings and the path where they were found.
    pub fn load_project(start: &Path) -> Option<(Self, PathBuf)> {
        start
            .ancestors()
            .map(|dir| dir.join("sentinel.toml"))
            .find(|candidate| candidate.is_file())
            .map(|path| (Self::load_from(Some(path.clone())), path))
    }

    /// Overlay `project` onto these (global) settings: any field the project
    /// file sets wins, everything else falls through to the global value.
    pub fn merge(&self, project: &Settings) -> Settings {
        fn overlay<T: Clone>(project: &Option<T>, global: &Option<T>) -> Option<T> {
            project.as_ref().or(global.as_ref()).cloned()
        }

        Settings {
            default_package_pattern: overlay(
                &project.default_package_pattern,
                &self.default_package_pattern,
            ),
            default_timeout_secs: overlay(&project.default_timeout_secs, &self.default_timeout_secs),
            inactivity_secs: overlay(&project.inactivity_secs, &self.inactivity_secs),
            broadcast_concurrency: overlay(
                &project.broadcast_concurrency,
                &self.broadcast_concurrency,
            ),
            broadcast_throttle_ms: overlay(
                &project.broadcast_throttle_ms,
                &self.broadcast_throttle_ms,
            ),
            coverage_path: overlay(&project.coverage_path, &self.coverage_path),
            go_binary: overlay(&project.go_binary, &self.go_binary),
            json_output: overlay(&project.json_output, &self.json_output),
            log_level: overlay(&project.log_level, &self.log_level),
        }
    }

    /// Overlay these settings onto a run configuration. CLI flags should be
    /// applied after this so they take precedence.
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(secs) = self.default_timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.inactivity_secs {
            config.inactivity_threshold = Duration::from_secs(secs);
        }
        if let Some(workers) = self.broadcast_concurrency {
            config.broadcast_concurrency = workers;
        }
        if let Some(ms) = self.broadcast_throttle_ms {
            config.broadcast_throttle = Duration::from_millis(ms);
        }
        if let Some(ref path) = self.coverage_path {
            config.coverage_path.clone_from(path);
        }
        if let Some(ref binary) = self.go_binary {
            config.go_binary = Some(PathBuf::from(binary));
        }
        if let Some(json) = self.json_output {
            config.json_output = json;
        }
    }

    /// Default config file path: `~/.config/sentinel/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sentinel").join("config.toml"))
    }

    /// Generate a template config file as a TOML string.
    pub fn template() -> &'static str {
        r#"# sentinel configuration — sentinel.toml
#
# Place this file in your project root, or keep global defaults in
# ~/.config/sentinel/config.toml. Project values win.

# Package pattern when the CLI argument is omitted.
# default_package_pattern = "./..."

# Per-run deadline in seconds.
# default_timeout_secs = 120

# Warn about a possibly hanging test after this many silent seconds.
# inactivity_secs = 30

# Concurrent subscriber writes per broadcast.
# broadcast_concurrency = 16

# Pause between broadcasts, in milliseconds. 0 disables throttling.
# broadcast_throttle_ms = 0

# Coverage profile output location.
# coverage_path = "coverage.out"

# Override the `go` binary.
# go_binary = "/usr/local/go/bin/go"

# Request JSON event output (set false for legacy text parsing).
# json_output = true

# Log level: "error", "warn", "info", "debug", "trace".
# log_level = "warn"
"#
    }
}
