use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Marker in a package pattern that expands to every package below it.
pub const RECURSIVE_MARKER: &str = "...";

/// Resolve the `go` binary: user override > PATH lookup > error.
pub fn resolve_go_binary(config: &RunConfig) -> Result<PathBuf> {
    if let Some(ref p) = config.go_binary {
        return Ok(p.clone());
    }
    which::which("go").map_err(|_| Error::GoNotFound {
        binary: "go".to_string(),
    })
}

/// Whether a pattern needs `go list` expansion before execution.
///
/// Running a recursive pattern directly lets the tool spawn per-package
/// children outside our process-group control.
pub fn is_recursive_pattern(pattern: &str) -> bool {
    pattern.contains(RECURSIVE_MARKER)
}

/// Validate a user-supplied argument before it reaches the command line.
///
/// Rejects shell metacharacters, option-lookalikes, and upward traversal.
pub fn validate_argument(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument("empty argument".into()));
    }
    if value.starts_with('-') {
        return Err(Error::InvalidArgument(format!(
            "argument may not begin with '-': {value}"
        )));
    }
    if value.split('/').any(|seg| seg == "..") {
        return Err(Error::InvalidArgument(format!(
            "upward path traversal rejected: {value}"
        )));
    }
    const FORBIDDEN: &[char] = &['|', '&', ';', '$', '`', '>', '<', '(', ')', '\n', '\r', '\'', '"', '\\'];
    if let Some(c) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(Error::InvalidArgument(format!(
            "forbidden character {c:?} in argument: {value}"
        )));
    }
    Ok(())
}

/// Build the argument list for an event-streaming test invocation:
/// `test -json -v [-timeout <dur>] [-run <name>] <pkg>`.
///
/// `-json` is omitted when the config asks for legacy text output.
pub fn build_test_args(config: &RunConfig, package: &str) -> Result<Vec<String>> {
    validate_argument(package)?;

    let mut args = vec!["test".to_string()];
    if config.json_output {
        args.push("-json".to_string());
    }
    args.push("-v".to_string());

    if !config.timeout.is_zero() {
        args.push("-timeout".to_string());
        args.push(format!("{}s", config.timeout.as_secs()));
    }

    if let Some(ref filter) = config.test_name_filter {
        validate_argument(filter)?;
        args.push("-run".to_string());
        args.push(filter.clone());
    }

    args.push(package.to_string());
    Ok(args)
}

/// Build the argument list for a coverage run:
/// `test -coverprofile=<path> [-timeout <dur>] <pkgs>`.
pub fn build_coverage_args(config: &RunConfig, packages: &[String]) -> Result<Vec<String>> {
    validate_argument(&config.coverage_path)?;

    let mut args = vec![
        "test".to_string(),
        format!("-coverprofile={}", config.coverage_path),
    ];
    if !config.timeout.is_zero() {
        args.push("-timeout".to_string());
        args.push(format!("{}s", config.timeout.as_secs()));
    }
    for pkg in packages {
        validate_argument(pkg)?;
        args.push(pkg.clone());
    }
    Ok(args)
}

/// Build the argument list for HTML report generation:
/// `tool cover -html <profile> -o <html>`.
pub fn build_cover_report_args(profile: &str, html_out: &str) -> Result<Vec<String>> {
    validate_argument(profile)?;
    validate_argument(html_out)?;
    Ok(vec![
        "tool".to_string(),
        "cover".to_string(),
        "-html".to_string(),
        profile.to_string(),
        "-o".to_string(),
        html_out.to_string(),
    ])
}

/// Expand a recursive package pattern into concrete package paths by running
/// `go list <pattern>` in the working directory.
///
/// Non-recursive patterns are returned as-is without spawning anything.
pub async fn expand_packages(config: &RunConfig, cwd: &Path) -> Result<Vec<String>> {
    if !is_recursive_pattern(&config.package_pattern) {
        validate_argument(&config.package_pattern)?;
        return Ok(vec![config.package_pattern.clone()]);
    }
    validate_argument(&config.package_pattern)?;

    let binary = resolve_go_binary(config)?;
    tracing::debug!(
        pattern = %config.package_pattern,
        cwd = %cwd.display(),
        "expanding recursive package pattern via go list"
    );

    let output = Command::new(&binary)
        .arg("list")
        .arg(&config.package_pattern)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(Error::ProcessStart)?;

    if !output.status.success() {
        return Err(Error::Package {
            package: config.package_pattern.clone(),
            code: output.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let packages: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if packages.is_empty() {
        return Err(Error::Package {
            package: config.package_pattern.clone(),
            code: 0,
            output: "no packages matched pattern".to_string(),
        });
    }
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn recursive_marker_detection() {
        assert!(is_recursive_pattern("./..."));
        assert!(is_recursive_pattern("./pkg/..."));
        assert!(!is_recursive_pattern("./pkg/foo"));
        assert!(!is_recursive_pattern("example.com/proj/pkg"));
    }

    #[test]
    fn test_args_full() {
        let config = RunConfig::builder("./pkg/foo")
            .timeout(Duration::from_secs(60))
            .test_name_filter("TestBar")
            .build();
        let args = build_test_args(&config, "./pkg/foo").unwrap();
        assert_eq!(
            args,
            vec!["test", "-json", "-v", "-timeout", "60s", "-run", "TestBar", "./pkg/foo"]
        );
    }

    #[test]
    fn test_args_legacy_text_mode() {
        let mut config = RunConfig::new("./pkg/foo");
        config.json_output = false;
        config.timeout = Duration::ZERO;
        let args = build_test_args(&config, "./pkg/foo").unwrap();
        assert_eq!(args, vec!["test", "-v", "./pkg/foo"]);
    }

    #[test]
    fn coverage_args() {
        let config = RunConfig::builder("./...")
            .timeout(Duration::from_secs(30))
            .build();
        let args =
            build_coverage_args(&config, &["pkg/foo".to_string(), "pkg/bar".to_string()]).unwrap();
        assert_eq!(
            args,
            vec!["test", "-coverprofile=coverage.out", "-timeout", "30s", "pkg/foo", "pkg/bar"]
        );
    }

    #[test]
    fn report_args() {
        let args = build_cover_report_args("coverage.out", "coverage.html").unwrap();
        assert_eq!(args, vec!["tool", "cover", "-html", "coverage.out", "-o", "coverage.html"]);
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(validate_argument("pkg; rm -rf /").is_err());
        assert!(validate_argument("pkg|cat").is_err());
        assert!(validate_argument("pkg$(id)").is_err());
        assert!(validate_argument("pkg`id`").is_err());
        assert!(validate_argument("pkg\"quote").is_err());
    }

    #[test]
    fn rejects_option_lookalikes_and_traversal() {
        assert!(validate_argument("-run").is_err());
        assert!(validate_argument("--exec=evil").is_err());
        assert!(validate_argument("../outside").is_err());
        assert!(validate_argument("pkg/../../etc").is_err());
        assert!(validate_argument("").is_err());
    }

    #[test]
    fn accepts_normal_patterns() {
        assert!(validate_argument("./...").is_ok());
        assert!(validate_argument("./pkg/foo").is_ok());
        assert!(validate_argument("example.com/proj/pkg").is_ok());
        assert!(validate_argument("TestParser/SubCase").is_ok());
    }

    #[tokio::test]
    async fn expand_passes_through_concrete_packages() {
        let config = RunConfig::new("./pkg/foo");
        let cwd = std::env::current_dir().unwrap();
        let packages = expand_packages(&config, &cwd).await.unwrap();
        assert_eq!(packages, vec!["./pkg/foo".to_string()]);
    }
}
