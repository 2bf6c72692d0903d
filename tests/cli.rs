use assert_cmd::Command;
use predicates::prelude::*;

fn sentinel_cmd() -> Command {
    Command::cargo_bin("sentinel").unwrap()
}

/// Write an executable mock `go` script into `dir`.
#[cfg(unix)]
fn write_mock_go(dir: &std::path::Path, script: &str) -> std::path::PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("go");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(script.as_bytes()).unwrap();
    f.sync_all().unwrap();
    drop(f);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// ─── Help & Version ───────────────────────────────────────────────

#[test]
fn help_flag_shows_usage() {
    sentinel_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Interactive test watcher"));
}

#[test]
fn version_flag() {
    sentinel_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn no_subcommand_shows_help() {
    sentinel_cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

// ─── Run command ──────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn run_all_passing_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let go = write_mock_go(
        dir.path(),
        r#"#!/bin/bash
echo '{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"pkg/foo","Test":"TestA"}'
echo '{"Time":"2024-05-01T10:00:01Z","Action":"pass","Package":"pkg/foo","Test":"TestA","Elapsed":0.1}'
"#,
    );

    sentinel_cmd()
        .args([
            "run",
            "./pkg",
            "--go",
            go.to_str().unwrap(),
            "--cwd",
            dir.path().to_str().unwrap(),
            "--no-run-log",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"pass\""))
        .stderr(predicate::str::contains("1 passed, 0 failed"));
}

#[cfg(unix)]
#[test]
fn run_with_failures_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let go = write_mock_go(
        dir.path(),
        r#"#!/bin/bash
echo '{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"pkg/foo","Test":"TestA"}'
echo '{"Time":"2024-05-01T10:00:01Z","Action":"fail","Package":"pkg/foo","Test":"TestA","Elapsed":0.1}'
exit 1
"#,
    );

    sentinel_cmd()
        .args([
            "run",
            "./pkg",
            "--go",
            go.to_str().unwrap(),
            "--cwd",
            dir.path().to_str().unwrap(),
            "--no-run-log",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"status\":\"fail\""));
}

#[test]
fn run_with_missing_go_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    sentinel_cmd()
        .args([
            "run",
            "./pkg",
            "--go",
            dir.path().join("no-such-go").to_str().unwrap(),
            "--cwd",
            dir.path().to_str().unwrap(),
            "--no-run-log",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn run_rejects_malicious_pattern() {
    let dir = tempfile::tempdir().unwrap();
    sentinel_cmd()
        .args(["run", "pkg;rm -rf /", "--cwd", dir.path().to_str().unwrap(), "--no-run-log"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error"));
}

// ─── Coverage command ─────────────────────────────────────────────

#[test]
fn coverage_command_prints_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let profile = dir.path().join("coverage.out");
    std::fs::write(
        &profile,
        "mode: set\npkg/calc.go:3.20,6.2 2 1\npkg/calc.go:8.20,11.2 2 0\n",
    )
    .unwrap();

    sentinel_cmd()
        .arg("coverage")
        .arg(profile.to_str().unwrap())
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("statements: 50.0%"))
        .stdout(predicate::str::contains("pkg/calc.go"));
}

#[test]
fn coverage_command_rejects_traversal() {
    sentinel_cmd()
        .args(["coverage", "../outside/coverage.out"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid path"));
}

#[test]
fn coverage_command_missing_profile_fails() {
    let dir = tempfile::tempdir().unwrap();
    sentinel_cmd()
        .args(["coverage", "does-not-exist.out"])
        .current_dir(dir.path())
        .assert()
        .code(2);
}

// ─── Config command ───────────────────────────────────────────────

#[test]
fn config_show_prints_resolved_settings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sentinel.toml"), "default_timeout_secs = 42\n").unwrap();

    sentinel_cmd()
        .args(["config", "show"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("default_timeout_secs = 42"));
}

#[test]
fn config_init_creates_template() {
    let dir = tempfile::tempdir().unwrap();
    sentinel_cmd()
        .args(["config", "init"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("created sentinel.toml"));

    let content = std::fs::read_to_string(dir.path().join("sentinel.toml")).unwrap();
    assert!(content.contains("default_package_pattern"));

    // A second init must refuse to overwrite.
    sentinel_cmd()
        .args(["config", "init"])
        .current_dir(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn config_path_prints_location() {
    sentinel_cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

// ─── Watch command arg parsing ────────────────────────────────────

#[test]
fn watch_accepts_flags_and_stops_on_eof() {
    let dir = tempfile::tempdir().unwrap();
    // Stdin closes immediately: the watch loop should exit cleanly.
    sentinel_cmd()
        .args([
            "watch",
            "./pkg",
            "--cwd",
            dir.path().to_str().unwrap(),
            "--timeout",
            "5",
        ])
        .write_stdin("")
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stdout(predicate::str::contains("watch_status_changed"));
}
