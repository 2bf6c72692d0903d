use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::event::{Action, ErrorContext, ErrorLocation, TestEvent};

/// How the incoming line stream is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// `go test -json`: one JSON record per line.
    Json,
    /// Plain `go test -v` text output.
    Text,
}

/// Decodes a line stream into [`TestEvent`]s.
///
/// Push lines as they arrive; each push may yield zero or more events. Call
/// [`finish`](EventParser::finish) at end-of-stream to flush anything the
/// text-mode state machine is still buffering. Every emitted event gets a
/// monotonic `seq` and is deduplicated by its exact
/// `(time, action, package, test, output)` key.
pub struct EventParser {
    mode: ParseMode,
    offset: u64,
    seq: u64,
    seen: HashSet<(String, Action, String, String, String)>,
    text: TextState,
}

impl EventParser {
    pub fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            offset: 0,
            seq: 0,
            seen: HashSet::new(),
            text: TextState::new(),
        }
    }

    /// Feed one line (without trailing newline). The byte offset advances by
    /// the line length plus one for the newline the runner stripped.
    pub fn push_line(&mut self, line: &str) -> Result<Vec<TestEvent>> {
        let line_offset = self.offset;
        self.offset += line.len() as u64 + 1;

        if line.trim().is_empty() {
            return Ok(Vec::new());
        }

        let raw = match self.mode {
            ParseMode::Json => self.push_json(line, line_offset)?,
            ParseMode::Text => self.text.push(line),
        };
        Ok(self.admit(raw))
    }

    /// Flush events still buffered by the text state machine.
    pub fn finish(&mut self) -> Vec<TestEvent> {
        let raw = match self.mode {
            ParseMode::Json => Vec::new(),
            ParseMode::Text => self.text.finish(),
        };
        self.admit(raw)
    }

    fn push_json(&mut self, line: &str, line_offset: u64) -> Result<Vec<TestEvent>> {
        if !line.starts_with('{') {
            // Runner banners and stray stderr lines ride along as raw output.
            return Ok(vec![TestEvent {
                time: self.text.stamp(),
                action: Action::Output,
                package: String::new(),
                test: None,
                output: Some(line.to_string()),
                elapsed: None,
                seq: 0,
            }]);
        }
        match serde_json::from_str::<TestEvent>(line) {
            Ok(event) => Ok(vec![event]),
            Err(e) => Err(Error::Decode {
                offset: line_offset,
                message: e.to_string(),
            }),
        }
    }

    /// Stamp sequence numbers and drop exact duplicates.
    fn admit(&mut self, raw: Vec<TestEvent>) -> Vec<TestEvent> {
        let mut out = Vec::with_capacity(raw.len());
        for mut event in raw {
            let key = (
                event.time.clone(),
                event.action,
                event.package.clone(),
                event.test.clone().unwrap_or_default(),
                event.output.clone().unwrap_or_default(),
            );
            if !self.seen.insert(key) {
                continue;
            }
            event.seq = self.seq;
            self.seq += 1;
            out.push(event);
        }
        out
    }
}

/// State machine for legacy `go test -v` text output.
///
/// Events synthesized before the package is known (the `ok`/`FAIL` trailer
/// line names it) are buffered and stamped with the package retroactively.
struct TextState {
    /// In-progress tests, deepest last.
    stack: Vec<String>,
    /// Attach target for free-form output: the deepest in-progress test, or
    /// the test whose result line was seen last (its detail lines follow it).
    current: Option<String>,
    /// Events awaiting a package name.
    pending: Vec<TestEvent>,
    /// Monotonic synthetic clock; starts at now() but is not wall-clock.
    base: DateTime<Utc>,
    ticks: i64,
}

impl TextState {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            current: None,
            pending: Vec::new(),
            base: Utc::now(),
            ticks: 0,
        }
    }

    /// Next synthetic timestamp, strictly increasing.
    fn stamp(&mut self) -> String {
        let t = self.base + ChronoDuration::milliseconds(self.ticks);
        self.ticks += 1;
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn push(&mut self, line: &str) -> Vec<TestEvent> {
        let trimmed = line.trim_start();

        if let Some(name) = trimmed.strip_prefix("=== RUN ") {
            let name = name.trim();
            let event = self.make(Action::Run, Some(name.to_string()), None, None);
            self.stack.push(name.to_string());
            self.current = Some(name.to_string());
            self.pending.push(event);
            return Vec::new();
        }

        if let Some((action, name, elapsed)) = parse_result_line(trimmed) {
            // Pop this test and anything nested deeper than it; its own
            // detail lines follow the result line, so it stays the target.
            if let Some(pos) = self.stack.iter().position(|t| t.as_str() == name) {
                self.stack.truncate(pos);
            }
            self.current = Some(name.to_string());
            let event = self.make(action, Some(name.to_string()), None, elapsed);
            self.pending.push(event);
            return Vec::new();
        }

        if let Some((pkg, elapsed)) = parse_package_trailer(line) {
            return self.flush_package(Action::Pass, &pkg, elapsed, None);
        }

        if let Some(pkg) = parse_package_failure(line) {
            return self.flush_package(Action::Fail, &pkg, None, Some(line.to_string()));
        }

        if let Some(pkg) = parse_no_test_files(line) {
            let mut out = self.flush_package(Action::Skip, &pkg, None, None);
            let output = self.make_pkg(Action::Output, &pkg, Some(line.to_string()), None);
            out.push(output);
            return out;
        }

        if line.contains("% of statements") && trimmed.starts_with("coverage:") {
            // Attached to the package once the trailer names it.
            let event = self.make(Action::Output, None, Some(line.to_string()), None);
            self.pending.push(event);
            return Vec::new();
        }

        // Plain output belongs to the current test context.
        let owner = self.current.clone().or_else(|| self.stack.last().cloned());
        let event = self.make(Action::Output, owner, Some(line.to_string()), None);
        self.pending.push(event);
        Vec::new()
    }

    /// Stamp all pending events with `pkg` and append the package terminal.
    fn flush_package(
        &mut self,
        action: Action,
        pkg: &str,
        elapsed: Option<f64>,
        output: Option<String>,
    ) -> Vec<TestEvent> {
        let mut out: Vec<TestEvent> = std::mem::take(&mut self.pending);
        for event in &mut out {
            event.package = pkg.to_string();
        }
        self.stack.clear();
        self.current = None;
        if let Some(text) = output {
            out.push(self.make_pkg(Action::Output, pkg, Some(text), None));
        }
        out.push(self.make_pkg(action, pkg, None, elapsed));
        out
    }

    fn finish(&mut self) -> Vec<TestEvent> {
        self.stack.clear();
        self.current = None;
        std::mem::take(&mut self.pending)
    }

    fn make(
        &mut self,
        action: Action,
        test: Option<String>,
        output: Option<String>,
        elapsed: Option<f64>,
    ) -> TestEvent {
        TestEvent {
            time: self.stamp(),
            action,
            package: String::new(),
            test,
            output,
            elapsed,
            seq: 0,
        }
    }

    fn make_pkg(
        &mut self,
        action: Action,
        pkg: &str,
        output: Option<String>,
        elapsed: Option<f64>,
    ) -> TestEvent {
        let mut event = self.make(action, None, output, elapsed);
        event.package = pkg.to_string();
        event
    }
}

/// `--- PASS: TestName (0.05s)` → `(Pass, "TestName", Some(0.05))`.
fn parse_result_line(trimmed: &str) -> Option<(Action, &str, Option<f64>)> {
    let (action, rest) = if let Some(rest) = trimmed.strip_prefix("--- PASS: ") {
        (Action::Pass, rest)
    } else if let Some(rest) = trimmed.strip_prefix("--- FAIL: ") {
        (Action::Fail, rest)
    } else if let Some(rest) = trimmed.strip_prefix("--- SKIP: ") {
        (Action::Skip, rest)
    } else {
        return None;
    };

    let rest = rest.trim();
    let (name, elapsed) = match rest.rfind(" (") {
        Some(i) if rest.ends_with("s)") => {
            let secs = &rest[i + 2..rest.len() - 2];
            (rest[..i].trim(), secs.parse::<f64>().ok())
        }
        _ => (rest, None),
    };
    Some((action, name, elapsed))
}

/// `ok  	pkg/foo	0.123s` → `("pkg/foo", Some(0.123))`.
fn parse_package_trailer(line: &str) -> Option<(String, Option<f64>)> {
    let rest = line.strip_prefix("ok")?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let mut fields = rest.split_whitespace();
    let pkg = fields.next()?.to_string();
    let elapsed = fields
        .next()
        .and_then(|f| f.strip_suffix('s'))
        .and_then(|f| f.parse::<f64>().ok());
    Some((pkg, elapsed))
}

/// `FAIL	pkg/bar [build failed]` / `FAIL	pkg/bar 0.2s` → `"pkg/bar"`.
/// The bare `FAIL` trailer line has no package and is ignored.
fn parse_package_failure(line: &str) -> Option<String> {
    let rest = line.strip_prefix("FAIL")?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    rest.split_whitespace().next().map(str::to_string)
}

/// `?   	pkg/empty	[no test files]` → `"pkg/empty"`.
fn parse_no_test_files(line: &str) -> Option<String> {
    let rest = line.strip_prefix('?')?;
    if !line.contains("[no test files]") {
        return None;
    }
    rest.split_whitespace().next().map(str::to_string)
}

/// Derive structured failure context from a failing test's output lines.
///
/// The first `path:line:` match wins; with output but no location the last
/// line becomes the message; with no output at all the message is fixed.
pub fn extract_error_context(output_lines: &[String]) -> ErrorContext {
    for line in output_lines {
        if let Some(location) = scan_location(line) {
            return ErrorContext {
                message: line.trim().to_string(),
                location: Some(location),
            };
        }
    }
    match output_lines.iter().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => ErrorContext {
            message: last.trim().to_string(),
            location: None,
        },
        None => ErrorContext {
            message: "test failed".to_string(),
            location: None,
        },
    }
}

/// Find a `<path>:<line>[:]` prefix in a single line.
fn scan_location(line: &str) -> Option<ErrorLocation> {
    let trimmed = line.trim();
    let mut search_from = 0;
    while let Some(rel) = trimmed[search_from..].find(':') {
        let colon = search_from + rel;
        let path = &trimmed[..colon];
        let after = &trimmed[colon + 1..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        let after_digits = &after[digits.len()..];
        let path_ok = !path.is_empty() && !path.contains(char::is_whitespace) && path.contains('.');
        let line_ok = !digits.is_empty()
            && (after_digits.is_empty() || after_digits.starts_with(':'));
        if path_ok && line_ok {
            if let Ok(n) = digits.parse::<u32>() {
                return Some(ErrorLocation {
                    file: path.to_string(),
                    line: n,
                });
            }
        }
        search_from = colon + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut EventParser, lines: &[&str]) -> Vec<TestEvent> {
        let mut out = Vec::new();
        for line in lines {
            out.extend(parser.push_line(line).unwrap());
        }
        out.extend(parser.finish());
        out
    }

    #[test]
    fn json_mode_decodes_events() {
        let mut parser = EventParser::new(ParseMode::Json);
        let events = collect(
            &mut parser,
            &[
                r#"{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"pkg/foo","Test":"TestA"}"#,
                r#"{"Time":"2024-05-01T10:00:01Z","Action":"pass","Package":"pkg/foo","Test":"TestA","Elapsed":0.1}"#,
            ],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, Action::Run);
        assert_eq!(events[1].action, Action::Pass);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
    }

    #[test]
    fn json_mode_decode_error_carries_offset() {
        let mut parser = EventParser::new(ParseMode::Json);
        let first = r#"{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"p","Test":"TestA"}"#;
        parser.push_line(first).unwrap();
        let err = parser.push_line("{broken json").unwrap_err();
        match err {
            Error::Decode { offset, .. } => {
                assert_eq!(offset, first.len() as u64 + 1);
            }
            other => panic!("expected Decode, got {other:?}"),
        }
    }

    #[test]
    fn json_mode_wraps_non_json_lines_as_output() {
        let mut parser = EventParser::new(ParseMode::Json);
        let events = parser.push_line("[runner] Test timed out after 120s").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, Action::Output);
        assert!(events[0].package.is_empty());
        assert_eq!(
            events[0].output.as_deref(),
            Some("[runner] Test timed out after 120s")
        );
    }

    #[test]
    fn duplicate_events_are_dropped() {
        let mut parser = EventParser::new(ParseMode::Json);
        let line = r#"{"Time":"2024-05-01T10:00:00Z","Action":"output","Package":"p","Test":"TestA","Output":"hi\n"}"#;
        assert_eq!(parser.push_line(line).unwrap().len(), 1);
        assert_eq!(parser.push_line(line).unwrap().len(), 0);
    }

    #[test]
    fn text_mode_subtests() {
        let mut parser = EventParser::new(ParseMode::Text);
        let events = collect(
            &mut parser,
            &[
                "=== RUN TestParent",
                "    === RUN TestParent/SubA",
                "    --- PASS: TestParent/SubA (0.05s)",
                "    --- FAIL: TestParent/SubB (0.05s)",
                "        subtest B failed",
                "--- FAIL: TestParent (0.10s)",
                "FAIL\tpkg/demo\t0.2s",
            ],
        );

        // Every event is stamped with the package from the trailer.
        assert!(events.iter().all(|e| e.package == "pkg/demo"));

        let parent_run = events
            .iter()
            .position(|e| e.action == Action::Run && e.test.as_deref() == Some("TestParent"))
            .unwrap();
        let sub_a_pass = events
            .iter()
            .position(|e| e.action == Action::Pass && e.test.as_deref() == Some("TestParent/SubA"))
            .unwrap();
        let parent_fail = events
            .iter()
            .position(|e| e.action == Action::Fail && e.test.as_deref() == Some("TestParent"))
            .unwrap();
        assert!(parent_run < sub_a_pass);
        assert!(sub_a_pass < parent_fail);

        let sub_b_fail = events
            .iter()
            .find(|e| e.action == Action::Fail && e.test.as_deref() == Some("TestParent/SubB"))
            .unwrap();
        assert_eq!(sub_b_fail.elapsed, Some(0.05));

        // The free-form line attached to the deepest in-progress test.
        let output = events
            .iter()
            .find(|e| e.action == Action::Output && e.output.as_deref().map(str::trim) == Some("subtest B failed"))
            .unwrap();
        assert_eq!(output.test.as_deref(), Some("TestParent/SubB"));
    }

    #[test]
    fn text_mode_output_attaches_to_deepest_in_progress() {
        let mut parser = EventParser::new(ParseMode::Text);
        let events = collect(
            &mut parser,
            &[
                "=== RUN TestOne",
                "some log line",
                "--- PASS: TestOne (0.01s)",
                "ok  \tpkg/x\t0.1s",
            ],
        );
        let output = events
            .iter()
            .find(|e| e.action == Action::Output)
            .unwrap();
        assert_eq!(output.test.as_deref(), Some("TestOne"));
    }

    #[test]
    fn text_mode_synthetic_timestamps_are_monotonic() {
        let mut parser = EventParser::new(ParseMode::Text);
        let events = collect(
            &mut parser,
            &[
                "=== RUN TestA",
                "--- PASS: TestA (0.01s)",
                "ok  \tpkg/x\t0.1s",
            ],
        );
        for pair in events.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
        let times: Vec<&String> = events.iter().map(|e| &e.time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted, "timestamps must be monotonic");
    }

    #[test]
    fn text_mode_no_test_files() {
        let mut parser = EventParser::new(ParseMode::Text);
        let events = collect(&mut parser, &["?   \tpkg/empty\t[no test files]"]);
        assert!(events
            .iter()
            .any(|e| e.action == Action::Skip && e.package == "pkg/empty" && e.test.is_none()));
        assert!(events
            .iter()
            .any(|e| e.action == Action::Output
                && e.output.as_deref().is_some_and(|o| o.contains("[no test files]"))));
    }

    #[test]
    fn text_mode_coverage_line_becomes_package_output() {
        let mut parser = EventParser::new(ParseMode::Text);
        let events = collect(
            &mut parser,
            &[
                "=== RUN TestA",
                "--- PASS: TestA (0.01s)",
                "coverage: 75.0% of statements",
                "ok  \tpkg/x\t0.1s",
            ],
        );
        let cover = events
            .iter()
            .find(|e| e.output.as_deref().is_some_and(|o| o.contains("75.0%")))
            .unwrap();
        assert_eq!(cover.package, "pkg/x");
        assert_eq!(cover.action, Action::Output);
    }

    #[test]
    fn text_mode_buffers_until_package_known() {
        let mut parser = EventParser::new(ParseMode::Text);
        // Nothing may be emitted before the package trailer arrives.
        assert!(parser.push_line("=== RUN TestA").unwrap().is_empty());
        assert!(parser.push_line("--- PASS: TestA (0.01s)").unwrap().is_empty());
        let events = parser.push_line("ok  \tpkg/late\t0.1s").unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.package == "pkg/late"));
    }

    #[test]
    fn result_line_parsing() {
        assert_eq!(
            parse_result_line("--- PASS: TestA (0.05s)"),
            Some((Action::Pass, "TestA", Some(0.05)))
        );
        assert_eq!(
            parse_result_line("--- SKIP: TestB (0.00s)"),
            Some((Action::Skip, "TestB", Some(0.0)))
        );
        assert_eq!(parse_result_line("--- nope"), None);
    }

    #[test]
    fn error_context_finds_first_location() {
        let lines = vec![
            "some preamble".to_string(),
            "    parser_test.go:42: expected 3, got 4".to_string(),
            "    other_test.go:99: later match".to_string(),
        ];
        let ctx = extract_error_context(&lines);
        let loc = ctx.location.unwrap();
        assert_eq!(loc.file, "parser_test.go");
        assert_eq!(loc.line, 42);
        assert!(ctx.message.contains("expected 3, got 4"));
    }

    #[test]
    fn error_context_falls_back_to_last_line() {
        let lines = vec!["first".to_string(), "assertion blew up".to_string()];
        let ctx = extract_error_context(&lines);
        assert!(ctx.location.is_none());
        assert_eq!(ctx.message, "assertion blew up");
    }

    #[test]
    fn error_context_no_output() {
        let ctx = extract_error_context(&[]);
        assert!(ctx.location.is_none());
        assert_eq!(ctx.message, "test failed");
    }

    #[test]
    fn location_scan_rejects_non_files() {
        assert!(scan_location("10:30:00 timestamp").is_none());
        assert!(scan_location("see docs: 42").is_none());
        assert!(scan_location("foo.go:abc: nope").is_none());
        let loc = scan_location("pkg/deep/file.go:7: boom").unwrap();
        assert_eq!(loc.file, "pkg/deep/file.go");
        assert_eq!(loc.line, 7);
    }
}
