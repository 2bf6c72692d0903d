use std::collections::HashMap;

use crate::event::{Action, TestEvent, TestResult};
use crate::parser::extract_error_context;

/// Events grouped `package → test → sequence`, preserving arrival order at
/// both levels.
#[derive(Debug, Default)]
pub struct GroupedEvents {
    package_order: Vec<String>,
    packages: HashMap<String, PackageGroup>,
}

/// One package's share of a run.
#[derive(Debug, Default)]
pub struct PackageGroup {
    test_order: Vec<String>,
    tests: HashMap<String, Vec<TestEvent>>,
    /// Events with no test field — build output, skip markers, trailers.
    package_events: Vec<TestEvent>,
}

impl PackageGroup {
    /// Terminal action of the package itself, if one arrived.
    pub fn terminal(&self) -> Option<Action> {
        self.package_events
            .iter()
            .rev()
            .map(|e| e.action)
            .find(Action::is_terminal)
    }

    /// Package-scoped output payloads in arrival order.
    pub fn output_lines(&self) -> Vec<String> {
        self.package_events
            .iter()
            .filter_map(|e| e.output.clone())
            .collect()
    }

    /// Whether the package was skipped for having no test files.
    pub fn is_no_test_files(&self) -> bool {
        self.terminal() == Some(Action::Skip)
            && self
                .package_events
                .iter()
                .any(|e| e.output.as_deref().is_some_and(|o| o.contains("[no test files]")))
    }

    pub fn events_for(&self, test: &str) -> Option<&[TestEvent]> {
        self.tests.get(test).map(Vec::as_slice)
    }

    pub fn test_names(&self) -> &[String] {
        &self.test_order
    }
}

impl GroupedEvents {
    /// Fold an event stream into the two-level grouping.
    pub fn from_events(events: &[TestEvent]) -> Self {
        let mut grouped = Self::default();
        for event in events {
            grouped.push(event.clone());
        }
        grouped
    }

    fn push(&mut self, event: TestEvent) {
        if !self.packages.contains_key(&event.package) {
            self.package_order.push(event.package.clone());
        }
        let package = self.packages.entry(event.package.clone()).or_default();

        match event.test.clone() {
            Some(test) => {
                if !package.tests.contains_key(&test) {
                    package.test_order.push(test.clone());
                }
                package.tests.entry(test).or_default().push(event);
            }
            None => package.package_events.push(event),
        }
    }

    pub fn package_names(&self) -> &[String] {
        &self.package_order
    }

    pub fn package(&self, name: &str) -> Option<&PackageGroup> {
        self.packages.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.package_order.is_empty()
    }

    /// Derive one [`TestResult`] per `(package, test)` in arrival order.
    ///
    /// `passed` is true iff the last terminal event was `pass`; duration comes
    /// from that event's elapsed field; output collected up to the terminal is
    /// kept in order and anything after it is discarded.
    pub fn summarize(&self) -> Vec<TestResult> {
        let mut results = Vec::new();
        for package in &self.package_order {
            let Some(group) = self.packages.get(package) else {
                continue;
            };
            for test in &group.test_order {
                let Some(events) = group.tests.get(test) else {
                    continue;
                };
                if let Some(result) = summarize_test(package, test, events) {
                    results.push(result);
                }
            }
        }
        results
    }
}

fn summarize_test(package: &str, test: &str, events: &[TestEvent]) -> Option<TestResult> {
    let mut output_lines = Vec::new();
    let mut terminal: Option<(Action, f64)> = None;

    for event in events {
        if event.action.is_terminal() {
            terminal = Some((event.action, event.elapsed.unwrap_or(0.0)));
            continue;
        }
        // Output after the terminal event is late and discarded.
        if terminal.is_none() {
            if let Some(ref output) = event.output {
                output_lines.push(output.clone());
            }
        }
    }

    let (action, duration) = terminal?;
    let passed = action == Action::Pass;
    let skipped = action == Action::Skip;
    let error_context = (!passed && !skipped).then(|| extract_error_context(&output_lines));

    Some(TestResult {
        package: package.to_string(),
        test: test.to_string(),
        passed,
        skipped,
        duration,
        error_context,
        output_lines,
    })
}
