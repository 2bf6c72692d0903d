use serde::{Deserialize, Serialize};

use crate::coverage::CoverageMetrics;
use crate::error::Result;
use crate::event::TestResult;
use crate::tree::TestTree;

/// Envelope for every message the hub fans out. Messages travel as
/// line-delimited JSON over whatever transport the subscriber exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    TestResult(TestResultPayload),
    Command(CommandMessage),
}

/// Payload of a `test_result` message: either a single status update or the
/// extended form, an ordered node list snapshotting the whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestResultPayload {
    Status { test_id: String, status: String },
    Tree(Vec<NodeSnapshot>),
}

/// One-way notifications for the terminal consumer plus coverage updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandMessage {
    ToggleWatchMode,
    WatchStatusChanged { enabled: bool },
    LogEntry { content: String },
    ClearLog,
    ShowLogView { show: bool },
    CoverageUpdated { metrics: CoverageMetrics },
}

/// Flattened view of one tree node, in publication order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub title: String,
    pub level: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    pub duration: f64,
    pub coverage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Status update for one finished test.
    pub fn test_status(result: &TestResult) -> Self {
        let status = if result.skipped {
            "skip"
        } else if result.passed {
            "pass"
        } else {
            "fail"
        };
        Envelope::TestResult(TestResultPayload::Status {
            test_id: format!("{}/{}", result.package, result.test),
            status: status.to_string(),
        })
    }

    /// Extended snapshot of a published tree: every node, pre-order, with the
    /// synthetic root elided so top-level packages sit at level 0.
    pub fn tree_snapshot(tree: &TestTree) -> Self {
        let nodes = tree
            .preorder()
            .into_iter()
            .skip(1)
            .filter_map(|idx| tree.node(idx))
            .map(|node| NodeSnapshot {
                title: node.title.clone(),
                level: node.level - 1,
                passed: node.passed,
                duration: node.duration,
                coverage: node.coverage,
                error: node.error.clone(),
            })
            .collect();
        Envelope::TestResult(TestResultPayload::Tree(nodes))
    }

    pub fn coverage(metrics: CoverageMetrics) -> Self {
        Envelope::Command(CommandMessage::CoverageUpdated { metrics })
    }

    /// Serialize as one newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, TestEvent};
    use crate::group::GroupedEvents;

    #[test]
    fn status_envelope_shape() {
        let result = TestResult {
            package: "pkg/foo".into(),
            test: "TestA".into(),
            passed: true,
            skipped: false,
            duration: 0.1,
            error_context: None,
            output_lines: vec![],
        };
        let line = Envelope::test_status(&result).encode_line().unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(text.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "test_result");
        assert_eq!(value["payload"]["test_id"], "pkg/foo/TestA");
        assert_eq!(value["payload"]["status"], "pass");
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::Command(CommandMessage::WatchStatusChanged { enabled: true });
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["payload"]["command"], "watch_status_changed");
        assert_eq!(value["payload"]["enabled"], true);
    }

    #[test]
    fn tree_snapshot_is_ordered_and_rootless() {
        let events = vec![
            TestEvent {
                time: String::new(),
                action: Action::Run,
                package: "pkg/foo".into(),
                test: Some("TestA".into()),
                output: None,
                elapsed: None,
                seq: 0,
            },
            TestEvent {
                time: String::new(),
                action: Action::Pass,
                package: "pkg/foo".into(),
                test: Some("TestA".into()),
                output: None,
                elapsed: Some(0.1),
                seq: 1,
            },
        ];
        let tree = TestTree::build(&GroupedEvents::from_events(&events), None);
        let envelope = Envelope::tree_snapshot(&tree);

        let Envelope::TestResult(TestResultPayload::Tree(nodes)) = &envelope else {
            panic!("expected tree payload");
        };
        assert_eq!(nodes.len(), 3); // pkg, foo, TestA
        assert_eq!(nodes[0].title, "pkg");
        assert_eq!(nodes[0].level, 0);
        assert_eq!(nodes[2].title, "TestA");
        assert_eq!(nodes[2].level, 2);
        assert_eq!(nodes[2].passed, Some(true));
    }

    #[test]
    fn notification_variants_serialize_compactly() {
        for (msg, name) in [
            (CommandMessage::ToggleWatchMode, "toggle_watch_mode"),
            (CommandMessage::ClearLog, "clear_log"),
            (CommandMessage::ShowLogView { show: false }, "show_log_view"),
            (
                CommandMessage::LogEntry {
                    content: "hello".into(),
                },
                "log_entry",
            ),
        ] {
            let json = serde_json::to_string(&Envelope::Command(msg)).unwrap();
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(value["payload"]["command"], name);
        }
    }
}
