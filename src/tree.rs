use std::sync::Arc;

use tokio::sync::watch;

use crate::event::TestResult;
use crate::group::GroupedEvents;
use crate::project;

/// Marker stored in `error` for a package skipped because it has no test
/// files. Such a node has no children and no leaf status.
pub const SKIP_MARKER: &str = "skip";

/// Test-function prefixes the aggregator accepts as leaf candidates.
const TEST_PREFIXES: &[&str] = &["Test", "Benchmark", "Example"];

/// One node of the result tree.
///
/// Nodes live in the tree's flat arena and point at each other by index, so
/// upward navigation needs no reference cycles and publication stays a single
/// pointer swap.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// A single path segment: package segment or test name segment.
    pub title: String,
    /// Depth; 0 is the root.
    pub level: usize,
    /// Leaf pass/fail; rolled up onto interior nodes after construction.
    /// `None` for skip nodes.
    pub passed: Option<bool>,
    /// Seconds. Leaves carry their own duration, interior nodes the sum over
    /// descendant leaves.
    pub duration: f64,
    /// Leaf: 1.0 when passed, 0.0 otherwise. Interior: passed leaves over
    /// total leaves, 0 when the subtree has none.
    pub coverage: f64,
    /// Failure message, or [`SKIP_MARKER`] for skipped nodes.
    pub error: Option<String>,
    /// Interior nodes with a failing descendant start expanded.
    pub expanded: bool,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl TreeNode {
    fn new(title: String, level: usize, parent: Option<usize>) -> Self {
        Self {
            title,
            level,
            passed: None,
            duration: 0.0,
            coverage: 0.0,
            error: None,
            expanded: false,
            parent,
            children: Vec::new(),
        }
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Immutable hierarchical model of one run: packages and tests with pass/fail,
/// duration, and rolled-up pass-ratio coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct TestTree {
    nodes: Vec<TreeNode>,
}

impl TestTree {
    /// An empty tree: a root with no children, zero duration, zero coverage.
    pub fn empty() -> Self {
        Self {
            nodes: vec![TreeNode::new(".".to_string(), 0, None)],
        }
    }

    /// Build a tree from grouped run events.
    ///
    /// `module` is the project's module-descriptor name; when present it is
    /// stripped from package paths to keep the tree shallow.
    pub fn build(grouped: &GroupedEvents, module: Option<&str>) -> Self {
        let mut tree = Self::empty();
        let all_results = grouped.summarize();

        for package in grouped.package_names() {
            let Some(group) = grouped.package(package) else {
                continue;
            };

            let stripped = match module {
                Some(m) => project::strip_module_prefix(package, m),
                None => package.as_str(),
            };

            if group.is_no_test_files() {
                let idx = tree.ensure_path(stripped);
                tree.nodes[idx].error = Some(SKIP_MARKER.to_string());
                continue;
            }

            let pkg_idx = tree.ensure_path(stripped);

            let results: Vec<&TestResult> = all_results
                .iter()
                .filter(|r| r.package == *package)
                .collect();

            for result in &results {
                if !looks_like_test_name(&result.test) {
                    tracing::debug!(test = %result.test, "ignoring non-test leaf name");
                    continue;
                }
                let leaf = tree.ensure_test_path(pkg_idx, &result.test);
                let node = &mut tree.nodes[leaf];
                node.duration = result.duration;
                if result.skipped {
                    node.passed = None;
                    node.error = Some(SKIP_MARKER.to_string());
                } else {
                    node.passed = Some(result.passed);
                    node.coverage = if result.passed { 1.0 } else { 0.0 };
                    if !result.passed {
                        node.error = result
                            .error_context
                            .as_ref()
                            .map(|c| c.message.clone())
                            .or_else(|| Some("test failed".to_string()));
                    }
                }
            }

            // A package that failed without producing any test result is a
            // build failure; its captured output becomes the node's error.
            if results.is_empty() && group.terminal() == Some(crate::event::Action::Fail) {
                let output = group.output_lines().join("\n");
                tree.nodes[pkg_idx].error = Some(if output.is_empty() {
                    "build failed".to_string()
                } else {
                    output
                });
                tree.nodes[pkg_idx].passed = Some(false);
            }
        }

        tree.roll_up(0);
        tree
    }

    /// Locate or create the interior chain for a slash-separated package path,
    /// returning the index of its final node.
    fn ensure_path(&mut self, path: &str) -> usize {
        let mut current = 0;
        if path.is_empty() || path == "." {
            return current;
        }
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.ensure_child(current, segment);
        }
        current
    }

    /// Same as [`ensure_path`] for a slash-separated test name under `pkg_idx`
    /// (sub-tests nest under their parent test).
    fn ensure_test_path(&mut self, pkg_idx: usize, test: &str) -> usize {
        let mut current = pkg_idx;
        for segment in test.split('/').filter(|s| !s.is_empty()) {
            current = self.ensure_child(current, segment);
        }
        current
    }

    fn ensure_child(&mut self, parent: usize, title: &str) -> usize {
        if let Some(&idx) = self.nodes[parent]
            .children
            .iter()
            .find(|&&c| self.nodes[c].title == title)
        {
            return idx;
        }
        let level = self.nodes[parent].level + 1;
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::new(title.to_string(), level, Some(parent)));
        self.nodes[parent].children.push(idx);
        idx
    }

    /// Post-order pass computing interior duration, pass-ratio coverage,
    /// rolled-up status, and the default expansion state.
    ///
    /// Returns `(passed_leaves, total_leaves, duration, any_failed)` for the
    /// subtree. Skip nodes contribute nothing to the ratio.
    fn roll_up(&mut self, idx: usize) -> (usize, usize, f64, bool) {
        if self.nodes[idx].is_leaf() {
            let node = &self.nodes[idx];
            if node.error.as_deref() == Some(SKIP_MARKER) {
                return (0, 0, node.duration, false);
            }
            let passed = node.passed == Some(true);
            let counted = node.passed.is_some();
            return (
                usize::from(passed && counted),
                usize::from(counted),
                node.duration,
                node.passed == Some(false),
            );
        }

        let children = self.nodes[idx].children.clone();
        let mut passed_leaves = 0;
        let mut total_leaves = 0;
        let mut duration = 0.0;
        let mut any_failed = false;
        for child in children {
            let (p, t, d, f) = self.roll_up(child);
            passed_leaves += p;
            total_leaves += t;
            duration += d;
            any_failed |= f;
        }

        let node = &mut self.nodes[idx];
        if node.error.as_deref() != Some(SKIP_MARKER) {
            node.duration = duration;
            node.coverage = if total_leaves > 0 {
                passed_leaves as f64 / total_leaves as f64
            } else {
                0.0
            };
            node.passed = Some(!any_failed);
            node.expanded = any_failed;
        }
        (passed_leaves, total_leaves, duration, any_failed)
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> Option<&TreeNode> {
        self.nodes.get(idx)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Pre-order traversal of node indices, root first.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            for &child in self.nodes[idx].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Find a node by its slash-separated path from the root.
    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        let mut current = 0;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = *self.nodes[current]
                .children
                .iter()
                .find(|&&c| self.nodes[c].title == segment)?;
        }
        self.nodes.get(current)
    }
}

/// Heuristic for names the aggregator accepts as test leaves.
pub fn looks_like_test_name(name: &str) -> bool {
    let first = name.split('/').next().unwrap_or(name);
    TEST_PREFIXES.iter().any(|p| first.starts_with(p))
}

/// Shared handle for atomically publishing and observing trees.
///
/// Publication replaces the whole tree in one `send_replace`; readers clone
/// the `Arc` out of the watch channel and can never observe a partial tree.
#[derive(Clone)]
pub struct TreeHandle {
    tx: watch::Sender<Arc<TestTree>>,
}

impl TreeHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TestTree::empty()));
        Self { tx }
    }

    /// Atomically swap in a freshly built tree.
    pub fn publish(&self, tree: TestTree) {
        self.tx.send_replace(Arc::new(tree));
    }

    /// The currently published tree.
    pub fn latest(&self) -> Arc<TestTree> {
        self.tx.borrow().clone()
    }

    /// Subscribe to publications; the receiver sees every subsequent swap.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TestTree>> {
        self.tx.subscribe()
    }
}

impl Default for TreeHandle {
    fn default() -> Self {
        Self::new()
    }
}
