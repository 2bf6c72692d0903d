use std::path::{Path, PathBuf};

/// Walk up from `start` looking for a `go.mod`. Returns the directory that
/// contains it — the project root — or `None` if no ancestor has one.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join("go.mod").is_file())
        .map(Path::to_path_buf)
}

/// Read the declared module name from the `go.mod` in `root`, if present.
///
/// Only the `module <path>` directive is parsed; the rest of the file is
/// ignored. Returns `None` when the file is missing or has no module line.
pub fn module_name(root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(root.join("go.mod")).ok()?;
    parse_module_name(&content)
}

fn parse_module_name(content: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("module") {
            let name = rest.trim().trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Strip the module name prefix from a package path, keeping the tree shallow.
///
/// `example.com/proj/pkg/foo` with module `example.com/proj` becomes
/// `pkg/foo`; the module path itself becomes `.`.
pub fn strip_module_prefix<'a>(package: &'a str, module: &str) -> &'a str {
    if package == module {
        return ".";
    }
    package
        .strip_prefix(module)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(package)
}
