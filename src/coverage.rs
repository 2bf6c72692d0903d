use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Profile counting mode from the header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverMode {
    Set,
    Count,
    Atomic,
}

impl std::str::FromStr for CoverMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(CoverMode::Set),
            "count" => Ok(CoverMode::Count),
            "atomic" => Ok(CoverMode::Atomic),
            other => Err(Error::CoverageParse(format!("unknown mode: {other}"))),
        }
    }
}

/// A multi-statement block that never executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub start_line: u32,
    pub end_line: u32,
    pub statements: u32,
}

/// Coverage percentages and line detail for one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetrics {
    pub statement: f64,
    pub branch: f64,
    pub function: f64,
    pub line: f64,
    pub line_execution_counts: BTreeMap<u32, u64>,
    pub uncovered_lines: Vec<u32>,
    pub partial_branches: Vec<BranchInfo>,

    #[serde(skip)]
    totals: FileTotals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct FileTotals {
    statements: u64,
    covered_statements: u64,
    branches: u64,
    covered_branches: u64,
}

/// Aggregate coverage over every file in a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageMetrics {
    pub statement: f64,
    pub branch: f64,
    pub function: f64,
    pub line: f64,
    pub file_metrics: HashMap<String, FileMetrics>,
}

fn percent(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64 * 100.0
    }
}

/// Parse a coverage profile body: a `mode:` header followed by block records
/// `file:startLine.startCol,endLine.endCol numStmt count`.
pub fn parse_profile(content: &str) -> Result<CoverageMetrics> {
    let mut lines = content.lines().enumerate();

    let mode = loop {
        match lines.next() {
            Some((_, line)) if line.trim().is_empty() => continue,
            Some((_, line)) => {
                let rest = line.trim().strip_prefix("mode:").ok_or_else(|| {
                    Error::CoverageParse(format!("expected mode header, got: {line}"))
                })?;
                break rest.trim().parse::<CoverMode>()?;
            }
            None => return Err(Error::CoverageParse("empty profile".into())),
        }
    };
    tracing::debug!(?mode, "parsing coverage profile");

    let mut files: HashMap<String, FileMetrics> = HashMap::new();

    for (lineno, line) in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let block = parse_block(line).map_err(|e| {
            Error::CoverageParse(format!("line {}: {e}", lineno + 1))
        })?;

        let file = files.entry(block.file.clone()).or_default();
        file.totals.statements += u64::from(block.num_stmt);
        if block.count > 0 {
            file.totals.covered_statements += u64::from(block.num_stmt);
        }
        if block.num_stmt > 1 {
            file.totals.branches += 1;
            if block.count > 0 {
                file.totals.covered_branches += 1;
            } else {
                file.partial_branches.push(BranchInfo {
                    start_line: block.start_line,
                    end_line: block.end_line,
                    statements: block.num_stmt,
                });
            }
        }
        for l in block.start_line..=block.end_line {
            *file.line_execution_counts.entry(l).or_insert(0) += block.count;
            if block.count == 0 && !file.uncovered_lines.contains(&l) {
                file.uncovered_lines.push(l);
            }
        }
    }

    let mut global = FileTotals::default();
    let mut covered_lines = 0u64;
    let mut total_lines = 0u64;

    for file in files.values_mut() {
        global.statements += file.totals.statements;
        global.covered_statements += file.totals.covered_statements;
        global.branches += file.totals.branches;
        global.covered_branches += file.totals.covered_branches;

        let file_total = file.line_execution_counts.len() as u64;
        let file_covered = file
            .line_execution_counts
            .values()
            .filter(|&&c| c > 0)
            .count() as u64;
        total_lines += file_total;
        covered_lines += file_covered;

        file.statement = percent(file.totals.covered_statements, file.totals.statements);
        file.branch = percent(file.totals.covered_branches, file.totals.branches);
        file.line = percent(file_covered, file_total);
        // The line-range profile has no function boundaries; statement
        // coverage is the closest defined stand-in.
        file.function = file.statement;
    }

    Ok(CoverageMetrics {
        statement: percent(global.covered_statements, global.statements),
        branch: percent(global.covered_branches, global.branches),
        function: percent(global.covered_statements, global.statements),
        line: percent(covered_lines, total_lines),
        file_metrics: files,
    })
}

/// Read and parse a profile from disk, validating the path first.
pub fn ingest_profile(path: &str) -> Result<CoverageMetrics> {
    validate_profile_path(path)?;
    let content = std::fs::read_to_string(path)?;
    parse_profile(&content)
}

struct Block {
    file: String,
    start_line: u32,
    end_line: u32,
    num_stmt: u32,
    count: u64,
}

fn parse_block(line: &str) -> std::result::Result<Block, String> {
    // file:10.2,12.40 3 1 — the file part may itself contain dots, so split
    // from the right.
    let colon = line.rfind(':').ok_or("missing ':' separator")?;
    let file = &line[..colon];
    if file.is_empty() {
        return Err("empty file path".into());
    }
    let rest = &line[colon + 1..];

    let mut fields = rest.split_whitespace();
    let range = fields.next().ok_or("missing range")?;
    let num_stmt: u32 = fields
        .next()
        .ok_or("missing statement count")?
        .parse()
        .map_err(|_| "bad statement count".to_string())?;
    let count: u64 = fields
        .next()
        .ok_or("missing execution count")?
        .parse()
        .map_err(|_| "bad execution count".to_string())?;

    let (start, end) = range.split_once(',').ok_or("bad range")?;
    let start_line: u32 = start
        .split_once('.')
        .ok_or("bad start position")?
        .0
        .parse()
        .map_err(|_| "bad start line".to_string())?;
    let end_line: u32 = end
        .split_once('.')
        .ok_or("bad end position")?
        .0
        .parse()
        .map_err(|_| "bad end line".to_string())?;

    if end_line < start_line {
        return Err("inverted line range".into());
    }

    Ok(Block {
        file: file.to_string(),
        start_line,
        end_line,
        num_stmt,
        count,
    })
}

/// Validate a coverage profile path before any filesystem access.
pub fn validate_profile_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(Error::InvalidPath("empty path".into()));
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::InvalidPath(format!("upward traversal rejected: {path}")));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath("NUL byte in path".into()));
    }
    #[cfg(windows)]
    {
        const SUSPECT: &[char] = &['<', '>', '"', '|', '?', '*'];
        if path.chars().any(|c| SUSPECT.contains(&c)) {
            return Err(Error::InvalidPath(format!("suspect character in path: {path}")));
        }
    }
    Ok(())
}

/// Load a source file as a `1-based line → text` mapping.
///
/// The resolved path must stay inside `project_root`; symlinks pointing
/// outside it are refused.
pub fn source_lines(project_root: &Path, file: &str) -> Result<BTreeMap<u32, String>> {
    validate_profile_path(file)?;

    let candidate = project_root.join(file);
    let resolved = candidate
        .canonicalize()
        .map_err(|e| Error::InvalidPath(format!("{}: {e}", candidate.display())))?;
    let root = project_root
        .canonicalize()
        .map_err(|e| Error::InvalidPath(format!("{}: {e}", project_root.display())))?;
    if !resolved.starts_with(&root) {
        return Err(Error::InvalidPath(format!(
            "path escapes project root: {file}"
        )));
    }

    let content = std::fs::read_to_string(&resolved)?;
    Ok(content
        .lines()
        .enumerate()
        .map(|(i, l)| (i as u32 + 1, l.to_string()))
        .collect())
}
