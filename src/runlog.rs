use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::TestEvent;

/// Metadata about a run, stored alongside the NDJSON event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunMeta {
    pub run_id: String,
    pub package_pattern: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub events: u64,
}

/// Tees parsed events of one run to an NDJSON file for post-mortem debugging.
///
/// Events go to `<data_dir>/sentinel/runs/<run-id>.ndjson.tmp`, which is
/// atomically renamed to `.ndjson` on [`finalize`](RunLogger::finalize). The
/// core never reads these files back.
pub struct RunLogger {
    run_id: String,
    runs_dir: PathBuf,
    writer: std::io::BufWriter<std::fs::File>,
    package_pattern: String,
    start_secs: u64,
    events: u64,
}

impl RunLogger {
    pub fn new(run_id: &str, package_pattern: &str) -> Result<Self> {
        let runs_dir = Self::runs_dir()?;
        Self::new_in(runs_dir, run_id, package_pattern)
    }

    pub(crate) fn new_in(runs_dir: PathBuf, run_id: &str, package_pattern: &str) -> Result<Self> {
        std::fs::create_dir_all(&runs_dir)
            .map_err(|e| Error::Other(format!("failed to create runs dir: {e}")))?;

        let tmp_path = runs_dir.join(format!("{run_id}.ndjson.tmp"));
        let file = std::fs::File::create(&tmp_path)
            .map_err(|e| Error::Other(format!("failed to create run log: {e}")))?;

        let start_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Ok(Self {
            run_id: run_id.to_string(),
            runs_dir,
            writer: std::io::BufWriter::new(file),
            package_pattern: package_pattern.to_string(),
            start_secs,
            events: 0,
        })
    }

    /// Log a single event to the run file.
    pub fn log_event(&mut self, event: &TestEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                self.events += 1;
                if let Err(e) = writeln!(self.writer, "{json}") {
                    tracing::warn!("failed to write run log: {e}");
                }
            }
            Err(e) => {
                tracing::warn!("failed to serialize event for run log: {e}");
            }
        }
    }

    /// Flush, atomically rename the NDJSON file, and write meta.json.
    pub fn finalize(&mut self, success: bool, duration_ms: Option<u64>) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("failed to flush run log: {e}");
        }

        let tmp_path = self.runs_dir.join(format!("{}.ndjson.tmp", self.run_id));
        let final_path = self.runs_dir.join(format!("{}.ndjson", self.run_id));
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            tracing::warn!("failed to rename run log: {e}");
        }

        let meta = RunMeta {
            run_id: self.run_id.clone(),
            package_pattern: self.package_pattern.clone(),
            start_time: self.start_secs.to_string(),
            duration_ms,
            success,
            events: self.events,
        };

        let meta_path = self.runs_dir.join(format!("{}.meta.json", self.run_id));
        if let Ok(json) = serde_json::to_string_pretty(&meta) {
            if let Err(e) = std::fs::write(&meta_path, json) {
                tracing::warn!("failed to write run metadata: {e}");
            }
        }
    }

    fn is_finalized(&self) -> bool {
        let tmp_path = self.runs_dir.join(format!("{}.ndjson.tmp", self.run_id));
        !tmp_path.exists()
    }

    /// Default runs directory: `<data_dir>/sentinel/runs/`.
    pub fn runs_dir() -> Result<PathBuf> {
        dirs::data_local_dir()
            .map(|d| d.join("sentinel").join("runs"))
            .ok_or_else(|| Error::Other("cannot determine data directory".into()))
    }
}

impl Drop for RunLogger {
    fn drop(&mut self) {
        // If finalize() was never called, at least flush the buffer so the
        // .tmp file has all data for post-mortem debugging.
        if !self.is_finalized() {
            if let Err(e) = self.writer.flush() {
                tracing::warn!("RunLogger dropped without finalize, flush failed: {e}");
            }
        }
    }
}
