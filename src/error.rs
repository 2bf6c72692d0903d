use std::path::PathBuf;

/// All errors that can occur in the sentinel core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("go binary not found: {binary} (is Go installed?)")]
    GoNotFound { binary: String },

    #[error("failed to start test process: {0}")]
    ProcessStart(#[source] std::io::Error),

    #[error("package {package} failed with exit code {code}: {output}")]
    Package {
        package: String,
        code: i32,
        output: String,
    },

    #[error("malformed test event at byte offset {offset}: {message}")]
    Decode { offset: u64, message: String },

    #[error("test run timed out after {0} seconds")]
    Timeout(u64),

    #[error("test run was cancelled")]
    Cancelled,

    #[error("send to subscriber {id} failed: {message}")]
    Send { id: String, message: String },

    #[error("failed to parse coverage profile: {0}")]
    CoverageParse(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("a test run is already in progress")]
    AlreadyRunning,

    #[error("rejected argument: {0}")]
    InvalidArgument(String),

    #[error("working directory missing or not a directory: {0}")]
    InvalidWorkDir(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable error code string for programmatic consumption.
    pub fn code(&self) -> &'static str {
        match self {
            Error::GoNotFound { .. } => "E001",
            Error::ProcessStart(_) => "E002",
            Error::Package { .. } => "E003",
            Error::Decode { .. } => "E004",
            Error::Timeout(_) => "E005",
            Error::Cancelled => "E006",
            Error::Send { .. } => "E007",
            Error::CoverageParse(_) => "E008",
            Error::InvalidPath(_) => "E009",
            Error::AlreadyRunning => "E010",
            Error::InvalidArgument(_) => "E011",
            Error::InvalidWorkDir(_) => "E012",
            Error::Io(_) => "E020",
            Error::Json(_) => "E021",
            Error::Other(_) => "E999",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
