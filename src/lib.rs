//! Interactive test watcher for Go projects — run `go test`, stream its JSON
//! events into a hierarchical result tree with coverage, and broadcast
//! snapshots to attached consumers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sentinel::config::RunConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> sentinel::Result<()> {
//! let config = RunConfig::builder("./...").build();
//! let outcome = sentinel::run_once(config).await?;
//! println!("{} passed, {} failed", outcome.passed, outcome.failed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod coverage;
pub mod error;
pub mod event;
pub mod gotool;
pub mod group;
pub mod hub;
pub mod parser;
pub mod process;
pub mod project;
pub mod runlog;
pub mod settings;
pub mod snapshot;
pub mod tree;

pub use config::{RunConfig, RunConfigBuilder};
pub use controller::{Controller, FileEvent, FileOp, RunOutcome};
pub use error::{Error, Result};
pub use event::{Action, ErrorContext, ErrorLocation, TestEvent, TestResult};
pub use hub::{Hub, Subscriber};
pub use parser::{EventParser, ParseMode};
pub use process::{ProcessRunner, RunnerState};
pub use snapshot::Envelope;
pub use tree::{TestTree, TreeHandle, TreeNode};

/// Re-export the cancel token type for convenience.
pub use tokio_util::sync::CancellationToken;

/// Run the full pipeline once and return the outcome.
///
/// This is the simple API — for cancellation support, use
/// `run_once_with_cancel`.
pub async fn run_once(config: RunConfig) -> Result<RunOutcome> {
    run_once_with_cancel(config, CancellationToken::new()).await
}

/// Run the pipeline once under an external cancellation token.
pub async fn run_once_with_cancel(
    config: RunConfig,
    token: CancellationToken,
) -> Result<RunOutcome> {
    let controller = Controller::new(config);
    controller.run_once(token).await
}
