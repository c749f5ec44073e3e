use thiserror::Error;

use crate::core::{ArtifactKind, RunId};

/// Error taxonomy for the capture layer.
///
/// Errors that prevent a run from being recorded (`ToolNotFound`,
/// `InvalidInput`) are returned synchronously from `submit`. Anything that
/// happens after a run has been accepted is recorded as the run's terminal
/// status instead of propagating back to the submitter.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tool binary '{0}' not found")]
    ToolNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} is sealed")]
    RunSealed(RunId),

    #[error("run {0} has no {1} artifact")]
    ArtifactMissing(RunId, ArtifactKind),

    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt run record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
