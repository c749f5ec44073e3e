pub mod index;
pub mod options;
pub mod orchestrator;
pub mod runner;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Unique identifier for one invocation of the external tool.
///
/// Format: `run_<UTC timestamp>_<random suffix>`, e.g.
/// `run_20260823T101500Z_x7k2pq`. The timestamp prefix makes ids sort
/// roughly by submission time; the suffix keeps concurrent submissions
/// from colliding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        RunId(format!("run_{}_{}", now.format("%Y%m%dT%H%M%SZ"), suffix))
    }

    /// Parses a directory name back into a RunId. Anything that does not
    /// carry the `run_` prefix is not ours and is ignored during listing.
    pub fn parse(s: &str) -> Option<Self> {
        if s.starts_with("run_") && s.len() > 4 {
            Some(RunId(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a run: `Pending -> Running -> {Succeeded, Failed, TimedOut,
/// Cancelled}`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::TimedOut | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Output blobs a run can own. `Stdout` and `Stderr` are raw captures and
/// are frozen once the run is sealed; `Summary` is a derived cache that may
/// be regenerated at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Stdout,
    Stderr,
    Summary,
}

impl ArtifactKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Stdout => "stdout.log",
            ArtifactKind::Stderr => "stderr.log",
            ArtifactKind::Summary => "summary.json",
        }
    }

    pub fn is_raw(self) -> bool {
        matches!(self, ArtifactKind::Stdout | ArtifactKind::Stderr)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArtifactKind::Stdout => "stdout",
            ArtifactKind::Stderr => "stderr",
            ArtifactKind::Summary => "summary",
        };
        f.write_str(label)
    }
}

/// One invocation of the external tool against one target.
///
/// `args` is what the caller submitted; `argv` is the full composed argument
/// vector actually handed to the tool, kept so a run is reproducible from
/// its record alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub target: String,
    pub args: Vec<String>,
    pub argv: Vec<String>,
    pub tool: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub sealed: bool,
}

impl Run {
    pub fn new(
        id: RunId,
        target: impl Into<String>,
        args: Vec<String>,
        argv: Vec<String>,
        tool: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target: target.into(),
            args,
            argv,
            tool: tool.into(),
            status: RunStatus::Pending,
            started_at,
            ended_at: None,
            exit_code: None,
            sealed: false,
        }
    }
}
