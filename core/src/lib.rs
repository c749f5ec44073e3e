pub mod core;
pub mod error;
pub mod utils;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::core::index::RunIndex;
pub use crate::core::options::EnumerationOptions;
pub use crate::core::orchestrator::{Orchestrator, SubmitOptions};
pub use crate::core::runner::{run_tool, spawn_tool, ProcessHandle, RunOutcome, RunnerOptions};
pub use crate::core::store::{ArtifactStore, ArtifactWriter};
pub use crate::core::{ArtifactKind, Run, RunId, RunStatus};
pub use crate::error::{Error, Result};
pub use crate::utils::extractor::{extract_summary, Summary};

/// Capture-layer configuration, passed explicitly to the orchestrator at
/// construction. There is no module-level state: two orchestrators with
/// different roots coexist in one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Directory holding one subdirectory per run.
    pub storage_root: PathBuf,
    /// Program name or path of the wrapped analysis tool.
    pub tool: String,
    /// Flag placed before the target on the command line (`-u` for sqlmap).
    /// `None` passes the target positionally.
    pub target_flag: Option<String>,
    pub default_timeout_secs: u64,
    /// Seconds between the graceful stop request and the forced kill.
    pub grace_secs: u64,
    /// Maximum concurrently running subprocesses; 0 means unlimited.
    pub concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("runs"),
            tool: "sqlmap".to_string(),
            target_flag: Some("-u".to_string()),
            default_timeout_secs: 1800,
            grace_secs: 5,
            concurrency: 0,
        }
    }
}

impl Config {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Full argument vector handed to the tool: the target (prefixed by
    /// `target_flag` when set) followed by the caller's arguments. Anything
    /// that previews a run should compose through here so the preview and
    /// the executed command line cannot drift apart.
    pub fn compose_argv(&self, target: &str, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(flag) = &self.target_flag {
            argv.push(flag.clone());
        }
        argv.push(target.to_string());
        argv.extend_from_slice(args);
        argv
    }
}
