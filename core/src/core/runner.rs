//! Subprocess execution with deterministic output capture.
//!
//! The runner spawns the external tool, streams its stdout/stderr into the
//! artifact store chunk by chunk, and races completion against a timeout
//! and a cancellation signal. Termination goes through `terminate` first
//! and escalates to `kill` after a grace period.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;

use crate::core::store::ArtifactWriter;
use crate::core::RunStatus;
use crate::error::{Error, Result};

/// Capability seam over a spawned child process, so the runner logic stays
/// independent of the platform process API.
#[async_trait]
pub trait ProcessHandle: Send {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;
    /// Best-effort stop request; the process may ignore it.
    fn terminate(&mut self) -> std::io::Result<()>;
    /// Forced termination.
    async fn kill(&mut self) -> std::io::Result<()>;
}

#[derive(Debug)]
pub struct TokioProcessHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Spawns the external tool with piped output. A missing binary surfaces as
/// `ToolNotFound` rather than a bare IO error.
pub fn spawn_tool(program: &str, argv: &[String]) -> Result<TokioProcessHandle> {
    let child = Command::new(program)
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ToolNotFound(program.to_string()),
            _ => Error::Io(e),
        })?;
    Ok(TokioProcessHandle { child })
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub timeout: Duration,
    pub grace: Duration,
    /// Exit-code policy: with the default `true`, only exit code 0 maps to
    /// `Succeeded`; with `false` any normal exit does.
    pub fail_on_nonzero_exit: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            grace: Duration::from_secs(5),
            fail_on_nonzero_exit: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

/// Resolves once the cancel channel carries `true`. Pends forever if the
/// sender is gone without cancelling, so callers can race it in a select.
pub(crate) async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drives a spawned tool to completion, streaming its output into the
/// given writers. Returns the terminal status mapping: normal exit per the
/// exit policy, elapsed timeout as `TimedOut`, cancellation as `Cancelled`.
pub async fn run_tool<P: ProcessHandle>(
    mut child: P,
    stdout_writer: ArtifactWriter,
    stderr_writer: ArtifactWriter,
    opts: RunnerOptions,
    mut cancel: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    let stdout = child
        .take_stdout()
        .ok_or_else(|| Error::Process("child stdout was not piped".into()))?;
    let stderr = child
        .take_stderr()
        .ok_or_else(|| Error::Process("child stderr was not piped".into()))?;

    let stdout_pump = tokio::spawn(pump(stdout, stdout_writer));
    let stderr_pump = tokio::spawn(pump(stderr, stderr_writer));

    let timeout = tokio::time::sleep(opts.timeout);
    tokio::pin!(timeout);

    let mut timed_out = false;
    let mut was_cancelled = false;

    let exit = tokio::select! {
        res = child.wait() => Some(res?),
        _ = &mut timeout => {
            timed_out = true;
            None
        }
        _ = cancel_requested(&mut cancel) => {
            was_cancelled = true;
            None
        }
    };

    let exit = match exit {
        Some(status) => Some(status),
        None => {
            if let Err(e) = child.terminate() {
                warn!("failed to signal child process: {}", e);
            }
            match tokio::time::timeout(opts.grace, child.wait()).await {
                Ok(res) => res.ok(),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill child process: {}", e);
                    }
                    child.wait().await.ok()
                }
            }
        }
    };

    // Readers hit EOF once the child is gone; join so every captured byte
    // is flushed before the run gets sealed.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    let exit_code = exit.as_ref().and_then(|s| s.code());
    let status = if was_cancelled {
        RunStatus::Cancelled
    } else if timed_out {
        RunStatus::TimedOut
    } else {
        match exit_code {
            Some(0) => RunStatus::Succeeded,
            Some(_) if !opts.fail_on_nonzero_exit => RunStatus::Succeeded,
            _ => RunStatus::Failed,
        }
    };

    Ok(RunOutcome { status, exit_code })
}

/// Copies child output into an artifact writer in bounded chunks. Capture
/// errors are logged, not fatal: the run's status comes from the process,
/// not from how much of its output we managed to keep.
async fn pump(mut reader: Box<dyn AsyncRead + Send + Unpin>, mut writer: ArtifactWriter) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.append(&buf[..n]).await {
                    warn!("artifact write failed: {}", e);
                    break;
                }
            }
            Err(e) => {
                warn!("output capture failed: {}", e);
                break;
            }
        }
    }
    if let Err(e) = writer.flush().await {
        warn!("artifact flush failed: {}", e);
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::core::store::ArtifactStore;
    use crate::core::{ArtifactKind, Run, RunId};
    use chrono::Utc;

    fn test_setup(target: &str) -> (tempfile::TempDir, ArtifactStore, Run) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("runs")).unwrap();
        let id = RunId::generate(Utc::now());
        let run = Run::new(id, target, vec![], vec![], "sh", Utc::now());
        store.create(&run).unwrap();
        (dir, store, run)
    }

    fn sh(script: &str) -> TokioProcessHandle {
        spawn_tool("sh", &["-c".to_string(), script.to_string()]).unwrap()
    }

    fn fast_opts() -> RunnerOptions {
        RunnerOptions {
            timeout: Duration::from_millis(500),
            grace: Duration::from_millis(200),
            fail_on_nonzero_exit: true,
        }
    }

    async fn drive(store: &ArtifactStore, run: &Run, child: TokioProcessHandle, opts: RunnerOptions, cancel: watch::Receiver<bool>) -> RunOutcome {
        run_tool(
            child,
            store.writer(&run.id, ArtifactKind::Stdout).unwrap(),
            store.writer(&run.id, ArtifactKind::Stderr).unwrap(),
            opts,
            cancel,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_zero_exit_is_succeeded() {
        let (_dir, store, run) = test_setup("t");
        let (_tx, rx) = watch::channel(false);
        let outcome = drive(&store, &run, sh("echo out; echo err >&2"), fast_opts(), rx).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(store.read(&run.id, ArtifactKind::Stdout).unwrap(), b"out\n");
        assert_eq!(store.read(&run.id, ArtifactKind::Stderr).unwrap(), b"err\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (_dir, store, run) = test_setup("t");
        let (_tx, rx) = watch::channel(false);
        let outcome = drive(&store, &run, sh("echo boom >&2; exit 1"), fast_opts(), rx).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.exit_code, Some(1));
        assert!(!store.read(&run.id, ArtifactKind::Stderr).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_allowed_by_policy() {
        let (_dir, store, run) = test_setup("t");
        let (_tx, rx) = watch::channel(false);
        let opts = RunnerOptions { fail_on_nonzero_exit: false, ..fast_opts() };
        let outcome = drive(&store, &run, sh("exit 3"), opts, rx).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let (_dir, store, run) = test_setup("t");
        let (_tx, rx) = watch::channel(false);
        let outcome = drive(&store, &run, sh("echo started; sleep 10; echo done"), fast_opts(), rx).await;
        assert_eq!(outcome.status, RunStatus::TimedOut);

        let stdout = store.read(&run.id, ArtifactKind::Stdout).unwrap();
        let text = String::from_utf8_lossy(&stdout);
        assert!(text.contains("started"));
        assert!(!text.contains("done"));
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let (_dir, store, run) = test_setup("t");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let opts = RunnerOptions { timeout: Duration::from_secs(30), ..fast_opts() };
        let outcome = drive(&store, &run, sh("sleep 30"), opts, rx).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_not_found() {
        let err = spawn_tool("scanvault-no-such-tool", &[]).unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }
}
