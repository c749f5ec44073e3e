//! Ties submission, execution, and persistence together.
//!
//! `submit` validates the request, resolves the tool binary, and persists a
//! `Pending` record before handing the run to the admission queue. The
//! queue is an ordered channel drained by a single dispatcher task that
//! acquires a concurrency permit before starting each worker, so queued
//! submissions start strictly in first-submitted-first-run order.
//! Everything after acceptance is recorded as the run's terminal status,
//! never thrown back at the submitter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::core::runner::{self, RunnerOptions};
use crate::core::store::ArtifactStore;
use crate::core::{ArtifactKind, Run, RunId, RunStatus};
use crate::error::{Error, Result};
use crate::utils;
use crate::Config;

/// Per-submission knobs. `timeout_secs` falls back to the configured
/// default when unset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub timeout_secs: Option<u64>,
    pub fail_on_nonzero_exit: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            fail_on_nonzero_exit: true,
        }
    }
}

struct ActiveRun {
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// One accepted submission travelling through the admission queue.
struct QueuedRun {
    run: Run,
    program: String,
    opts: RunnerOptions,
    cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

struct OrchInner {
    config: Config,
    store: ArtifactStore,
    semaphore: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<QueuedRun>,
    active: Mutex<HashMap<RunId, ActiveRun>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchInner>,
}

impl Orchestrator {
    /// Opens the store, reconciles runs orphaned by a previous process,
    /// sizes the admission semaphore from the configured concurrency limit,
    /// and starts the dispatcher. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let store = ArtifactStore::open(&config.storage_root)?;
        for id in store.reconcile_orphans()? {
            warn!("marked orphaned run {} as failed", id);
        }
        let permits = if config.concurrency == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.concurrency
        };
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(OrchInner {
            config,
            store,
            semaphore: Arc::new(Semaphore::new(permits)),
            queue_tx,
            active: Mutex::new(HashMap::new()),
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), queue_rx));
        Ok(Self { inner })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn index(&self) -> crate::core::index::RunIndex {
        crate::core::index::RunIndex::new(self.inner.store.clone())
    }

    /// Accepts a scan request. Validation and binary resolution happen here,
    /// synchronously, before any record is persisted; once this returns a
    /// RunId the run will reach a terminal status on its own.
    pub fn submit(&self, target: &str, args: &[String], opts: SubmitOptions) -> Result<RunId> {
        let target = target.trim();
        if target.is_empty() {
            return Err(Error::InvalidInput("target must not be empty".into()));
        }
        if args.iter().any(|a| a.contains('\0')) {
            return Err(Error::InvalidInput("arguments must not contain NUL bytes".into()));
        }
        let timeout_secs = opts
            .timeout_secs
            .unwrap_or(self.inner.config.default_timeout_secs);
        if timeout_secs == 0 {
            return Err(Error::InvalidInput("timeout must be greater than zero".into()));
        }

        let inner = &self.inner;
        let program = utils::get_binary_path(&inner.config.tool)
            .ok_or_else(|| Error::ToolNotFound(inner.config.tool.clone()))?;

        let now = Utc::now();
        let id = RunId::generate(now);
        let argv = inner.config.compose_argv(target, args);
        let run = Run::new(id.clone(), target, args.to_vec(), argv, inner.config.tool.clone(), now);
        inner.store.create(&run)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        inner
            .active
            .lock()
            .expect("active run table lock poisoned")
            .insert(id.clone(), ActiveRun { cancel_tx, done_rx });

        let item = QueuedRun {
            run,
            program,
            opts: RunnerOptions {
                timeout: Duration::from_secs(timeout_secs),
                grace: inner.config.grace(),
                fail_on_nonzero_exit: opts.fail_on_nonzero_exit,
            },
            cancel_rx,
            done_tx,
        };

        // The dispatcher outlives every handle, so this send only fails if
        // the runtime is tearing down; finalize inline rather than leave the
        // record stuck in Pending.
        if let Err(mpsc::error::SendError(item)) = inner.queue_tx.send(item) {
            error!("run queue closed, failing run {}", id);
            let mut run = item.run;
            finish(inner, &mut run, RunStatus::Failed, None);
            inner
                .active
                .lock()
                .expect("active run table lock poisoned")
                .remove(&run.id);
            let _ = item.done_tx.send(true);
        }

        Ok(id)
    }

    /// Requests cooperative cancellation. Idempotent: cancelling a run that
    /// already reached a terminal status is a no-op.
    pub fn cancel(&self, id: &RunId) -> Result<()> {
        {
            let active = self.inner.active.lock().expect("active run table lock poisoned");
            if let Some(entry) = active.get(id) {
                let _ = entry.cancel_tx.send(true);
                return Ok(());
            }
        }
        // Not active: either terminal (no-op) or unknown (error).
        self.inner.store.load_run(id).map(|_| ())
    }

    pub fn status(&self, id: &RunId) -> Result<Run> {
        self.inner.store.load_run(id)
    }

    /// Awaits the run's terminal status.
    pub async fn wait(&self, id: &RunId) -> Result<Run> {
        let rx = {
            let active = self.inner.active.lock().expect("active run table lock poisoned");
            active.get(id).map(|entry| entry.done_rx.clone())
        };
        if let Some(mut rx) = rx {
            loop {
                if *rx.borrow() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.inner.store.load_run(id)
    }
}

/// Admission: drains submissions in arrival order, acquiring a permit per
/// run before spawning its worker. With a finite limit the next queued run
/// starts only once an earlier one releases its permit, which preserves
/// submission order. Holds only a weak handle so dropping the last
/// orchestrator shuts the loop down.
async fn dispatch_loop(inner: Weak<OrchInner>, mut queue_rx: mpsc::UnboundedReceiver<QueuedRun>) {
    while let Some(item) = queue_rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let QueuedRun { run, program, opts, mut cancel_rx, done_tx } = item;

        let permit = tokio::select! {
            permit = inner.semaphore.clone().acquire_owned() => {
                permit.expect("semaphore closed unexpectedly")
            }
            _ = runner::cancel_requested(&mut cancel_rx) => {
                let mut run = run;
                finish(&inner, &mut run, RunStatus::Cancelled, None);
                inner
                    .active
                    .lock()
                    .expect("active run table lock poisoned")
                    .remove(&run.id);
                let _ = done_tx.send(true);
                continue;
            }
        };

        let worker_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            let run_id = run.id.clone();
            execute_run(&worker_inner, run, program, opts, cancel_rx).await;
            worker_inner
                .active
                .lock()
                .expect("active run table lock poisoned")
                .remove(&run_id);
            let _ = done_tx.send(true);
        });
    }
}

async fn execute_run(
    inner: &Arc<OrchInner>,
    mut run: Run,
    program: String,
    opts: RunnerOptions,
    cancel_rx: watch::Receiver<bool>,
) {
    // Cancelled while queued: never spawn the tool.
    if *cancel_rx.borrow() {
        finish(inner, &mut run, RunStatus::Cancelled, None);
        return;
    }

    run.status = RunStatus::Running;
    if let Err(e) = inner.store.save_run(&run) {
        error!("failed to persist running state for {}: {}", run.id, e);
    }

    let writers = (
        inner.store.writer(&run.id, ArtifactKind::Stdout),
        inner.store.writer(&run.id, ArtifactKind::Stderr),
    );
    let (stdout_writer, stderr_writer) = match writers {
        (Ok(out), Ok(err)) => (out, err),
        (Err(e), _) | (_, Err(e)) => {
            error!("failed to open artifact writers for {}: {}", run.id, e);
            finish(inner, &mut run, RunStatus::Failed, None);
            return;
        }
    };

    let child = match runner::spawn_tool(&program, &run.argv) {
        Ok(child) => child,
        Err(e) => {
            error!("failed to spawn tool for {}: {}", run.id, e);
            finish(inner, &mut run, RunStatus::Failed, None);
            return;
        }
    };

    info!("run {} started: {} {}", run.id, program, run.argv.join(" "));

    match runner::run_tool(child, stdout_writer, stderr_writer, opts, cancel_rx).await {
        Ok(outcome) => finish(inner, &mut run, outcome.status, outcome.exit_code),
        Err(e) => {
            error!("run {} aborted: {}", run.id, e);
            finish(inner, &mut run, RunStatus::Failed, None);
        }
    }
}

fn finish(inner: &Arc<OrchInner>, run: &mut Run, status: RunStatus, exit_code: Option<i32>) {
    run.status = status;
    run.ended_at = Some(Utc::now());
    run.exit_code = exit_code;
    if let Err(e) = inner.store.save_run(run) {
        error!("failed to persist terminal state for {}: {}", run.id, e);
    }
    if let Err(e) = inner.store.seal(&run.id) {
        error!("failed to seal run {}: {}", run.id, e);
    }
    info!("run {} finished: {}", run.id, status);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> Config {
        Config {
            storage_root: root.join("runs"),
            tool: "scanvault-missing-test-tool".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_empty_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(dir.path())).unwrap();
        let err = orch.submit("   ", &[], SubmitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_submit_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(dir.path())).unwrap();
        let opts = SubmitOptions { timeout_secs: Some(0), ..Default::default() };
        let err = orch.submit("http://a.example", &[], opts).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_submit_nul_arg_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(dir.path())).unwrap();
        let args = vec!["bad\0arg".to_string()];
        let err = orch.submit("http://a.example", &args, SubmitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_tool_fails_before_any_record() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(dir.path())).unwrap();
        let err = orch.submit("http://a.example", &[], SubmitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
        assert!(orch.store().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(dir.path())).unwrap();
        let id = RunId::parse("run_20250101T000000Z_nope00").unwrap();
        assert!(matches!(orch.cancel(&id), Err(Error::RunNotFound(_))));
    }
}
