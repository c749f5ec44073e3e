//! Durable, per-run artifact storage.
//!
//! One directory per run under the storage root, self-describing on disk:
//!
//! ```text
//! <root>/run_<ts>_<suffix>/
//!     run.json      metadata (target, argv, status, timestamps, exit code)
//!     stdout.log    raw capture, append-only until sealed
//!     stderr.log    raw capture, append-only until sealed
//!     summary.json  derived cache, regenerable at any time
//! ```
//!
//! Runs own disjoint directories, so concurrent runs never contend on the
//! same file. Metadata writes go through a tmp + rename so a kill mid-flush
//! cannot corrupt the record.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::warn;
use tokio::io::AsyncWriteExt;

use crate::core::{ArtifactKind, Run, RunId, RunStatus};
use crate::error::{Error, Result};
use crate::utils::extractor::Summary;

#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    // Seal flags shared with open writers so `seal` takes effect on the
    // next `append` without re-reading run.json per write.
    seals: Mutex<HashMap<RunId, Arc<AtomicBool>>>,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                seals: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn run_dir(&self, id: &RunId) -> PathBuf {
        self.inner.root.join(id.as_str())
    }

    fn run_file(&self, id: &RunId) -> PathBuf {
        self.run_dir(id).join("run.json")
    }

    /// Creates the run directory and persists the initial record.
    pub fn create(&self, run: &Run) -> Result<()> {
        let dir = self.run_dir(&run.id);
        if dir.exists() {
            return Err(Error::InvalidInput(format!(
                "run directory already exists: {}",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        self.save_run(run)?;
        let mut seals = self.inner.seals.lock().expect("seal table lock poisoned");
        seals.insert(run.id.clone(), Arc::new(AtomicBool::new(run.sealed)));
        Ok(())
    }

    /// Atomic write: serialize to .tmp, then rename over the real file.
    pub fn save_run(&self, run: &Run) -> Result<()> {
        let path = self.run_file(&run.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(run)?;
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load_run(&self, id: &RunId) -> Result<Run> {
        let path = self.run_file(id);
        let data = match fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::RunNotFound(id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    fn seal_flag(&self, id: &RunId) -> Result<Arc<AtomicBool>> {
        {
            let seals = self.inner.seals.lock().expect("seal table lock poisoned");
            if let Some(flag) = seals.get(id) {
                return Ok(Arc::clone(flag));
            }
        }
        // Not in memory yet: prime from the persisted record. Sealed runs
        // are not cached; the seal bit is absorbing and run.json is
        // authoritative, so the table only ever tracks unsealed runs.
        let run = self.load_run(id)?;
        if run.sealed {
            return Ok(Arc::new(AtomicBool::new(true)));
        }
        let mut seals = self.inner.seals.lock().expect("seal table lock poisoned");
        let flag = seals
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        Ok(Arc::clone(flag))
    }

    /// Flips the in-memory flag shared with any open writers and drops the
    /// table entry; sealed state is served from disk afterwards.
    fn mark_sealed(&self, id: &RunId) {
        let mut seals = self.inner.seals.lock().expect("seal table lock poisoned");
        if let Some(flag) = seals.remove(id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Opens an append-only writer for a raw artifact. Fails with
    /// `RunSealed` once the run has been sealed.
    pub fn writer(&self, id: &RunId, kind: ArtifactKind) -> Result<ArtifactWriter> {
        if !kind.is_raw() {
            return Err(Error::InvalidInput(format!(
                "artifact kind '{}' is derived, not writable",
                kind
            )));
        }
        let sealed = self.seal_flag(id)?;
        if sealed.load(Ordering::SeqCst) {
            return Err(Error::RunSealed(id.clone()));
        }
        let path = self.run_dir(id).join(kind.file_name());
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ArtifactWriter {
            run_id: id.clone(),
            file: tokio::fs::File::from_std(file),
            sealed,
        })
    }

    /// Freezes the run's raw artifacts. Idempotent.
    pub fn seal(&self, id: &RunId) -> Result<()> {
        let mut run = self.load_run(id)?;
        if !run.sealed {
            run.sealed = true;
            self.save_run(&run)?;
        }
        self.mark_sealed(id);
        Ok(())
    }

    pub fn is_sealed(&self, id: &RunId) -> Result<bool> {
        Ok(self.seal_flag(id)?.load(Ordering::SeqCst))
    }

    pub fn read(&self, id: &RunId, kind: ArtifactKind) -> Result<Vec<u8>> {
        let dir = self.run_dir(id);
        if !dir.exists() {
            return Err(Error::RunNotFound(id.clone()));
        }
        match fs::read(dir.join(kind.file_name())) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ArtifactMissing(id.clone(), kind))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Summaries are derived caches, so writing one is allowed even after
    /// the run is sealed.
    pub fn write_summary(&self, id: &RunId, summary: &Summary) -> Result<()> {
        let dir = self.run_dir(id);
        if !dir.exists() {
            return Err(Error::RunNotFound(id.clone()));
        }
        let path = dir.join(ArtifactKind::Summary.file_name());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(summary)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Lists all run ids found under the root, sorted. Re-listing is
    /// idempotent; in-flight runs appear with their non-terminal status.
    pub fn list(&self) -> Result<Vec<RunId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.inner.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(RunId::parse) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Marks runs left non-terminal by a previous process (crash, kill) as
    /// `Failed` and seals them. Called once at orchestrator startup so no
    /// run stays `Running` forever.
    pub fn reconcile_orphans(&self) -> Result<Vec<RunId>> {
        let mut orphaned = Vec::new();
        for id in self.list()? {
            let mut run = match self.load_run(&id) {
                Ok(run) => run,
                Err(e) => {
                    warn!("skipping unreadable run {}: {}", id, e);
                    continue;
                }
            };
            if run.status.is_terminal() {
                continue;
            }
            run.status = RunStatus::Failed;
            run.ended_at = Some(Utc::now());
            run.sealed = true;
            self.save_run(&run)?;
            self.mark_sealed(&id);
            orphaned.push(id);
        }
        Ok(orphaned)
    }
}

/// Append-only handle to one raw artifact. Writes go straight to the
/// per-run file, so capture never buffers an unbounded amount in memory.
#[derive(Debug)]
pub struct ArtifactWriter {
    run_id: RunId,
    file: tokio::fs::File,
    sealed: Arc<AtomicBool>,
}

impl ArtifactWriter {
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::RunSealed(self.run_id.clone()));
        }
        self.file.write_all(bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::extractor::extract_summary;
    use chrono::Utc;

    fn test_run(target: &str) -> Run {
        let id = RunId::generate(Utc::now());
        Run::new(
            id,
            target,
            vec!["--batch".to_string()],
            vec!["-u".to_string(), target.to_string(), "--batch".to_string()],
            "sqlmap",
            Utc::now(),
        )
    }

    fn test_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("runs")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_append_then_read_is_byte_identical() {
        let (_dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();

        let mut w = store.writer(&run.id, ArtifactKind::Stdout).unwrap();
        w.append(b"first chunk\n").await.unwrap();
        w.append(b"second chunk\n").await.unwrap();
        w.append(&[0xff, 0x00, 0x7f]).await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        let bytes = store.read(&run.id, ArtifactKind::Stdout).unwrap();
        assert_eq!(bytes, b"first chunk\nsecond chunk\n\xff\x00\x7f");
    }

    #[tokio::test]
    async fn test_append_after_seal_fails() {
        let (_dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();

        let mut w = store.writer(&run.id, ArtifactKind::Stdout).unwrap();
        w.append(b"before seal").await.unwrap();
        w.flush().await.unwrap();
        store.seal(&run.id).unwrap();

        let err = w.append(b"after seal").await.unwrap_err();
        assert!(matches!(err, Error::RunSealed(ref id) if *id == run.id));

        // Nothing partial made it through.
        let bytes = store.read(&run.id, ArtifactKind::Stdout).unwrap();
        assert_eq!(bytes, b"before seal");
    }

    #[tokio::test]
    async fn test_writer_open_after_seal_fails() {
        let (_dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();
        store.seal(&run.id).unwrap();

        let err = store.writer(&run.id, ArtifactKind::Stderr).unwrap_err();
        assert!(matches!(err, Error::RunSealed(_)));
    }

    #[test]
    fn test_seal_is_idempotent_and_survives_reopen() {
        let (dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();
        store.seal(&run.id).unwrap();
        store.seal(&run.id).unwrap();

        // Fresh store instance over the same root sees the seal.
        let reopened = ArtifactStore::open(dir.path().join("runs")).unwrap();
        assert!(reopened.is_sealed(&run.id).unwrap());
        assert!(matches!(
            reopened.writer(&run.id, ArtifactKind::Stdout).unwrap_err(),
            Error::RunSealed(_)
        ));
    }

    #[tokio::test]
    async fn test_seal_evicts_in_memory_flag() {
        let (_dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();
        assert!(store.inner.seals.lock().unwrap().contains_key(&run.id));

        store.seal(&run.id).unwrap();
        assert!(!store.inner.seals.lock().unwrap().contains_key(&run.id));

        // Sealed state is still enforced, served from run.json.
        assert!(store.is_sealed(&run.id).unwrap());
        assert!(matches!(
            store.writer(&run.id, ArtifactKind::Stdout).unwrap_err(),
            Error::RunSealed(_)
        ));

        // Checks against sealed runs do not repopulate the table.
        assert!(!store.inner.seals.lock().unwrap().contains_key(&run.id));
    }

    #[test]
    fn test_summary_writable_after_seal() {
        let (_dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();
        store.seal(&run.id).unwrap();

        let summary = extract_summary(&run.id, "Database: dvwa\n");
        store.write_summary(&run.id, &summary).unwrap();
        let bytes = store.read(&run.id, ArtifactKind::Summary).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn test_list_is_sorted_and_idempotent() {
        let (_dir, store) = test_store();
        let mut created: Vec<RunId> = Vec::new();
        for i in 0..3 {
            let run = test_run(&format!("http://{}.example", i));
            store.create(&run).unwrap();
            created.push(run.id);
        }
        created.sort();

        let listed = store.list().unwrap();
        assert_eq!(listed, created);
        assert_eq!(store.list().unwrap(), listed);
    }

    #[test]
    fn test_load_missing_run_is_not_found() {
        let (_dir, store) = test_store();
        let id = RunId::parse("run_20250101T000000Z_zzzzzz").unwrap();
        assert!(matches!(store.load_run(&id), Err(Error::RunNotFound(_))));
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let (_dir, store) = test_store();
        let run = test_run("http://a.example");
        store.create(&run).unwrap();
        assert!(matches!(store.create(&run), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_reconcile_orphans_marks_running_as_failed() {
        let (dir, store) = test_store();
        let mut run = test_run("http://a.example");
        store.create(&run).unwrap();
        run.status = RunStatus::Running;
        store.save_run(&run).unwrap();

        // Simulate a restart: new store over the same root.
        let reopened = ArtifactStore::open(dir.path().join("runs")).unwrap();
        let orphaned = reopened.reconcile_orphans().unwrap();
        assert_eq!(orphaned, vec![run.id.clone()]);

        let run = reopened.load_run(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.sealed);
        assert!(run.ended_at.is_some());

        // Second pass finds nothing left to fix.
        assert!(reopened.reconcile_orphans().unwrap().is_empty());
    }
}
