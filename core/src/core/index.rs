//! Read-only catalog over the artifact store.
//!
//! Queries load run records straight from disk, so the index never goes
//! stale and needs no separate state of its own. Results are ordered by
//! start time ascending, ties broken by run id, so repeated queries are
//! deterministic.

use chrono::{DateTime, Utc};
use log::warn;

use crate::core::store::ArtifactStore;
use crate::core::{ArtifactKind, Run, RunId};
use crate::error::Result;
use crate::utils::extractor::{extract_summary, Summary};

pub struct RunIndex {
    store: ArtifactStore,
}

impl RunIndex {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub fn find_by_id(&self, id: &RunId) -> Result<Run> {
        self.store.load_run(id)
    }

    /// All readable runs, ordered. Unreadable records are skipped with a
    /// warning instead of failing the whole listing.
    pub fn all(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for id in self.store.list()? {
            match self.store.load_run(&id) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("skipping unreadable run {}: {}", id, e),
            }
        }
        sort_runs(&mut runs);
        Ok(runs)
    }

    pub fn find_by_target(&self, target: &str) -> Result<Vec<Run>> {
        let mut runs = self.all()?;
        runs.retain(|run| run.target == target);
        Ok(runs)
    }

    /// Runs whose start time falls inside `[start, end]`, inclusive.
    pub fn find_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Run>> {
        let mut runs = self.all()?;
        runs.retain(|run| run.started_at >= start && run.started_at <= end);
        Ok(runs)
    }

    /// Recomputes the summary from the stored stdout artifact. A missing or
    /// unreadable artifact degrades to an empty summary; only an absent run
    /// is an error. The result is cached as `summary.json` best-effort.
    pub fn summarize(&self, id: &RunId) -> Result<Summary> {
        self.store.load_run(id)?;
        let text = match self.store.read(id, ArtifactKind::Stdout) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("no stdout artifact for {}: {}", id, e);
                String::new()
            }
        };
        let summary = extract_summary(id, &text);
        if let Err(e) = self.store.write_summary(id, &summary) {
            warn!("failed to cache summary for {}: {}", id, e);
        }
        Ok(summary)
    }
}

fn sort_runs(runs: &mut [Run]) {
    runs.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
