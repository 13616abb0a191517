use std::sync::{Arc, Mutex};

use anyhow::Result;
use hive_core::{MergeQueueEntry, OutcomeId, WorkerId};
use hive_storage::{MergeResolution, SqliteStore};
use tracing::{info, warn};

use crate::git::{GitWorktrees, MergeResult};

/// Records every merge attempt and resolves it to a terminal state.
pub struct MergeQueue {
    store: Arc<SqliteStore>,
    git: GitWorktrees,
    // One merge at a time against the repo root checkout.
    merge_lock: Mutex<()>,
}

impl MergeQueue {
    pub fn new(store: Arc<SqliteStore>, git: GitWorktrees) -> Self {
        Self { store, git, merge_lock: Mutex::new(()) }
    }

    pub fn git(&self) -> &GitWorktrees {
        &self.git
    }

    /// Queue and immediately attempt a merge of the worker's branch into trunk.
    /// Failures are persisted on the entry rather than returned.
    pub fn queue_merge(&self, outcome_id: &OutcomeId, worker_id: &WorkerId) -> Result<MergeQueueEntry> {
        let branch = GitWorktrees::branch_name(worker_id);
        let entry = self.store.create_merge_entry(outcome_id, worker_id, &branch, &self.git.trunk)?;
        self.process(entry)
    }

    /// Attempt a `pending` entry. Entries another process already took are returned as-is.
    pub fn process(&self, entry: MergeQueueEntry) -> Result<MergeQueueEntry> {
        if !self.store.begin_merge(&entry.id)? {
            return Ok(self.store.get_merge_entry(&entry.id)?);
        }

        let _guard = self.merge_lock.lock().unwrap_or_else(|e| e.into_inner());
        let message = format!("hive: merge {} ({})", entry.source_branch, entry.worker_id);
        let resolution = match self.git.merge_worker_branch(&entry.source_branch, &message) {
            Ok(MergeResult::Merged { commit }) => MergeResolution::Completed { merge_commit: commit },
            Ok(MergeResult::Conflicts(files)) => {
                warn!(merge = %entry.id, branch = %entry.source_branch, ?files, "merge conflicted");
                MergeResolution::Conflicted { files }
            }
            Err(e) => {
                warn!(merge = %entry.id, branch = %entry.source_branch, error = %e, "merge failed");
                MergeResolution::Failed { error: format!("{e:#}") }
            }
        };
        let done = self.store.finish_merge(&entry.id, &resolution)?;
        info!(merge = %done.id, status = %done.status, "merge resolved");
        Ok(done)
    }
}
