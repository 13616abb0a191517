use hive_core::*;
use rusqlite::params;

use crate::error::{StoreError, StoreResult};
use crate::rows::{merge_from_row, query_all, query_one, to_json, MERGE_COLUMNS};
use crate::store::SqliteStore;

/// Terminal state of a merge attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeResolution {
    Completed { merge_commit: String },
    Conflicted { files: Vec<String> },
    Failed { error: String },
}

impl SqliteStore {
    pub fn create_merge_entry(
        &self,
        outcome_id: &OutcomeId,
        worker_id: &WorkerId,
        source_branch: &str,
        target_branch: &str,
    ) -> StoreResult<MergeQueueEntry> {
        let entry = MergeQueueEntry {
            id: MergeId::new(),
            outcome_id: outcome_id.clone(),
            worker_id: worker_id.clone(),
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            status: MergeStatus::Pending,
            conflict_files: vec![],
            error_message: None,
            merge_commit: None,
            created_at: now_ms(),
            completed_at: None,
        };
        self.conn().execute(
            &format!("INSERT INTO merge_queue({MERGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', '[]', NULL, NULL, ?6, NULL)"),
            params![entry.id.0, outcome_id.0, worker_id.0, source_branch, target_branch, entry.created_at],
        )?;
        Ok(entry)
    }

    pub fn get_merge_entry(&self, id: &MergeId) -> StoreResult<MergeQueueEntry> {
        let sql = format!("SELECT {MERGE_COLUMNS} FROM merge_queue WHERE id=?1");
        query_one(&self.conn(), &sql, params![id.0], merge_from_row)?
            .ok_or_else(|| StoreError::not_found("merge", id.as_str()))
    }

    pub fn list_merge_entries(&self, outcome_id: &OutcomeId) -> StoreResult<Vec<MergeQueueEntry>> {
        let sql = format!("SELECT {MERGE_COLUMNS} FROM merge_queue WHERE outcome_id=?1 ORDER BY created_at, rowid");
        query_all(&self.conn(), &sql, params![outcome_id.0], merge_from_row)
    }

    /// `pending -> in_progress`. False when another process already took the entry.
    pub fn begin_merge(&self, id: &MergeId) -> StoreResult<bool> {
        let n = self
            .conn()
            .execute("UPDATE merge_queue SET status='in_progress' WHERE id=?1 AND status='pending'", params![id.0])?;
        Ok(n > 0)
    }

    pub fn finish_merge(&self, id: &MergeId, resolution: &MergeResolution) -> StoreResult<MergeQueueEntry> {
        let now = now_ms();
        let conn = self.conn();
        match resolution {
            MergeResolution::Completed { merge_commit } => conn.execute(
                "UPDATE merge_queue SET status='completed', merge_commit=?1, completed_at=?2 WHERE id=?3",
                params![merge_commit, now, id.0],
            )?,
            MergeResolution::Conflicted { files } => conn.execute(
                "UPDATE merge_queue SET status='conflicted', conflict_files_json=?1, completed_at=?2 WHERE id=?3",
                params![to_json(files), now, id.0],
            )?,
            MergeResolution::Failed { error } => conn.execute(
                "UPDATE merge_queue SET status='failed', error_message=?1, completed_at=?2 WHERE id=?3",
                params![error, now, id.0],
            )?,
        };
        drop(conn);
        self.get_merge_entry(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn merge_entry_moves_through_states_once() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("hive.db")).unwrap();
        let e = store
            .create_merge_entry(&OutcomeId::from_str("out_1"), &WorkerId::from_str("wrk_1"), "hive/wrk_1", "main")
            .unwrap();
        assert_eq!(e.status, MergeStatus::Pending);
        assert!(store.begin_merge(&e.id).unwrap());
        assert!(!store.begin_merge(&e.id).unwrap());
        let done = store
            .finish_merge(&e.id, &MergeResolution::Conflicted { files: vec!["src/a.ts".into()] })
            .unwrap();
        assert_eq!(done.status, MergeStatus::Conflicted);
        assert_eq!(done.conflict_files, vec!["src/a.ts".to_string()]);
        assert!(done.completed_at.is_some());
    }
}
