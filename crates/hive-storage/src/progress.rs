use hive_core::*;
use rusqlite::params;
use tracing::debug;

use crate::error::StoreResult;
use crate::rows::{progress_from_row, query_all, query_one, PROGRESS_COLUMNS};
use crate::store::SqliteStore;

impl SqliteStore {
    pub fn append_progress(&self, new: NewProgress) -> StoreResult<ProgressEntry> {
        let entry = ProgressEntry {
            id: ProgressId::new(),
            outcome_id: new.outcome_id,
            worker_id: new.worker_id,
            iteration: new.iteration,
            task_id: new.task_id,
            content: new.content,
            full_output: new.full_output,
            compacted: false,
            compacted_into: None,
            created_at: now_ms(),
        };
        self.conn().execute(
            &format!("INSERT INTO progress_entries({PROGRESS_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8)"),
            params![
                entry.id.0,
                entry.outcome_id.0,
                entry.worker_id.0,
                entry.iteration as i64,
                entry.task_id.as_ref().map(|t| t.0.clone()),
                entry.content,
                entry.full_output,
                entry.created_at
            ],
        )?;
        Ok(entry)
    }

    /// Latest `limit` uncompacted entries of a worker by iteration, oldest first.
    pub fn progress_tail(&self, worker_id: &WorkerId, limit: usize) -> StoreResult<Vec<ProgressEntry>> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_entries WHERE worker_id=?1 AND compacted=0
             ORDER BY iteration DESC, rowid DESC LIMIT ?2"
        );
        let mut entries = query_all(&self.conn(), &sql, params![worker_id.0, limit as i64], progress_from_row)?;
        entries.reverse();
        Ok(entries)
    }

    pub fn last_progress_at(&self, worker_id: &WorkerId) -> StoreResult<Option<EpochMs>> {
        let at: Option<Option<i64>> = query_one(
            &self.conn(),
            "SELECT MAX(created_at) FROM progress_entries WHERE worker_id=?1",
            params![worker_id.0],
            |r| r.get(0),
        )?;
        Ok(at.flatten())
    }

    /// Fold a worker's entries up to `through_iteration` into one summary entry.
    pub fn compact_progress(
        &self,
        worker_id: &WorkerId,
        through_iteration: u32,
        summary: &str,
    ) -> StoreResult<Option<ProgressEntry>> {
        self.write_tx(|tx| {
            let sql = format!(
                "SELECT {PROGRESS_COLUMNS} FROM progress_entries
                 WHERE worker_id=?1 AND compacted=0 AND iteration<=?2 ORDER BY created_at, rowid"
            );
            let old = query_all(tx, &sql, params![worker_id.0, through_iteration as i64], progress_from_row)?;
            let Some(first) = old.first() else {
                return Ok(None);
            };
            let entry = ProgressEntry {
                id: ProgressId::new(),
                outcome_id: first.outcome_id.clone(),
                worker_id: worker_id.clone(),
                iteration: through_iteration,
                task_id: None,
                content: summary.to_string(),
                full_output: None,
                compacted: false,
                compacted_into: None,
                created_at: now_ms(),
            };
            tx.execute(
                &format!("INSERT INTO progress_entries({PROGRESS_COLUMNS}) VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, 0, NULL, ?6)"),
                params![entry.id.0, entry.outcome_id.0, worker_id.0, through_iteration as i64, entry.content, entry.created_at],
            )?;
            for e in &old {
                tx.execute(
                    "UPDATE progress_entries SET compacted=1, compacted_into=?1 WHERE id=?2",
                    params![entry.id.0, e.id.0],
                )?;
            }
            debug!(worker = %worker_id, folded = old.len(), "compacted progress");
            Ok(Some(entry))
        })
    }
}
