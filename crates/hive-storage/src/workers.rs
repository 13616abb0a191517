use hive_core::*;
use rusqlite::params;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::rows::{query_all, query_one, worker_from_row, WORKER_COLUMNS};
use crate::store::SqliteStore;

impl SqliteStore {
    pub fn register_worker(&self, outcome_id: &OutcomeId, phase: TaskPhase) -> StoreResult<Worker> {
        let now = now_ms();
        let worker = Worker {
            id: WorkerId::new(),
            outcome_id: outcome_id.clone(),
            status: WorkerStatus::Idle,
            phase,
            current_task_id: None,
            iteration: 0,
            last_heartbeat: Some(now),
            pid: None,
            cost: 0.0,
            consecutive_failures: 0,
            worktree_path: None,
            branch_name: None,
            created_at: now,
            updated_at: now,
        };
        self.conn().execute(
            &format!("INSERT INTO workers({WORKER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, NULL, 0, 0, NULL, NULL, ?5, ?5)"),
            params![worker.id.0, outcome_id.0, worker.status.as_str(), phase.as_str(), now],
        )?;
        debug!(worker = %worker.id, outcome = %outcome_id, phase = %phase, "registered worker");
        Ok(worker)
    }

    pub fn get_worker(&self, id: &WorkerId) -> StoreResult<Worker> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id=?1");
        query_one(&self.conn(), &sql, params![id.0], worker_from_row)?
            .ok_or_else(|| StoreError::not_found("worker", id.as_str()))
    }

    pub fn list_workers(&self, outcome_id: Option<&OutcomeId>) -> StoreResult<Vec<Worker>> {
        match outcome_id {
            Some(o) => {
                let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE outcome_id=?1 ORDER BY created_at, rowid");
                query_all(&self.conn(), &sql, params![o.0], worker_from_row)
            }
            None => {
                let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at, rowid");
                query_all(&self.conn(), &sql, [], worker_from_row)
            }
        }
    }

    /// Workers in `idle` or `running`.
    pub fn list_active_workers(&self) -> StoreResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE status IN ('idle', 'running') ORDER BY created_at, rowid"
        );
        query_all(&self.conn(), &sql, [], worker_from_row)
    }

    pub fn set_worker_status(&self, id: &WorkerId, status: WorkerStatus) -> StoreResult<Worker> {
        let n = self.conn().execute(
            "UPDATE workers SET status=?1, updated_at=?2 WHERE id=?3",
            params![status.as_str(), now_ms(), id.0],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("worker", id.as_str()));
        }
        debug!(worker = %id, status = %status, "worker status");
        self.get_worker(id)
    }

    pub fn set_worker_phase(&self, id: &WorkerId, phase: TaskPhase) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE workers SET phase=?1, updated_at=?2 WHERE id=?3",
            params![phase.as_str(), now_ms(), id.0],
        )?;
        Ok(())
    }

    /// Refresh the heartbeat of a running worker. Returns false for any other status.
    pub fn heartbeat(&self, id: &WorkerId) -> StoreResult<bool> {
        let n = self.conn().execute(
            "UPDATE workers SET last_heartbeat=?1 WHERE id=?2 AND status='running'",
            params![now_ms(), id.0],
        )?;
        Ok(n > 0)
    }

    pub fn set_worker_pid(&self, id: &WorkerId, pid: Option<u32>) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE workers SET pid=?1, updated_at=?2 WHERE id=?3",
            params![pid.map(|p| p as i64), now_ms(), id.0],
        )?;
        Ok(())
    }

    pub fn set_worker_worktree(&self, id: &WorkerId, path: &str, branch: &str) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE workers SET worktree_path=?1, branch_name=?2, updated_at=?3 WHERE id=?4",
            params![path, branch, now_ms(), id.0],
        )?;
        Ok(())
    }

    /// Bump and return the worker's iteration counter.
    pub fn begin_iteration(&self, id: &WorkerId) -> StoreResult<u32> {
        self.write_tx(|tx| {
            tx.execute(
                "UPDATE workers SET iteration=iteration+1, updated_at=?1 WHERE id=?2",
                params![now_ms(), id.0],
            )?;
            let it: Option<i64> = query_one(tx, "SELECT iteration FROM workers WHERE id=?1", params![id.0], |r| r.get(0))?;
            it.map(|v| v as u32).ok_or_else(|| StoreError::not_found("worker", id.as_str()))
        })
    }

    /// Track the failure streak and accumulated cost. Returns the new streak length.
    pub fn record_task_result(&self, id: &WorkerId, verdict: TaskVerdict, cost: f64) -> StoreResult<u32> {
        self.write_tx(|tx| {
            let sql = match verdict {
                TaskVerdict::Succeeded => {
                    "UPDATE workers SET consecutive_failures=0, cost=cost+?1, updated_at=?2 WHERE id=?3"
                }
                TaskVerdict::Failed => {
                    "UPDATE workers SET consecutive_failures=consecutive_failures+1, cost=cost+?1, updated_at=?2 WHERE id=?3"
                }
                TaskVerdict::Interrupted => "UPDATE workers SET cost=cost+?1, updated_at=?2 WHERE id=?3",
            };
            tx.execute(sql, params![cost.max(0.0), now_ms(), id.0])?;
            let streak: Option<i64> =
                query_one(tx, "SELECT consecutive_failures FROM workers WHERE id=?1", params![id.0], |r| r.get(0))?;
            streak.map(|v| v as u32).ok_or_else(|| StoreError::not_found("worker", id.as_str()))
        })
    }

    /// Running workers whose heartbeat is older than the threshold become `failed`.
    pub fn mark_stale_workers_failed(&self, stale_after_ms: i64) -> StoreResult<Vec<WorkerId>> {
        self.write_tx(|tx| {
            let cutoff = now_ms() - stale_after_ms;
            let ids: Vec<String> = query_all(
                tx,
                "SELECT id FROM workers WHERE status='running' AND COALESCE(last_heartbeat, created_at) < ?1",
                params![cutoff],
                |r| r.get(0),
            )?;
            for id in &ids {
                tx.execute(
                    "UPDATE workers SET status='failed', pid=NULL, updated_at=?1 WHERE id=?2",
                    params![now_ms(), id],
                )?;
                warn!(worker = %id, "worker stopped heartbeating, marked failed");
            }
            Ok(ids.into_iter().map(WorkerId::from_str).collect())
        })
    }
}
