use hive_core::*;
use rusqlite::params;
use tracing::info;

use crate::error::StoreResult;
use crate::rows::{intervention_from_row, query_all, INTERVENTION_COLUMNS};
use crate::store::SqliteStore;

impl SqliteStore {
    pub fn queue_intervention(
        &self,
        outcome_id: &OutcomeId,
        worker_id: &WorkerId,
        kind: InterventionKind,
        message: &str,
    ) -> StoreResult<Intervention> {
        let iv = Intervention {
            id: InterventionId::new(),
            outcome_id: outcome_id.clone(),
            worker_id: worker_id.clone(),
            kind,
            message: message.to_string(),
            status: InterventionStatus::Pending,
            created_at: now_ms(),
            applied_at: None,
        };
        self.conn().execute(
            &format!("INSERT INTO interventions({INTERVENTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, NULL)"),
            params![iv.id.0, outcome_id.0, worker_id.0, kind.as_str(), iv.message, iv.created_at],
        )?;
        info!(worker = %worker_id, kind = %kind, "queued intervention");
        Ok(iv)
    }

    /// Take every pending intervention for a worker, marking them applied.
    pub fn drain_interventions(&self, worker_id: &WorkerId) -> StoreResult<Vec<Intervention>> {
        self.write_tx(|tx| {
            let sql = format!(
                "SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE worker_id=?1 AND status='pending' ORDER BY created_at, rowid"
            );
            let mut pending = query_all(tx, &sql, params![worker_id.0], intervention_from_row)?;
            let now = now_ms();
            for iv in &mut pending {
                tx.execute(
                    "UPDATE interventions SET status='applied', applied_at=?1 WHERE id=?2",
                    params![now, iv.id.0],
                )?;
                iv.status = InterventionStatus::Applied;
                iv.applied_at = Some(now);
            }
            Ok(pending)
        })
    }

    pub fn list_interventions(&self, worker_id: &WorkerId) -> StoreResult<Vec<Intervention>> {
        let sql = format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE worker_id=?1 ORDER BY created_at, rowid");
        query_all(&self.conn(), &sql, params![worker_id.0], intervention_from_row)
    }
}
