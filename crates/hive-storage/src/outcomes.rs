use hive_core::{now_ms, CapabilityReadiness, Intent, NewOutcome, Outcome, OutcomeId, OutcomeStatus};
use rusqlite::params;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::rows::{outcome_from_row, query_all, query_one, OUTCOME_COLUMNS};
use crate::store::SqliteStore;

impl SqliteStore {
    pub fn create_outcome(&self, new: NewOutcome) -> StoreResult<Outcome> {
        let now = now_ms();
        let outcome = Outcome {
            id: OutcomeId::new(),
            name: new.name,
            status: OutcomeStatus::Active,
            intent: Intent::parse(&new.intent_raw),
            capability_readiness: CapabilityReadiness::Unanalyzed,
            isolation: new.isolation,
            created_at: now,
            last_activity_at: now,
        };
        self.conn().execute(
            "INSERT INTO outcomes(id, name, status, intent, capability_readiness, git_mode, auto_commit, base_branch, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                outcome.id.0,
                outcome.name,
                outcome.status.as_str(),
                new.intent_raw,
                outcome.capability_readiness.level(),
                outcome.isolation.git_mode.as_str(),
                outcome.isolation.auto_commit as i64,
                outcome.isolation.base_branch,
                now,
                now
            ],
        )?;
        info!(outcome = %outcome.id, name = %outcome.name, "created outcome");
        Ok(outcome)
    }

    pub fn get_outcome(&self, id: &OutcomeId) -> StoreResult<Outcome> {
        let sql = format!("SELECT {OUTCOME_COLUMNS} FROM outcomes WHERE id=?1");
        query_one(&self.conn(), &sql, params![id.0], outcome_from_row)?
            .ok_or_else(|| StoreError::not_found("outcome", id.as_str()))
    }

    pub fn list_outcomes(&self) -> StoreResult<Vec<Outcome>> {
        let sql = format!("SELECT {OUTCOME_COLUMNS} FROM outcomes ORDER BY created_at, rowid");
        query_all(&self.conn(), &sql, [], outcome_from_row)
    }

    pub fn set_outcome_status(&self, id: &OutcomeId, status: OutcomeStatus) -> StoreResult<()> {
        let n = self.conn().execute(
            "UPDATE outcomes SET status=?1, last_activity_at=?2 WHERE id=?3",
            params![status.as_str(), now_ms(), id.0],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("outcome", id.as_str()));
        }
        Ok(())
    }

    /// Replace the intent document. Unversioned text is kept as legacy intent.
    pub fn set_outcome_intent(&self, id: &OutcomeId, intent_raw: &str) -> StoreResult<()> {
        let n = self.conn().execute(
            "UPDATE outcomes SET intent=?1, last_activity_at=?2 WHERE id=?3",
            params![intent_raw, now_ms(), id.0],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("outcome", id.as_str()));
        }
        Ok(())
    }

    pub fn touch_outcome(&self, id: &OutcomeId) -> StoreResult<()> {
        self.conn()
            .execute("UPDATE outcomes SET last_activity_at=?1 WHERE id=?2", params![now_ms(), id.0])?;
        Ok(())
    }

    pub fn set_capability_readiness(&self, id: &OutcomeId, readiness: CapabilityReadiness) -> StoreResult<()> {
        let n = self.conn().execute(
            "UPDATE outcomes SET capability_readiness=?1, last_activity_at=?2 WHERE id=?3",
            params![readiness.level(), now_ms(), id.0],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("outcome", id.as_str()));
        }
        info!(outcome = %id, readiness = ?readiness, "capability readiness changed");
        Ok(())
    }
}
