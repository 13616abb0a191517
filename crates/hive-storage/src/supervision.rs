use hive_core::*;
use rusqlite::params;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::rows::{
    alert_from_row, detection_from_row, query_all, query_one, snapshot_from_row, to_json, ALERT_COLUMNS,
    DETECTION_COLUMNS, SNAPSHOT_COLUMNS,
};
use crate::store::SqliteStore;

impl SqliteStore {
    /// Raise an alert unless an active one already exists for the same worker, kind and pattern.
    pub fn create_alert(&self, new: NewAlert) -> StoreResult<Option<SupervisorAlert>> {
        self.write_tx(|tx| {
            let dup: Option<String> = query_one(
                tx,
                "SELECT id FROM supervisor_alerts WHERE worker_id=?1 AND kind=?2 AND pattern=?3 AND status='active'",
                params![new.worker_id.0, new.kind.as_str(), new.pattern],
                |r| r.get(0),
            )?;
            if let Some(existing) = dup {
                debug!(worker = %new.worker_id, kind = %new.kind, existing = %existing, "alert already active");
                return Ok(None);
            }
            let alert = SupervisorAlert {
                id: AlertId::new(),
                worker_id: new.worker_id,
                outcome_id: new.outcome_id,
                kind: new.kind,
                pattern: new.pattern,
                severity: new.severity,
                message: new.message,
                auto_paused: new.auto_paused,
                status: AlertStatus::Active,
                created_at: now_ms(),
                resolved_at: None,
            };
            tx.execute(
                &format!("INSERT INTO supervisor_alerts({ALERT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, NULL)"),
                params![
                    alert.id.0,
                    alert.worker_id.0,
                    alert.outcome_id.0,
                    alert.kind.as_str(),
                    alert.pattern,
                    alert.severity.as_str(),
                    alert.message,
                    alert.auto_paused as i64,
                    alert.created_at
                ],
            )?;
            info!(alert = %alert.id, worker = %alert.worker_id, kind = %alert.kind, severity = %alert.severity, "supervisor alert");
            Ok(Some(alert))
        })
    }

    pub fn get_alert(&self, id: &AlertId) -> StoreResult<SupervisorAlert> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM supervisor_alerts WHERE id=?1");
        query_one(&self.conn(), &sql, params![id.0], alert_from_row)?
            .ok_or_else(|| StoreError::not_found("alert", id.as_str()))
    }

    pub fn list_alerts(&self, worker_id: Option<&WorkerId>, active_only: bool) -> StoreResult<Vec<SupervisorAlert>> {
        let status_clause = if active_only { "status='active'" } else { "1=1" };
        match worker_id {
            Some(w) => {
                let sql = format!(
                    "SELECT {ALERT_COLUMNS} FROM supervisor_alerts WHERE worker_id=?1 AND {status_clause} ORDER BY created_at, rowid"
                );
                query_all(&self.conn(), &sql, params![w.0], alert_from_row)
            }
            None => {
                let sql =
                    format!("SELECT {ALERT_COLUMNS} FROM supervisor_alerts WHERE {status_clause} ORDER BY created_at, rowid");
                query_all(&self.conn(), &sql, [], alert_from_row)
            }
        }
    }

    pub fn acknowledge_alert(&self, id: &AlertId) -> StoreResult<SupervisorAlert> {
        self.set_alert_status(id, AlertStatus::Acknowledged)
    }

    pub fn resolve_alert(&self, id: &AlertId) -> StoreResult<SupervisorAlert> {
        self.set_alert_status(id, AlertStatus::Resolved)
    }

    fn set_alert_status(&self, id: &AlertId, status: AlertStatus) -> StoreResult<SupervisorAlert> {
        let resolved_at = (status == AlertStatus::Resolved).then(now_ms);
        // Resolved is final.
        self.conn().execute(
            "UPDATE supervisor_alerts SET status=?1, resolved_at=COALESCE(?2, resolved_at)
             WHERE id=?3 AND status<>'resolved'",
            params![status.as_str(), resolved_at, id.0],
        )?;
        self.get_alert(id)
    }

    /// Resolve every open alert of a worker. Returns how many were closed.
    pub fn resolve_alerts_for_worker(&self, worker_id: &WorkerId) -> StoreResult<usize> {
        let n = self.conn().execute(
            "UPDATE supervisor_alerts SET status='resolved', resolved_at=?1
             WHERE worker_id=?2 AND status IN ('active', 'acknowledged')",
            params![now_ms(), worker_id.0],
        )?;
        if n > 0 {
            debug!(worker = %worker_id, resolved = n, "resolved worker alerts");
        }
        Ok(n)
    }

    pub fn record_detection(&self, d: &PatternDetection) -> StoreResult<()> {
        self.conn().execute(
            &format!("INSERT INTO pattern_detections({DETECTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                d.id.0,
                d.worker_id.0,
                d.pattern,
                d.severity.as_str(),
                d.action.as_str(),
                to_json(&d.paths),
                d.alert_id.as_ref().map(|a| a.0.clone()),
                d.created_at
            ],
        )?;
        Ok(())
    }

    pub fn list_detections(&self, worker_id: &WorkerId) -> StoreResult<Vec<PatternDetection>> {
        let sql = format!("SELECT {DETECTION_COLUMNS} FROM pattern_detections WHERE worker_id=?1 ORDER BY created_at, rowid");
        query_all(&self.conn(), &sql, params![worker_id.0], detection_from_row)
    }

    pub fn save_change_snapshot(&self, s: &ChangeSnapshot) -> StoreResult<()> {
        self.conn().execute(
            &format!("INSERT OR REPLACE INTO change_snapshots({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                s.id.0,
                s.worker_id.0,
                s.root,
                to_json(&s.created),
                to_json(&s.modified),
                to_json(&s.deleted),
                serde_json::to_string(&s.pre_images)?,
                s.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_change_snapshot(&self, id: &SnapshotId) -> StoreResult<ChangeSnapshot> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM change_snapshots WHERE id=?1");
        query_one(&self.conn(), &sql, params![id.0], snapshot_from_row)?
            .ok_or_else(|| StoreError::not_found("snapshot", id.as_str()))
    }

    pub fn latest_change_snapshot(&self, worker_id: &WorkerId) -> StoreResult<Option<ChangeSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM change_snapshots WHERE worker_id=?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        query_one(&self.conn(), &sql, params![worker_id.0], snapshot_from_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alert(w: &WorkerId, kind: AlertKind, pattern: &str) -> NewAlert {
        NewAlert {
            worker_id: w.clone(),
            outcome_id: OutcomeId::from_str("out_1"),
            kind,
            pattern: pattern.into(),
            severity: Severity::High,
            message: "m".into(),
            auto_paused: false,
        }
    }

    #[test]
    fn one_active_alert_per_worker_kind_and_pattern() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("hive.db")).unwrap();
        let w = WorkerId::from_str("wrk_1");

        let first = store.create_alert(alert(&w, AlertKind::Stuck, "")).unwrap().unwrap();
        assert!(store.create_alert(alert(&w, AlertKind::Stuck, "")).unwrap().is_none());
        assert!(store.create_alert(alert(&w, AlertKind::SuspiciousPattern, "env_secret_access")).unwrap().is_some());
        assert!(store.create_alert(alert(&w, AlertKind::SuspiciousPattern, "mass_deletion")).unwrap().is_some());
        assert_eq!(store.list_alerts(Some(&w), true).unwrap().len(), 3);

        let acked = store.acknowledge_alert(&first.id).unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(store.resolve_alerts_for_worker(&w).unwrap(), 3);
        assert!(store.list_alerts(Some(&w), true).unwrap().is_empty());
        assert!(store.get_alert(&first.id).unwrap().resolved_at.is_some());

        // Resolved alerts no longer block a new one.
        assert!(store.create_alert(alert(&w, AlertKind::Stuck, "")).unwrap().is_some());
    }

    #[test]
    fn snapshot_keeps_pre_images() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("hive.db")).unwrap();
        let mut snap = ChangeSnapshot {
            id: SnapshotId::new(),
            worker_id: WorkerId::from_str("wrk_1"),
            root: "/tmp/ws".into(),
            created: vec!["new.txt".into()],
            modified: vec!["a.txt".into()],
            deleted: vec![],
            created_at: now_ms(),
            ..Default::default()
        };
        snap.pre_images.insert("a.txt".into(), "old".into());
        store.save_change_snapshot(&snap).unwrap();
        assert_eq!(store.get_change_snapshot(&snap.id).unwrap(), snap);
        assert_eq!(store.latest_change_snapshot(&snap.worker_id).unwrap(), Some(snap));
    }
}
