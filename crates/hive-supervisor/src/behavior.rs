use std::sync::Arc;

use hive_core::*;
use hive_storage::{SqliteStore, StoreResult};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct BehaviorSettings {
    pub stuck_after_ms: i64,
    pub no_progress_after_ms: i64,
    pub repeated_error_threshold: u32,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self { stuck_after_ms: 10 * 60_000, no_progress_after_ms: 5 * 60_000, repeated_error_threshold: 3 }
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub raised: Vec<SupervisorAlert>,
    pub resolved: usize,
    /// Workers that were sent a pause intervention this tick.
    pub paused: Vec<WorkerId>,
}

/// Coarse detector over worker rows, run on a global timer.
#[derive(Clone)]
pub struct BehaviorDetector {
    store: Arc<SqliteStore>,
    settings: BehaviorSettings,
}

impl BehaviorDetector {
    pub fn new(store: Arc<SqliteStore>, settings: BehaviorSettings) -> Self {
        Self { store, settings }
    }

    pub fn tick(&self) -> StoreResult<TickReport> {
        self.tick_at(now_ms())
    }

    pub fn tick_at(&self, now: EpochMs) -> StoreResult<TickReport> {
        let mut report = TickReport::default();
        for worker in self.store.list_workers(None)? {
            if worker.status != WorkerStatus::Running {
                if !self.store.list_alerts(Some(&worker.id), true)?.is_empty() {
                    report.resolved += self.store.resolve_alerts_for_worker(&worker.id)?;
                }
                continue;
            }
            self.check_stuck(&worker, now, &mut report)?;
            self.check_progress(&worker, now, &mut report)?;
            self.check_errors(&worker, &mut report)?;
        }
        if !report.raised.is_empty() || report.resolved > 0 {
            info!(raised = report.raised.len(), resolved = report.resolved, "behavior tick");
        }
        Ok(report)
    }

    fn raise(
        &self,
        worker: &Worker,
        kind: AlertKind,
        severity: Severity,
        message: String,
        auto_paused: bool,
        report: &mut TickReport,
    ) -> StoreResult<bool> {
        let created = self.store.create_alert(NewAlert {
            worker_id: worker.id.clone(),
            outcome_id: worker.outcome_id.clone(),
            kind,
            pattern: String::new(),
            severity,
            message,
            auto_paused,
        })?;
        match created {
            Some(alert) => {
                warn!(worker = %worker.id, kind = %kind, message = %alert.message, "worker alert");
                report.raised.push(alert);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn check_stuck(&self, worker: &Worker, now: EpochMs, report: &mut TickReport) -> StoreResult<()> {
        let Some(task_id) = &worker.current_task_id else { return Ok(()) };
        let task = match self.store.get_task(task_id) {
            Ok(t) => t,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let idle = now - task.updated_at;
        if task.status.is_owned() && idle > self.settings.stuck_after_ms {
            let message = format!("task {} has been {} for {} min", task.id, task.status, idle / 60_000);
            self.raise(worker, AlertKind::Stuck, Severity::High, message, false, report)?;
        }
        Ok(())
    }

    fn check_progress(&self, worker: &Worker, now: EpochMs, report: &mut TickReport) -> StoreResult<()> {
        let last = self.store.last_progress_at(&worker.id)?.unwrap_or(worker.created_at);
        let quiet = now - last;
        if quiet > self.settings.no_progress_after_ms {
            let message = format!("no progress entry for {} min", quiet / 60_000);
            self.raise(worker, AlertKind::NoProgress, Severity::Medium, message, false, report)?;
        }
        Ok(())
    }

    fn check_errors(&self, worker: &Worker, report: &mut TickReport) -> StoreResult<()> {
        if worker.consecutive_failures < self.settings.repeated_error_threshold {
            return Ok(());
        }
        let message = format!("{} consecutive failed tasks", worker.consecutive_failures);
        if self.raise(worker, AlertKind::RepeatedErrors, Severity::High, message.clone(), true, report)? {
            self.store.queue_intervention(&worker.outcome_id, &worker.id, InterventionKind::Pause, &message)?;
            report.paused.push(worker.id.clone());
        }
        Ok(())
    }
}
