use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hive_core::*;
use hive_storage::SqliteStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::patterns::{evaluate, FileChange, PatternContext, PatternMatch};
use crate::scan::{diff_states, read_text_baseline, scan_tree, FileState};

/// Force-stops a worker when a `pause` pattern fires.
pub trait PauseSink: Send + Sync {
    fn pause(&self, worker_id: &WorkerId, reason: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub sensitivity: Sensitivity,
    pub scan_interval_ms: u64,
    pub window_ms: i64,
    pub max_snapshot_file_bytes: u64,
    pub mass_deletion_threshold: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::Medium,
            scan_interval_ms: 1_000,
            window_ms: 5_000,
            max_snapshot_file_bytes: 100 * 1024,
            mass_deletion_threshold: 5,
        }
    }
}

/// One supervised session over a worker's working directory.
pub struct WorkspaceSupervisor {
    store: Arc<SqliteStore>,
    outcome_id: OutcomeId,
    worker_id: WorkerId,
    root: PathBuf,
    settings: SupervisorSettings,
    pause: Option<Arc<dyn PauseSink>>,
    baseline: BTreeMap<String, FileState>,
    pre_images: BTreeMap<String, String>,
    current: BTreeMap<String, FileState>,
    /// Changes inside the pattern window, oldest first.
    changes: VecDeque<FileChange>,
    reported: HashSet<(&'static str, Vec<String>)>,
    paused: bool,
}

impl WorkspaceSupervisor {
    /// Capture the baseline. Call before the worker's first task.
    pub fn start(
        store: Arc<SqliteStore>,
        outcome_id: OutcomeId,
        worker_id: WorkerId,
        root: &Path,
        settings: SupervisorSettings,
        pause: Option<Arc<dyn PauseSink>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let baseline = scan_tree(root, &BTreeMap::new())?;
        let pre_images = read_text_baseline(root, &baseline, settings.max_snapshot_file_bytes);
        info!(worker = %worker_id, root = %root.display(), files = baseline.len(), "supervisor started");
        Ok(Self {
            store,
            outcome_id,
            worker_id,
            root: root.to_path_buf(),
            settings,
            pause,
            current: baseline.clone(),
            baseline,
            pre_images,
            changes: VecDeque::new(),
            reported: HashSet::new(),
            paused: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Changes still inside the pattern window, oldest first.
    pub fn changes(&self) -> impl Iterator<Item = &FileChange> {
        self.changes.iter()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn poll(&mut self) -> Result<Vec<PatternMatch>> {
        self.poll_at(now_ms())
    }

    /// Rescan, buffer the changes and evaluate the pattern list over the window ending at `now`.
    pub fn poll_at(&mut self, now: EpochMs) -> Result<Vec<PatternMatch>> {
        let next = scan_tree(&self.root, &self.current)?;
        let diff = diff_states(&self.current, &next);
        self.current = next;
        if diff.is_empty() {
            return Ok(vec![]);
        }
        for (path, kind) in diff {
            debug!(worker = %self.worker_id, path = %path, kind = %kind, "change");
            self.changes.push_back(FileChange { path, kind, at: now });
        }

        let since = now - self.settings.window_ms;
        while self.changes.front().is_some_and(|c| c.at < since) {
            self.changes.pop_front();
        }
        let window: Vec<FileChange> = self.changes.iter().cloned().collect();
        let ctx = PatternContext {
            root: &self.root,
            changes: &window,
            pre_images: &self.pre_images,
            mass_deletion_threshold: self.settings.mass_deletion_threshold,
        };
        let matches = evaluate(&ctx, self.settings.sensitivity);

        let mut fired = Vec::new();
        for m in matches {
            if !self.reported.insert((m.pattern, m.paths.clone())) {
                continue;
            }
            self.act(&m)?;
            fired.push(m);
        }
        Ok(fired)
    }

    fn act(&mut self, m: &PatternMatch) -> Result<()> {
        let message = format!("{}: {}", m.pattern, m.paths.join(", "));
        let alert_id = match m.action {
            PatternAction::Log => {
                info!(worker = %self.worker_id, pattern = m.pattern, paths = ?m.paths, "pattern logged");
                None
            }
            PatternAction::Alert | PatternAction::Pause => {
                warn!(worker = %self.worker_id, pattern = m.pattern, severity = %m.severity, paths = ?m.paths, "suspicious pattern");
                self.store
                    .create_alert(NewAlert {
                        worker_id: self.worker_id.clone(),
                        outcome_id: self.outcome_id.clone(),
                        kind: AlertKind::SuspiciousPattern,
                        pattern: m.pattern.to_string(),
                        severity: m.severity,
                        message: message.clone(),
                        auto_paused: m.action == PatternAction::Pause,
                    })?
                    .map(|a| a.id)
            }
        };
        self.store.record_detection(&PatternDetection {
            id: DetectionId::new(),
            worker_id: self.worker_id.clone(),
            pattern: m.pattern.to_string(),
            severity: m.severity,
            action: m.action,
            paths: m.paths.clone(),
            alert_id,
            created_at: now_ms(),
        })?;

        if m.action == PatternAction::Pause && !self.paused {
            self.paused = true;
            match &self.pause {
                Some(sink) => {
                    if let Err(e) = sink.pause(&self.worker_id, &message) {
                        warn!(worker = %self.worker_id, error = %e, "pause hook failed");
                    }
                }
                None => warn!(worker = %self.worker_id, "pause requested but no pause hook is installed"),
            }
        }
        Ok(())
    }

    /// Net change since start, with pre-images for everything modified or deleted.
    pub fn snapshot(&self) -> ChangeSnapshot {
        let mut snap = ChangeSnapshot {
            id: SnapshotId::new(),
            worker_id: self.worker_id.clone(),
            root: self.root.display().to_string(),
            created_at: now_ms(),
            ..Default::default()
        };
        for (path, kind) in diff_states(&self.baseline, &self.current) {
            match kind {
                ChangeKind::Created => snap.created.push(path),
                ChangeKind::Modified => snap.modified.push(path),
                ChangeKind::Deleted => snap.deleted.push(path),
            }
        }
        for path in snap.modified.iter().chain(&snap.deleted) {
            if let Some(text) = self.pre_images.get(path) {
                snap.pre_images.insert(path.clone(), text.clone());
            }
        }
        snap
    }

    /// Final scan, then persist the change snapshot.
    pub fn stop(mut self) -> Result<ChangeSnapshot> {
        if let Err(e) = self.poll() {
            warn!(worker = %self.worker_id, error = %e, "final scan failed");
        }
        let snapshot = self.snapshot();
        self.store.save_change_snapshot(&snapshot)?;
        info!(
            worker = %self.worker_id,
            snapshot = %snapshot.id,
            created = snapshot.created.len(),
            modified = snapshot.modified.len(),
            deleted = snapshot.deleted.len(),
            "supervisor stopped"
        );
        Ok(snapshot)
    }
}

/// Poll `session` on its scan interval until `stop` flips to true, then stop it.
pub fn spawn_watch(mut session: WorkspaceSupervisor, mut stop: watch::Receiver<bool>) -> JoinHandle<Result<ChangeSnapshot>> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(session.settings.scan_interval_ms.max(50)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {
                    let (s, res) = tokio::task::spawn_blocking(move || {
                        let res = session.poll();
                        (session, res)
                    })
                    .await?;
                    session = s;
                    if let Err(e) = res {
                        warn!(error = %e, "supervisor scan failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tokio::task::spawn_blocking(move || session.stop()).await?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingPause(Mutex<Vec<String>>);

    impl PauseSink for RecordingPause {
        fn pause(&self, worker_id: &WorkerId, reason: &str) -> Result<()> {
            self.0.lock().unwrap().push(format!("{worker_id}: {reason}"));
            Ok(())
        }
    }

    fn fixture(sensitivity: Sensitivity) -> (tempfile::TempDir, Arc<SqliteStore>, Worker, SupervisorSettings) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("hive.db")).unwrap());
        let outcome = store.create_outcome(NewOutcome { name: "o".into(), ..Default::default() }).unwrap();
        let worker = store.register_worker(&outcome.id, TaskPhase::Execution).unwrap();
        let settings = SupervisorSettings { sensitivity, ..Default::default() };
        (dir, store, worker, settings)
    }

    #[test]
    fn sensitivity_gates_test_file_alerts() {
        for (sensitivity, expected) in [(Sensitivity::Low, 0), (Sensitivity::High, 1)] {
            let (dir, store, worker, settings) = fixture(sensitivity);
            let ws = dir.path().join("ws");
            std::fs::create_dir_all(ws.join("src")).unwrap();
            std::fs::write(ws.join("src/a.test.ts"), "it('works')").unwrap();

            let mut sup = WorkspaceSupervisor::start(store.clone(), worker.outcome_id.clone(), worker.id.clone(), &ws, settings, None).unwrap();
            std::fs::write(ws.join("src/a.test.ts"), "it.skip('works', () => {})").unwrap();
            sup.poll().unwrap();

            let alerts = store.list_alerts(Some(&worker.id), true).unwrap();
            assert_eq!(alerts.len(), expected, "{sensitivity}");
            if let Some(a) = alerts.first() {
                assert_eq!(a.kind, AlertKind::SuspiciousPattern);
                assert_eq!(a.pattern, "test_file_modification");
                assert_eq!(a.severity, Severity::Medium);
                assert!(!a.auto_paused);
            }
        }
    }

    #[test]
    fn mass_deletion_pauses_the_worker_once() {
        let (dir, store, worker, settings) = fixture(Sensitivity::Low);
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        for i in 0..8 {
            std::fs::write(ws.join(format!("f{i}.txt")), format!("file {i}")).unwrap();
        }
        let sink = Arc::new(RecordingPause::default());
        let mut sup = WorkspaceSupervisor::start(
            store.clone(),
            worker.outcome_id.clone(),
            worker.id.clone(),
            &ws,
            settings,
            Some(sink.clone() as Arc<dyn PauseSink>),
        )
        .unwrap();

        for i in 0..6 {
            std::fs::remove_file(ws.join(format!("f{i}.txt"))).unwrap();
        }
        let fired = sup.poll_at(10_000).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].pattern, "mass_deletion");
        assert!(sup.is_paused());

        // Another deletion inside the window widens the match but does not pause again.
        std::fs::remove_file(ws.join("f6.txt")).unwrap();
        sup.poll_at(11_000).unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);

        let alerts = store.list_alerts(Some(&worker.id), true).unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].auto_paused);
        assert_eq!(store.list_detections(&worker.id).unwrap().len(), 2);
    }

    #[test]
    fn changes_outside_the_window_do_not_accumulate() {
        let (dir, store, worker, settings) = fixture(Sensitivity::Low);
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        for i in 0..6 {
            std::fs::write(ws.join(format!("f{i}.txt")), "x").unwrap();
        }
        let mut sup = WorkspaceSupervisor::start(store, worker.outcome_id, worker.id, &ws, settings, None).unwrap();
        for i in 0..3 {
            std::fs::remove_file(ws.join(format!("f{i}.txt"))).unwrap();
        }
        assert!(sup.poll_at(1_000).unwrap().is_empty());
        for i in 3..6 {
            std::fs::remove_file(ws.join(format!("f{i}.txt"))).unwrap();
        }
        assert!(sup.poll_at(20_000).unwrap().is_empty());
        let kept: Vec<&str> = sup.changes().map(|c| c.path.as_str()).collect();
        assert_eq!(kept, vec!["f3.txt", "f4.txt", "f5.txt"]);
    }

    #[test]
    fn stop_persists_net_changes_with_pre_images() {
        let (dir, store, worker, settings) = fixture(Sensitivity::Medium);
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("keep.txt"), "same").unwrap();
        std::fs::write(ws.join("edit.txt"), "before").unwrap();
        std::fs::write(ws.join("drop.txt"), "doomed").unwrap();

        let sup = WorkspaceSupervisor::start(store.clone(), worker.outcome_id.clone(), worker.id.clone(), &ws, settings, None).unwrap();
        std::fs::write(ws.join("edit.txt"), "after, longer").unwrap();
        std::fs::remove_file(ws.join("drop.txt")).unwrap();
        std::fs::write(ws.join("new.txt"), "fresh").unwrap();
        let snap = sup.stop().unwrap();

        assert_eq!(snap.created, vec!["new.txt"]);
        assert_eq!(snap.modified, vec!["edit.txt"]);
        assert_eq!(snap.deleted, vec!["drop.txt"]);
        assert_eq!(snap.pre_images.get("edit.txt").map(String::as_str), Some("before"));
        assert_eq!(snap.pre_images.get("drop.txt").map(String::as_str), Some("doomed"));
        assert_eq!(store.latest_change_snapshot(&worker.id).unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn watch_task_stops_on_signal() {
        let (dir, store, worker, mut settings) = fixture(Sensitivity::Medium);
        settings.scan_interval_ms = 50;
        let ws = dir.path().join("ws");
        let sup = WorkspaceSupervisor::start(store, worker.outcome_id, worker.id, &ws, settings, None).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_watch(sup, rx);

        tokio::fs::write(ws.join("notes.md"), "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        let snap = handle.await.unwrap().unwrap();
        assert_eq!(snap.created, vec!["notes.md"]);
    }
}
