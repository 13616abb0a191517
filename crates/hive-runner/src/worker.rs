use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hive_core::*;
use hive_decompose::{DecomposeOutcome, Decomposer};
use hive_storage::{SqliteStore, StoreError, StoreResult};
use hive_supervisor::{spawn_watch, PauseSink, WorkspaceSupervisor};
use hive_vcs_git::{MergeQueue, WorktreeHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::{run_agent, AgentOutcome, AgentReport, AgentRun};
use crate::config::Config;
use crate::registry::{Control, WorkerRegistry};
use crate::workspace::{outcome_dir, prepare_task_dir, skills_dir, Instructions};

/// Shared by every worker loop of one orchestrator.
pub struct WorkerContext {
    pub store: Arc<SqliteStore>,
    pub config: Arc<Config>,
    pub workspace_root: PathBuf,
    pub decomposer: Decomposer,
    /// Present when the repo root is a git repository.
    pub merges: Option<Arc<MergeQueue>>,
    pub registry: WorkerRegistry,
    pub pause: Arc<dyn PauseSink>,
}

pub struct WorkerSpec {
    pub outcome: Outcome,
    pub worker: Worker,
    pub phase: TaskPhase,
    pub skill_context: Arc<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// No eligible work left in the phase.
    Drained,
    Paused,
    Stopped,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct WorkerSummary {
    pub worker_id: WorkerId,
    pub phase: TaskPhase,
    pub exit: LoopExit,
    pub completed: u32,
    pub failed: u32,
    pub snapshot: Option<SnapshotId>,
    pub merge: Option<MergeQueueEntry>,
}

/// Run a registered worker until it drains its phase or is told to stop.
pub async fn run_worker(ctx: Arc<WorkerContext>, spec: WorkerSpec, control: watch::Receiver<Control>) -> WorkerSummary {
    let span = info_span!("worker", worker = %spec.worker.id, phase = %spec.phase);
    async move {
        let mut summary = WorkerSummary {
            worker_id: spec.worker.id.clone(),
            phase: spec.phase,
            exit: LoopExit::Drained,
            completed: 0,
            failed: 0,
            snapshot: None,
            merge: None,
        };
        match WorkerLoop::setup(ctx.clone(), spec, control).await {
            Ok(mut lp) => {
                let exit = match lp.run(&mut summary).await {
                    Ok(exit) => exit,
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "worker loop failed");
                        LoopExit::Failed(format!("{e:#}"))
                    }
                };
                summary.exit = exit;
                lp.teardown(&mut summary).await;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "worker setup failed");
                summary.exit = LoopExit::Failed(format!("{e:#}"));
                if let Err(e) = ctx.store.set_worker_status(&summary.worker_id, WorkerStatus::Failed) {
                    warn!(error = %e, "could not mark worker failed");
                }
                ctx.registry.remove(&summary.worker_id);
            }
        }
        info!(exit = ?summary.exit, completed = summary.completed, failed = summary.failed, "worker finished");
        summary
    }
    .instrument(span)
    .await
}

struct WorkerLoop {
    ctx: Arc<WorkerContext>,
    spec: WorkerSpec,
    control: watch::Receiver<Control>,
    outcome_dir: PathBuf,
    skills_dir: PathBuf,
    workdir: PathBuf,
    worktree: Option<WorktreeHandle>,
    notes: Vec<String>,
    heartbeat: (watch::Sender<bool>, JoinHandle<()>),
    supervisor: Option<(watch::Sender<bool>, JoinHandle<Result<ChangeSnapshot>>)>,
}

fn spawn_heartbeat(store: Arc<SqliteStore>, worker_id: WorkerId, every: Duration) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (tx, mut stop) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => match store.heartbeat(&worker_id) {
                    Ok(true) => debug!(worker = %worker_id, "heartbeat"),
                    Ok(false) => debug!(worker = %worker_id, "worker not running, heartbeat skipped"),
                    Err(e) => warn!(worker = %worker_id, error = %e, "heartbeat failed"),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    });
    (tx, handle)
}

/// Keep at most `max` bytes from the end of `s`.
fn tail_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut i = s.len() - max;
    while !s.is_char_boundary(i) {
        i += 1;
    }
    &s[i..]
}

/// A transition lost to a concurrent sweep is logged, not fatal.
fn absorb_lost<T>(res: StoreResult<T>, task_id: &TaskId, what: &str) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(StoreError::InvalidTransition { from, .. }) => {
            warn!(task = %task_id, from = %from, "could not {what}: task was reclaimed");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

impl WorkerLoop {
    async fn setup(ctx: Arc<WorkerContext>, spec: WorkerSpec, control: watch::Receiver<Control>) -> Result<Self> {
        let store = ctx.store.clone();
        let worker_id = spec.worker.id.clone();
        store.set_worker_phase(&worker_id, spec.phase)?;
        store.set_worker_status(&worker_id, WorkerStatus::Running)?;
        store.heartbeat(&worker_id)?;

        let outcome_dir = outcome_dir(&ctx.workspace_root, &spec.outcome);
        let skills_dir = skills_dir(&ctx.workspace_root, &spec.outcome);
        std::fs::create_dir_all(&skills_dir).with_context(|| format!("create {}", skills_dir.display()))?;

        let mut worktree = None;
        if spec.outcome.isolation.git_mode != GitMode::None {
            match &ctx.merges {
                Some(merges) => {
                    let git = merges.git().clone();
                    let (outcome_id, wid) = (spec.outcome.id.clone(), worker_id.clone());
                    let base = spec.outcome.isolation.base_branch.clone();
                    let handle = tokio::task::spawn_blocking(move || git.create_worktree(&outcome_id, &wid, base.as_deref()))
                        .await??;
                    store.set_worker_worktree(&worker_id, &handle.path.display().to_string(), &handle.branch)?;
                    worktree = Some(handle);
                }
                None => warn!("isolation requested but the repo root is not a git repository"),
            }
        }
        let workdir = worktree.as_ref().map(|w| w.path.clone()).unwrap_or_else(|| outcome_dir.clone());

        let heartbeat = spawn_heartbeat(
            store.clone(),
            worker_id.clone(),
            Duration::from_secs(ctx.config.workers.heartbeat_interval_secs.max(1)),
        );

        let supervisor = {
            let (store, outcome_id, wid, root) =
                (store.clone(), spec.outcome.id.clone(), worker_id.clone(), workdir.clone());
            let settings = ctx.config.supervisor_settings();
            let pause = ctx.pause.clone();
            let started = tokio::task::spawn_blocking(move || {
                WorkspaceSupervisor::start(store, outcome_id, wid, &root, settings, Some(pause))
            })
            .await?;
            match started {
                Ok(session) => {
                    let (tx, rx) = watch::channel(false);
                    Some((tx, spawn_watch(session, rx)))
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "supervisor unavailable, continuing unsupervised");
                    None
                }
            }
        };

        info!(workdir = %workdir.display(), isolated = worktree.is_some(), "worker started");
        Ok(Self { ctx, spec, control, outcome_dir, skills_dir, workdir, worktree, notes: Vec::new(), heartbeat, supervisor })
    }

    fn store(&self) -> &SqliteStore {
        &self.ctx.store
    }

    fn worker_id(&self) -> &WorkerId {
        &self.spec.worker.id
    }

    fn requested_exit(&self) -> Option<LoopExit> {
        match *self.control.borrow() {
            Control::Run => None,
            Control::Pause => Some(LoopExit::Paused),
            Control::Stop => Some(LoopExit::Stopped),
        }
    }

    async fn run(&mut self, summary: &mut WorkerSummary) -> Result<LoopExit> {
        loop {
            if let Some(exit) = self.requested_exit() {
                return Ok(exit);
            }
            if self.apply_interventions()? {
                return Ok(LoopExit::Paused);
            }

            let task = match self.store().claim_next_task(&self.spec.outcome.id, self.worker_id(), Some(self.spec.phase))? {
                ClaimOutcome::Claimed(t) => t,
                ClaimOutcome::Unavailable(_) => continue,
                ClaimOutcome::NoEligibleTask => {
                    if self.phase_drained()? {
                        return Ok(LoopExit::Drained);
                    }
                    self.idle().await;
                    continue;
                }
            };
            info!(task = %task.id, title = %task.title, "claimed task");

            let Some(task) = self.maybe_decompose(task).await? else { continue };
            let Some(task) = self.store().start_task(&task.id)? else {
                warn!(task = %task.id, "task left claimed state before start");
                continue;
            };
            let iteration = self.store().begin_iteration(self.worker_id())?;
            if let Some(exit) = self.execute(iteration, task, summary).await? {
                return Ok(exit);
            }
        }
    }

    /// Drain queued commands. Pause wins; everything else becomes a note for the next task.
    fn apply_interventions(&mut self) -> Result<bool> {
        let mut pause = false;
        for iv in self.store().drain_interventions(self.worker_id())? {
            info!(kind = %iv.kind, message = %iv.message, "intervention");
            match iv.kind {
                InterventionKind::Pause => pause = true,
                kind => self.notes.push(format!("{kind}: {}", iv.message)),
            }
        }
        Ok(pause)
    }

    /// True when nothing in this phase is owned and no pending task is eligible.
    fn phase_drained(&self) -> Result<bool> {
        let tasks = self.store().get_tasks_by_outcome(&self.spec.outcome.id)?;
        let statuses: HashMap<TaskId, TaskStatus> = tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
        let mut blocked = 0usize;
        for t in tasks.iter().filter(|t| t.phase == self.spec.phase) {
            if t.status.is_owned() || task_is_claimable(t, &statuses, Some(self.spec.phase)) {
                return Ok(false);
            }
            if t.status == TaskStatus::Pending {
                blocked += 1;
            }
        }
        if blocked > 0 {
            warn!(blocked, "pending tasks are blocked on dependencies that will not complete");
        }
        Ok(true)
    }

    async fn idle(&mut self) {
        let wait = Duration::from_millis(self.ctx.config.workers.idle_poll_ms.max(10));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.control.changed() => {}
        }
    }

    /// Returns the task to execute, or `None` when it was split or handed back.
    async fn maybe_decompose(&mut self, task: Task) -> Result<Option<Task>> {
        let decomposer: Decomposer = self.ctx.decomposer.clone();
        let context = self.spec.skill_context.clone();
        let t = task.clone();
        let result = tokio::task::spawn_blocking(move || decomposer.decompose_if_needed(&t, &context)).await?;
        match result {
            Ok(DecomposeOutcome::NotNeeded(_)) => Ok(Some(self.store().get_task(&task.id)?)),
            Ok(DecomposeOutcome::Created(subs) | DecomposeOutcome::Existing(subs)) => {
                info!(task = %task.id, subtasks = subs.len(), "task decomposed");
                self.release_if_owned(&task.id)?;
                Ok(None)
            }
            Ok(DecomposeOutcome::InProgress) => {
                debug!(task = %task.id, "decomposition in progress elsewhere");
                self.store().release_task(&task.id)?;
                Ok(None)
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "decomposition failed");
                let fresh = self.store().get_task(&task.id)?;
                let ours = fresh.status == TaskStatus::Claimed && fresh.claimed_by.as_ref() == Some(self.worker_id());
                Ok(ours.then_some(fresh))
            }
        }
    }

    fn release_if_owned(&self, task_id: &TaskId) -> Result<()> {
        let task = self.store().get_task(task_id)?;
        if task.status.is_owned() && task.claimed_by.as_ref() == Some(self.worker_id()) {
            self.store().release_task(task_id)?;
        }
        Ok(())
    }

    fn max_turns(&self, task: &Task) -> u32 {
        let cap = if task.is_subtask() { self.ctx.config.agent.subtask_max_turns } else { self.ctx.config.agent.max_turns };
        task.estimated_turns.map_or(cap, |t| t.clamp(1, cap.max(1)))
    }

    async fn execute(&mut self, iteration: u32, task: Task, summary: &mut WorkerSummary) -> Result<Option<LoopExit>> {
        let notes = std::mem::take(&mut self.notes);
        let instructions = Instructions {
            skill_context: &self.spec.skill_context,
            notes: &notes,
            working_dir: self.worktree.as_ref().map(|w| w.path.as_path()),
            skills_dir: Some(self.skills_dir.as_path()),
        };
        let task_dir = prepare_task_dir(&self.outcome_dir, &self.spec.outcome, &task, &instructions)?;
        let cwd = if self.worktree.is_some() { self.workdir.clone() } else { task_dir.path.clone() };
        let env = vec![
            ("HIVE_WORKER_ID".to_string(), self.worker_id().to_string()),
            ("HIVE_OUTCOME_ID".to_string(), self.spec.outcome.id.to_string()),
            ("HIVE_TASK_ID".to_string(), task.id.to_string()),
            ("HIVE_SKILLS_DIR".to_string(), self.skills_dir.display().to_string()),
        ];

        let spec = self.ctx.config.agent_spec();
        let run = AgentRun { cwd: &cwd, task_dir: &task_dir, max_turns: self.max_turns(&task), env };
        let (store, wid) = (self.ctx.store.clone(), self.worker_id().clone());
        let on_spawn = move |pid: Option<u32>| {
            if let Err(e) = store.set_worker_pid(&wid, pid) {
                warn!(error = %e, "could not record agent pid");
            }
        };
        let result = run_agent(&spec, run, self.control.clone(), on_spawn).await;
        self.store().set_worker_pid(self.worker_id(), None)?;

        let report = match result {
            Ok(r) => r,
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(task = %task.id, error = %reason, "agent did not start");
                self.append_progress(iteration, &task, &format!("{}: agent did not start: {reason}", task.title), None)?;
                absorb_lost(self.store().fail_task(&task.id, &reason), &task.id, "fail")?;
                self.store().record_task_result(self.worker_id(), TaskVerdict::Failed, 0.0)?;
                summary.failed += 1;
                return Ok(None);
            }
        };

        // Output is persisted before the task changes hands.
        self.record_progress(iteration, &task, &report)?;
        let cost = report.sentinel.cost;
        match &report.outcome {
            AgentOutcome::Succeeded { via } => {
                if absorb_lost(self.store().complete_task(&task.id), &task.id, "complete")?.is_some() {
                    info!(task = %task.id, via = ?via, "task completed");
                    summary.completed += 1;
                    self.auto_commit(&task).await;
                }
                self.store().record_task_result(self.worker_id(), TaskVerdict::Succeeded, cost)?;
            }
            AgentOutcome::Failed { reason, .. } => {
                let error = format!("{reason}\n{}", tail_str(&report.output, 2_000));
                self.fail(&task, &error, cost, summary)?;
            }
            AgentOutcome::TimedOut => {
                let error = format!("timed out after {}s\n{}", spec.timeout.as_secs(), tail_str(&report.output, 2_000));
                self.fail(&task, &error, cost, summary)?;
            }
            AgentOutcome::Stopped(control) => {
                info!(task = %task.id, control = ?control, "task interrupted, releasing");
                self.store().release_task(&task.id)?;
                self.store().record_task_result(self.worker_id(), TaskVerdict::Interrupted, cost)?;
                return Ok(Some(match control {
                    Control::Pause => LoopExit::Paused,
                    _ => LoopExit::Stopped,
                }));
            }
        }
        Ok(None)
    }

    fn fail(&self, task: &Task, error: &str, cost: f64, summary: &mut WorkerSummary) -> Result<()> {
        if let Some(t) = absorb_lost(self.store().fail_task(&task.id, error), &task.id, "fail")? {
            warn!(task = %t.id, status = %t.status, attempts = t.attempts, "task failed");
        }
        let streak = self.store().record_task_result(self.worker_id(), TaskVerdict::Failed, cost)?;
        debug!(streak, "failure streak");
        summary.failed += 1;
        Ok(())
    }

    fn append_progress(&self, iteration: u32, task: &Task, content: &str, full_output: Option<String>) -> Result<()> {
        self.store().append_progress(NewProgress {
            outcome_id: self.spec.outcome.id.clone(),
            worker_id: self.worker_id().clone(),
            iteration,
            task_id: Some(task.id.clone()),
            content: content.to_string(),
            full_output,
        })?;
        Ok(())
    }

    fn record_progress(&self, iteration: u32, task: &Task, report: &AgentReport) -> Result<()> {
        let verdict = match &report.outcome {
            AgentOutcome::Succeeded { .. } => "done".to_string(),
            AgentOutcome::Failed { reason, .. } => format!("failed: {reason}"),
            AgentOutcome::TimedOut => "timed out".to_string(),
            AgentOutcome::Stopped(c) => format!("interrupted ({c:?})"),
        };
        let mut content = format!("{}: {verdict}", task.title);
        if let Some(status) = &report.sentinel.status {
            content.push_str(&format!(" [{status}]"));
        }
        let mut output = report.output.clone();
        if report.truncated {
            output.insert_str(0, "[output truncated]\n");
        }
        self.append_progress(iteration, task, &content, Some(output))
    }

    async fn auto_commit(&self, task: &Task) {
        let (Some(wt), Some(merges)) = (&self.worktree, &self.ctx.merges) else { return };
        if !self.spec.outcome.isolation.auto_commit {
            return;
        }
        let git = merges.git().clone();
        let path = wt.path.clone();
        let message = format!("hive: {} ({})", task.title, task.id);
        match tokio::task::spawn_blocking(move || git.commit_all(&path, &message)).await {
            Ok(Ok(Some(sha))) => info!(task = %task.id, commit = %sha, "committed task changes"),
            Ok(Ok(None)) => debug!(task = %task.id, "nothing to commit"),
            Ok(Err(e)) => warn!(task = %task.id, error = %format!("{e:#}"), "auto-commit failed"),
            Err(e) => warn!(task = %task.id, error = %e, "auto-commit task panicked"),
        }
    }

    async fn teardown(self, summary: &mut WorkerSummary) {
        let WorkerLoop { ctx, spec, heartbeat, supervisor, worktree, .. } = self;
        let store = &ctx.store;
        let worker_id = &spec.worker.id;

        let (hb_tx, hb_handle) = heartbeat;
        let _ = hb_tx.send(true);
        let _ = hb_handle.await;

        // Nothing stays claimed by a worker that is leaving.
        match store.get_worker(worker_id) {
            Ok(w) => {
                if let Some(task_id) = w.current_task_id {
                    match store.release_task(&task_id) {
                        Ok(Some(_)) => info!(task = %task_id, "released task on exit"),
                        Ok(None) => {}
                        Err(e) => warn!(task = %task_id, error = %e, "could not release task"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not reload worker"),
        }

        if let Some((tx, handle)) = supervisor {
            let _ = tx.send(true);
            match handle.await {
                Ok(Ok(snap)) => summary.snapshot = Some(snap.id),
                Ok(Err(e)) => warn!(error = %format!("{e:#}"), "supervisor stop failed"),
                Err(e) => warn!(error = %e, "supervisor task panicked"),
            }
        }

        let status = match summary.exit {
            LoopExit::Drained => WorkerStatus::Completed,
            LoopExit::Paused | LoopExit::Stopped => WorkerStatus::Paused,
            LoopExit::Failed(_) => WorkerStatus::Failed,
        };
        if let Err(e) = store.set_worker_status(worker_id, status) {
            warn!(error = %e, "could not record final worker status");
        }
        if let Err(e) = store.resolve_alerts_for_worker(worker_id) {
            warn!(error = %e, "could not resolve worker alerts");
        }

        let should_merge = ctx.config.git.auto_merge && summary.exit == LoopExit::Drained && summary.completed > 0;
        if let (Some(_), Some(merges), true) = (&worktree, &ctx.merges, should_merge) {
            let (merges, outcome_id, wid) = (merges.clone(), spec.outcome.id.clone(), worker_id.clone());
            let remove = ctx.config.git.remove_worktree_after_merge;
            let merged = tokio::task::spawn_blocking(move || -> Result<MergeQueueEntry> {
                let entry = merges.queue_merge(&outcome_id, &wid)?;
                if entry.status == MergeStatus::Completed && remove {
                    merges.git().remove_worktree(&outcome_id, &wid, true)?;
                }
                Ok(entry)
            })
            .await;
            match merged {
                Ok(Ok(entry)) => summary.merge = Some(entry),
                Ok(Err(e)) => warn!(error = %format!("{e:#}"), "merge failed"),
                Err(e) => warn!(error = %e, "merge task panicked"),
            }
        }

        ctx.registry.remove(worker_id);
    }
}
