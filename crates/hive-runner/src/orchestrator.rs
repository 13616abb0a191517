use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hive_core::*;
use hive_decompose::{AgentCliReasoner, DecomposeOutcome, Decomposer, Reasoner};
use hive_storage::SqliteStore;
use hive_supervisor::{rollback, BehaviorDetector, PauseSink, RollbackReport, TickReport};
use hive_vcs_git::{GitWorktrees, MergeQueue};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::import::{parse_import, plan_import};
use crate::registry::{Control, WorkerRegistry};
use crate::skills::{missing_skills, skill_context, validate_skills_dir};
use crate::worker::{run_worker, LoopExit, WorkerContext, WorkerSpec, WorkerSummary};
use crate::workspace::{outcome_dir, skills_dir};
use crate::Config;

/// Why an outcome could not move on to its execution phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseBlock {
    InvalidSkills(Vec<String>),
    FailedCapabilityTasks(usize),
    OpenCapabilityTasks(usize),
    MissingSkills(Vec<String>),
}

impl fmt::Display for PhaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseBlock::InvalidSkills(errs) => write!(f, "invalid skill documents: {}", errs.join("; ")),
            PhaseBlock::FailedCapabilityTasks(n) => write!(f, "{n} capability task(s) failed"),
            PhaseBlock::OpenCapabilityTasks(n) => write!(f, "{n} capability task(s) could not run"),
            PhaseBlock::MissingSkills(names) => write!(f, "required skills were not produced: {}", names.join(", ")),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub capability: Vec<WorkerSummary>,
    pub execution: Vec<WorkerSummary>,
    pub skill_tasks: Vec<TaskId>,
    pub blocked: Option<PhaseBlock>,
    /// A worker was paused or stopped before its phase drained.
    pub interrupted: bool,
    pub achieved: bool,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub released: Vec<TaskId>,
    pub failed_workers: Vec<WorkerId>,
    pub behavior: TickReport,
}

/// Title of the synthetic capability task that produces a missing skill.
pub fn skill_task_title(name: &str) -> String {
    format!("Build skill: {name}")
}

fn kill_pid(pid: u32) {
    match std::process::Command::new("kill").arg(pid.to_string()).output() {
        Ok(out) if out.status.success() => info!(pid, "killed agent process"),
        Ok(_) => debug!(pid, "agent process already exited"),
        Err(e) => warn!(pid, error = %e, "could not run kill"),
    }
}

/// Pause a worker that has no live loop in this process: kill its agent by pid,
/// give its task back and mark it paused.
fn force_pause(store: &SqliteStore, worker_id: &WorkerId, reason: &str) -> Result<()> {
    let worker = store.get_worker(worker_id)?;
    if let Some(pid) = worker.pid {
        kill_pid(pid);
        store.set_worker_pid(worker_id, None)?;
    }
    if let Some(task_id) = &worker.current_task_id {
        store.release_task(task_id)?;
    }
    if worker.status.is_active() {
        store.set_worker_status(worker_id, WorkerStatus::Paused)?;
    }
    info!(worker = %worker_id, reason, "worker paused without a live loop");
    Ok(())
}

/// Routes supervisor pauses to the live loop, or pauses the worker directly.
struct RegistryPause {
    registry: WorkerRegistry,
    store: Arc<SqliteStore>,
}

impl PauseSink for RegistryPause {
    fn pause(&self, worker_id: &WorkerId, reason: &str) -> Result<()> {
        if self.registry.signal(worker_id, Control::Pause) {
            info!(worker = %worker_id, reason, "pause signalled");
            return Ok(());
        }
        force_pause(&self.store, worker_id, reason)
    }
}

pub struct Orchestrator {
    repo_root: PathBuf,
    config: Arc<Config>,
    store: Arc<SqliteStore>,
    ctx: Arc<WorkerContext>,
    behavior: BehaviorDetector,
}

fn project_id_for(repo_root: &Path) -> String {
    repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo").to_string()
}

impl Orchestrator {
    /// Write the default config (if absent) and create the database.
    pub fn init_repo(repo_root: &Path) -> Result<Config> {
        let cfg_path = Config::config_path(repo_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_repo(&project_id_for(repo_root));
            cfg.save_to(&cfg_path)?;
            cfg
        };
        SqliteStore::open(&Config::db_path(repo_root)).context("open store")?;
        std::fs::create_dir_all(cfg.workspace_root(repo_root)).context("create workspace root")?;
        Ok(cfg)
    }

    pub fn open(repo_root: &Path) -> Result<Self> {
        let cfg_path = Config::config_path(repo_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_repo(&project_id_for(repo_root));
            cfg.save_to(&cfg_path)?;
            cfg
        };
        Self::with_config(repo_root, cfg)
    }

    pub fn with_config(repo_root: &Path, config: Config) -> Result<Self> {
        let repo_root = repo_root.to_path_buf();
        let store = Arc::new(SqliteStore::open(&Config::db_path(&repo_root)).context("open store")?);

        let reasoner: Option<Arc<dyn Reasoner>> = if config.decomposition.use_reasoner {
            let program = config.decomposition.reasoner_program.clone().unwrap_or_else(|| config.agent.program.clone());
            Some(Arc::new(AgentCliReasoner::new(
                program,
                config.decomposition.reasoner_args.clone(),
                Duration::from_secs(config.decomposition.reasoner_timeout_secs),
            )))
        } else {
            None
        };
        let decomposer = Decomposer::new(store.clone(), reasoner, config.decompose_settings());

        let merges = if repo_root.join(".git").exists() {
            let git = GitWorktrees::new(&repo_root, &config.project.trunk, config.worktrees_root(&repo_root));
            Some(Arc::new(MergeQueue::new(store.clone(), git)))
        } else {
            debug!(root = %repo_root.display(), "not a git repository, worktree isolation unavailable");
            None
        };

        let registry = WorkerRegistry::default();
        let pause: Arc<dyn PauseSink> = Arc::new(RegistryPause { registry: registry.clone(), store: store.clone() });
        let behavior = BehaviorDetector::new(store.clone(), config.behavior_settings());
        let config = Arc::new(config);
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            config: config.clone(),
            workspace_root: config.workspace_root(&repo_root),
            decomposer,
            merges,
            registry,
            pause,
        });
        Ok(Self { repo_root, config, store, ctx, behavior })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.ctx.registry
    }

    /// Context for driving a single worker loop outside [`Self::run_outcome`].
    pub fn worker_context(&self) -> Arc<WorkerContext> {
        self.ctx.clone()
    }

    pub fn create_outcome(&self, new: NewOutcome) -> Result<Outcome> {
        let outcome = self.store.create_outcome(new)?;
        let dir = outcome_dir(&self.ctx.workspace_root, &outcome);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        info!(outcome = %outcome.id, name = %outcome.name, "created outcome");
        Ok(outcome)
    }

    /// Create a task, then split it up front if it reads like a bulk operation.
    pub fn submit_task(&self, new: NewTask) -> Result<Task> {
        let task = self.store.create_task(new)?;
        self.check_new_task(&task);
        Ok(self.store.get_task(&task.id)?)
    }

    fn check_new_task(&self, task: &Task) {
        match self.ctx.decomposer.check_new_task(task) {
            Ok(Some(DecomposeOutcome::Created(subs) | DecomposeOutcome::Existing(subs))) => {
                info!(task = %task.id, subtasks = subs.len(), "bulk task split on submit");
            }
            Ok(_) => {}
            Err(e) => warn!(task = %task.id, error = %e, "bulk split failed, task left pending"),
        }
    }

    /// Create every task in a planner file, then run the bulk check on each.
    pub fn import_tasks(&self, outcome_id: &OutcomeId, text: &str) -> Result<Vec<Task>> {
        self.store.get_outcome(outcome_id)?;
        let entries = parse_import(text)?;
        let ids = plan_import(outcome_id, &entries, |new| Ok(self.store.create_task(new)?.id))?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in &ids {
            let task = self.store.get_task(id)?;
            self.check_new_task(&task);
            tasks.push(self.store.get_task(id)?);
        }
        info!(outcome = %outcome_id, count = tasks.len(), "imported tasks");
        Ok(tasks)
    }

    /// Queue a capability task for every skill an open execution task needs but
    /// nobody has produced yet.
    pub fn ensure_skill_dependencies(&self, outcome: &Outcome) -> Result<Vec<Task>> {
        let tasks = self.store.get_tasks_by_outcome(&outcome.id)?;
        let required: BTreeSet<&String> = tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Execution && !t.status.is_terminal())
            .flat_map(|t| t.required_skills.iter())
            .collect();
        if required.is_empty() {
            return Ok(vec![]);
        }
        let (docs, _) = validate_skills_dir(&skills_dir(&self.ctx.workspace_root, outcome));
        let mut created = vec![];
        for name in missing_skills(required, &docs) {
            let title = skill_task_title(&name);
            if tasks.iter().any(|t| t.phase == TaskPhase::Capability && t.title == title) {
                continue;
            }
            let new = NewTask::new(outcome.id.clone(), title)
                .phase(TaskPhase::Capability)
                .priority(0)
                .description(format!(
                    "Write the skill document `{name}.md` in the skills directory. It needs a `# ` title and a \
                     `## Usage` section describing how execution tasks should apply it."
                ));
            created.push(self.store.create_task(new)?);
        }
        if !created.is_empty() {
            info!(outcome = %outcome.id, count = created.len(), "queued skill tasks");
        }
        Ok(created)
    }

    /// Move a ready outcome back into its capability phase when capability work is open.
    /// Returns true when readiness changed.
    pub fn reopen_capability_phase(&self, outcome_id: &OutcomeId) -> Result<bool> {
        let outcome = self.store.get_outcome(outcome_id)?;
        if outcome.capability_readiness != CapabilityReadiness::Ready {
            return Ok(false);
        }
        let open = self
            .store
            .get_tasks_by_outcome(outcome_id)?
            .iter()
            .filter(|t| t.phase == TaskPhase::Capability && !t.status.is_terminal())
            .count();
        if open == 0 {
            return Ok(false);
        }
        self.store.set_capability_readiness(outcome_id, CapabilityReadiness::InProgress)?;
        info!(outcome = %outcome_id, open, "capability phase reopened");
        Ok(true)
    }

    /// Drive an outcome through its capability and execution phases.
    pub async fn run_outcome(&self, outcome_id: &OutcomeId) -> Result<RunReport> {
        let mut report = RunReport::default();
        let outcome = self.store.get_outcome(outcome_id)?;
        if outcome.status == OutcomeStatus::Dormant {
            self.store.set_outcome_status(outcome_id, OutcomeStatus::Active)?;
        }
        report.skill_tasks = self.ensure_skill_dependencies(&outcome)?.into_iter().map(|t| t.id).collect();
        self.reopen_capability_phase(outcome_id)?;
        let outcome = self.store.get_outcome(outcome_id)?;
        let skills = skills_dir(&self.ctx.workspace_root, &outcome);

        if outcome.capability_readiness != CapabilityReadiness::Ready {
            if outcome.capability_readiness == CapabilityReadiness::Unanalyzed {
                self.store.set_capability_readiness(outcome_id, CapabilityReadiness::InProgress)?;
            }
            report.capability = self
                .run_phase(&outcome, TaskPhase::Capability, self.config.workers.max_capability_workers, Arc::default())
                .await?;
            if interrupted(&report.capability) {
                report.interrupted = true;
                return Ok(report);
            }
            if let Some(block) = self.capability_block(&outcome, &skills)? {
                warn!(outcome = %outcome_id, reason = %block, "execution phase blocked");
                report.blocked = Some(block);
                return Ok(report);
            }
            self.store.set_capability_readiness(outcome_id, CapabilityReadiness::Ready)?;
            info!(outcome = %outcome_id, "capability phase complete");
        }

        let (docs, errors) = validate_skills_dir(&skills);
        for e in &errors {
            warn!(error = %e, "skipping invalid skill document");
        }
        let outcome = self.store.get_outcome(outcome_id)?;
        let context = Arc::new(skill_context(&docs));
        report.execution = self
            .run_phase(&outcome, TaskPhase::Execution, self.config.workers.max_execution_workers, context)
            .await?;
        if interrupted(&report.execution) {
            report.interrupted = true;
            return Ok(report);
        }

        let counts = self.store.task_counts(outcome_id)?;
        if counts.total() > 0 && counts.completed == counts.total() {
            self.store.set_outcome_status(outcome_id, OutcomeStatus::Achieved)?;
            report.achieved = true;
            info!(outcome = %outcome_id, tasks = counts.total(), "outcome achieved");
        } else {
            info!(outcome = %outcome_id, open = counts.open(), failed = counts.failed, "execution phase drained");
        }
        Ok(report)
    }

    fn capability_block(&self, outcome: &Outcome, skills: &Path) -> Result<Option<PhaseBlock>> {
        let (docs, errors) = validate_skills_dir(skills);
        if !errors.is_empty() {
            return Ok(Some(PhaseBlock::InvalidSkills(errors.iter().map(|e| e.to_string()).collect())));
        }
        let tasks = self.store.get_tasks_by_outcome(&outcome.id)?;
        let capability = || tasks.iter().filter(|t| t.phase == TaskPhase::Capability);
        let failed = capability().filter(|t| t.status == TaskStatus::Failed).count();
        if failed > 0 {
            return Ok(Some(PhaseBlock::FailedCapabilityTasks(failed)));
        }
        let open = capability().filter(|t| !t.status.is_terminal()).count();
        if open > 0 {
            return Ok(Some(PhaseBlock::OpenCapabilityTasks(open)));
        }
        let required: BTreeSet<&String> = tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Execution && !t.status.is_terminal())
            .flat_map(|t| t.required_skills.iter())
            .collect();
        let missing = missing_skills(required, &docs);
        if !missing.is_empty() {
            return Ok(Some(PhaseBlock::MissingSkills(missing)));
        }
        Ok(None)
    }

    async fn run_phase(
        &self,
        outcome: &Outcome,
        phase: TaskPhase,
        limit: usize,
        skill_context: Arc<String>,
    ) -> Result<Vec<WorkerSummary>> {
        let pending = self
            .store
            .list_tasks_by_status(&outcome.id, TaskStatus::Pending)?
            .into_iter()
            .filter(|t| t.phase == phase)
            .count();
        if pending == 0 {
            debug!(outcome = %outcome.id, phase = %phase, "no pending tasks in phase");
            return Ok(vec![]);
        }
        let count = limit.max(1).min(pending);
        info!(outcome = %outcome.id, phase = %phase, workers = count, pending, "starting phase");

        let mut set = JoinSet::new();
        for _ in 0..count {
            let worker = self.store.register_worker(&outcome.id, phase)?;
            let control = self.ctx.registry.register(worker.id.clone(), outcome.id.clone(), phase);
            let spec = WorkerSpec { outcome: outcome.clone(), worker, phase, skill_context: skill_context.clone() };
            set.spawn(run_worker(self.ctx.clone(), spec, control));
        }
        let mut summaries = Vec::with_capacity(count);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(error = %e, "worker task panicked"),
            }
        }
        Ok(summaries)
    }

    /// Stop a worker. A live loop finishes its drain; otherwise the agent is killed by pid.
    pub fn stop_worker(&self, worker_id: &WorkerId) -> Result<()> {
        if self.ctx.registry.signal(worker_id, Control::Stop) {
            info!(worker = %worker_id, "stop signalled");
            return Ok(());
        }
        force_pause(&self.store, worker_id, "stopped by operator")
    }

    pub fn pause_worker(&self, worker_id: &WorkerId, reason: &str) -> Result<()> {
        self.ctx.pause.pause(worker_id, reason)
    }

    /// Stop every active worker, optionally limited to one outcome. Returns how many were stopped.
    pub fn stop_all(&self, outcome_id: Option<&OutcomeId>) -> Result<usize> {
        let mut stopped = 0;
        for worker in self.store.list_active_workers()? {
            if outcome_id.is_some_and(|o| *o != worker.outcome_id) {
                continue;
            }
            self.stop_worker(&worker.id)?;
            stopped += 1;
        }
        Ok(stopped)
    }

    pub fn intervene(&self, worker_id: &WorkerId, kind: InterventionKind, message: &str) -> Result<Intervention> {
        let worker = self.store.get_worker(worker_id)?;
        Ok(self.store.queue_intervention(&worker.outcome_id, worker_id, kind, message)?)
    }

    /// One pass of stale recovery and behavioural detection.
    pub fn sweep(&self) -> Result<SweepReport> {
        let stale_after = self.config.stale_after_ms();
        let failed_workers = self.store.mark_stale_workers_failed(stale_after)?;
        let released = self.store.cleanup_stale_claims(stale_after)?;
        let behavior = self.behavior.tick()?;
        if !released.is_empty() || !failed_workers.is_empty() || !behavior.raised.is_empty() {
            info!(
                released = released.len(),
                failed_workers = failed_workers.len(),
                alerts = behavior.raised.len(),
                "sweep"
            );
        }
        Ok(SweepReport { released, failed_workers, behavior })
    }

    /// Run [`Self::sweep`] on the supervisor tick until `stop` flips to true.
    pub async fn maintenance_loop(&self, mut stop: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.supervisor.tick_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!(error = %format!("{e:#}"), "sweep failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Merge a worker's branch into trunk through the merge queue.
    pub fn merge_worker(&self, outcome_id: &OutcomeId, worker_id: &WorkerId) -> Result<MergeQueueEntry> {
        let merges = self.ctx.merges.as_ref().ok_or_else(|| anyhow!("{} is not a git repository", self.repo_root.display()))?;
        let entry = merges.queue_merge(outcome_id, worker_id)?;
        if entry.status == MergeStatus::Completed && self.config.git.remove_worktree_after_merge {
            merges.git().remove_worktree(outcome_id, worker_id, true)?;
        }
        Ok(entry)
    }

    /// Undo a worker's last supervised session.
    pub fn rollback_worker(&self, worker_id: &WorkerId) -> Result<RollbackReport> {
        let snapshot = self
            .store
            .latest_change_snapshot(worker_id)?
            .ok_or_else(|| anyhow!("no change snapshot recorded for worker {worker_id}"))?;
        let report = rollback(&snapshot)?;
        info!(
            worker = %worker_id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            "rolled back"
        );
        Ok(report)
    }
}

fn interrupted(summaries: &[WorkerSummary]) -> bool {
    summaries.iter().any(|s| matches!(s.exit, LoopExit::Paused | LoopExit::Stopped))
}
