use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ids::*, intent::Intent, model::*, time::EpochMs};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IsolationSettings {
    pub git_mode: GitMode,
    pub auto_commit: bool,
    /// Branch worktrees are rooted at. Falls back to the configured trunk.
    #[serde(default)]
    pub base_branch: Option<String>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self { git_mode: GitMode::None, auto_commit: false, base_branch: None }
    }
}

#[derive(Clone, Debug)]
pub struct Outcome {
    pub id: OutcomeId,
    pub name: String,
    pub status: OutcomeStatus,
    pub intent: Intent,
    pub capability_readiness: CapabilityReadiness,
    pub isolation: IsolationSettings,
    pub created_at: EpochMs,
    pub last_activity_at: EpochMs,
}

#[derive(Clone, Debug, Default)]
pub struct NewOutcome {
    pub name: String,
    pub intent_raw: String,
    pub isolation: IsolationSettings,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub outcome_id: OutcomeId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub phase: TaskPhase,
    /// Lower runs first.
    pub priority: i64,
    /// Tie-break within a priority, higher first.
    pub score: f64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<EpochMs>,
    pub depends_on: Vec<TaskId>,
    pub required_skills: Vec<String>,
    pub decomposition_status: DecompositionStatus,
    pub decomposition_started_at: Option<EpochMs>,
    pub decomposed_from_task_id: Option<TaskId>,
    pub complexity_score: Option<u8>,
    pub estimated_turns: Option<u32>,
    pub last_error: Option<String>,
    pub created_at: EpochMs,
    pub updated_at: EpochMs,
    pub completed_at: Option<EpochMs>,
}

impl Task {
    pub fn is_subtask(&self) -> bool {
        self.decomposed_from_task_id.is_some()
    }
}

/// Task creation payload accepted from planners and the decomposition engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTask {
    pub outcome_id: OutcomeId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default = "default_phase")]
    pub phase: TaskPhase,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub decomposed_from_task_id: Option<TaskId>,
    #[serde(default)]
    pub complexity_score: Option<u8>,
    #[serde(default)]
    pub estimated_turns: Option<u32>,
}

pub const DEFAULT_PRIORITY: i64 = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_phase() -> TaskPhase {
    TaskPhase::Execution
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl NewTask {
    pub fn new(outcome_id: OutcomeId, title: impl Into<String>) -> Self {
        Self {
            outcome_id,
            title: title.into(),
            description: String::new(),
            priority: DEFAULT_PRIORITY,
            score: 0.0,
            depends_on: vec![],
            phase: TaskPhase::Execution,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            required_skills: vec![],
            decomposed_from_task_id: None,
            complexity_score: None,
            estimated_turns: None,
        }
    }

    pub fn description(mut self, d: impl Into<String>) -> Self {
        self.description = d.into();
        self
    }

    pub fn priority(mut self, p: i64) -> Self {
        self.priority = p;
        self
    }

    pub fn score(mut self, s: f64) -> Self {
        self.score = s;
        self
    }

    pub fn phase(mut self, p: TaskPhase) -> Self {
        self.phase = p;
        self
    }

    pub fn depends_on(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn required_skills(mut self, skills: Vec<String>) -> Self {
        self.required_skills = skills;
        self
    }
}

/// Partial update for planner-owned task fields. State fields are not editable here.
#[derive(Clone, Debug, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub score: Option<f64>,
    pub max_attempts: Option<u32>,
    pub depends_on: Option<Vec<TaskId>>,
    pub complexity_score: Option<u8>,
    pub estimated_turns: Option<u32>,
}

/// How a finished agent run bears on the worker's failure streak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskVerdict {
    Succeeded,
    Failed,
    /// Stopped or paused before a verdict. The streak is left as it was.
    Interrupted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.running + self.completed + self.failed
    }

    /// Tasks that may still produce work.
    pub fn open(&self) -> usize {
        self.pending + self.claimed + self.running
    }
}

/// Result of a claim attempt. Contention is an expected outcome, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// The specific task was not `pending` (or not eligible) when checked.
    Unavailable(TaskId),
    /// No pending task with satisfied dependencies exists.
    NoEligibleTask,
}

impl ClaimOutcome {
    pub fn into_task(self) -> Option<Task> {
        match self {
            ClaimOutcome::Claimed(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    pub outcome_id: OutcomeId,
    pub status: WorkerStatus,
    pub phase: TaskPhase,
    pub current_task_id: Option<TaskId>,
    pub iteration: u32,
    pub last_heartbeat: Option<EpochMs>,
    pub pid: Option<u32>,
    pub cost: f64,
    pub consecutive_failures: u32,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub created_at: EpochMs,
    pub updated_at: EpochMs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEntry {
    pub id: ProgressId,
    pub outcome_id: OutcomeId,
    pub worker_id: WorkerId,
    pub iteration: u32,
    pub task_id: Option<TaskId>,
    pub content: String,
    pub full_output: Option<String>,
    pub compacted: bool,
    pub compacted_into: Option<ProgressId>,
    pub created_at: EpochMs,
}

#[derive(Clone, Debug)]
pub struct NewProgress {
    pub outcome_id: OutcomeId,
    pub worker_id: WorkerId,
    pub iteration: u32,
    pub task_id: Option<TaskId>,
    pub content: String,
    pub full_output: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorAlert {
    pub id: AlertId,
    pub worker_id: WorkerId,
    pub outcome_id: OutcomeId,
    pub kind: AlertKind,
    /// Pattern name for `suspicious_pattern` alerts, empty otherwise.
    pub pattern: String,
    pub severity: Severity,
    pub message: String,
    pub auto_paused: bool,
    pub status: AlertStatus,
    pub created_at: EpochMs,
    pub resolved_at: Option<EpochMs>,
}

#[derive(Clone, Debug)]
pub struct NewAlert {
    pub worker_id: WorkerId,
    pub outcome_id: OutcomeId,
    pub kind: AlertKind,
    pub pattern: String,
    pub severity: Severity,
    pub message: String,
    pub auto_paused: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternDetection {
    pub id: DetectionId,
    pub worker_id: WorkerId,
    pub pattern: String,
    pub severity: Severity,
    pub action: PatternAction,
    pub paths: Vec<String>,
    pub alert_id: Option<AlertId>,
    pub created_at: EpochMs,
}

/// Before/after record of one supervised session, sufficient for rollback.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSnapshot {
    pub id: SnapshotId,
    pub worker_id: WorkerId,
    pub root: String,
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    /// Pre-image content of modified/deleted files, keyed by path relative to `root`.
    pub pre_images: BTreeMap<String, String>,
    pub created_at: EpochMs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeQueueEntry {
    pub id: MergeId,
    pub outcome_id: OutcomeId,
    pub worker_id: WorkerId,
    pub source_branch: String,
    pub target_branch: String,
    pub status: MergeStatus,
    pub conflict_files: Vec<String>,
    pub error_message: Option<String>,
    pub merge_commit: Option<String>,
    pub created_at: EpochMs,
    pub completed_at: Option<EpochMs>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Intervention {
    pub id: InterventionId,
    pub outcome_id: OutcomeId,
    pub worker_id: WorkerId,
    pub kind: InterventionKind,
    pub message: String,
    pub status: InterventionStatus,
    pub created_at: EpochMs,
    pub applied_at: Option<EpochMs>,
}
