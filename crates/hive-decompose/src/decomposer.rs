use std::sync::Arc;

use hive_core::{DecompositionStatus, SubtaskDraft, Task, TaskUpdate};
use hive_storage::{DecompositionStart, SqliteStore};
use tracing::{info, warn};

use crate::bulk::{detect_bulk_operation, BulkDetection};
use crate::complexity::{estimate_complexity, ComplexityEstimate};
use crate::error::DecomposeError;
use crate::plan::{decomposition_prompt, parse_decomposition, validate_plan};
use crate::reasoner::Reasoner;

#[derive(Clone, Debug)]
pub struct DecomposeSettings {
    pub enabled: bool,
    /// Tasks scoring at or above this are split.
    pub complexity_threshold: u8,
    pub max_subtasks: usize,
    pub bulk_max_subtasks: usize,
    /// An `in_progress` mark older than this is considered abandoned.
    pub stale_after_ms: i64,
}

impl Default for DecomposeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            complexity_threshold: 7,
            max_subtasks: 6,
            bulk_max_subtasks: 8,
            stale_after_ms: 5 * 60 * 1000,
        }
    }
}

/// Why a task was split.
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    Complexity(ComplexityEstimate),
    Bulk(BulkDetection),
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecomposeOutcome {
    /// Subtasks already existed; nothing new was created.
    Existing(Vec<Task>),
    Created(Vec<Task>),
    /// Another decomposer holds a fresh mark on the task.
    InProgress,
    NotNeeded(Option<ComplexityEstimate>),
}

#[derive(Clone)]
pub struct Decomposer {
    store: Arc<SqliteStore>,
    reasoner: Option<Arc<dyn Reasoner>>,
    settings: DecomposeSettings,
}

impl Decomposer {
    pub fn new(store: Arc<SqliteStore>, reasoner: Option<Arc<dyn Reasoner>>, settings: DecomposeSettings) -> Self {
        Self { store, reasoner, settings }
    }

    pub fn settings(&self) -> &DecomposeSettings {
        &self.settings
    }

    fn skip(&self, task: &Task) -> bool {
        !self.settings.enabled || task.is_subtask() || task.decomposition_status == DecompositionStatus::Failed
    }

    /// Reactive path, run on a claimed task before it starts.
    pub fn decompose_if_needed(&self, task: &Task, context: &str) -> Result<DecomposeOutcome, DecomposeError> {
        let existing = self.store.get_subtasks(&task.id)?;
        if !existing.is_empty() {
            return Ok(DecomposeOutcome::Existing(existing));
        }
        if self.skip(task) {
            return Ok(DecomposeOutcome::NotNeeded(None));
        }

        let bulk = detect_bulk_operation(&task.title, &task.description);
        if bulk.forces_decomposition() && self.reasoner.is_some() {
            return self.decompose_task(task, Trigger::Bulk(bulk), self.settings.bulk_max_subtasks, context);
        }

        let estimate = estimate_complexity(task, context, self.reasoner.as_deref());
        self.store.update_task(
            &task.id,
            TaskUpdate {
                complexity_score: Some(estimate.score),
                estimated_turns: Some(estimate.estimated_turns),
                ..Default::default()
            },
        )?;
        if estimate.score >= self.settings.complexity_threshold && self.reasoner.is_some() {
            return self.decompose_task(task, Trigger::Complexity(estimate), self.settings.max_subtasks, context);
        }
        Ok(DecomposeOutcome::NotNeeded(Some(estimate)))
    }

    /// Proactive path, run when a task is created and before anyone claims it.
    /// Only bulk-looking tasks are split here; the complexity threshold is bypassed.
    pub fn check_new_task(&self, task: &Task) -> Result<Option<DecomposeOutcome>, DecomposeError> {
        if self.skip(task) || self.reasoner.is_none() {
            return Ok(None);
        }
        let bulk = detect_bulk_operation(&task.title, &task.description);
        if !bulk.forces_decomposition() {
            return Ok(None);
        }
        info!(task = %task.id, signals = ?bulk.signals, "bulk operation detected at creation");
        self.decompose_task(task, Trigger::Bulk(bulk), self.settings.bulk_max_subtasks, "").map(Some)
    }

    /// Idempotent split. Existing subtasks are returned unchanged; otherwise the task is
    /// marked `in_progress` before the reasoner is asked, and any failure marks it `failed`.
    pub fn decompose_task(
        &self,
        task: &Task,
        trigger: Trigger,
        max_subtasks: usize,
        context: &str,
    ) -> Result<DecomposeOutcome, DecomposeError> {
        let existing = self.store.get_subtasks(&task.id)?;
        if !existing.is_empty() {
            return Ok(DecomposeOutcome::Existing(existing));
        }
        let Some(reasoner) = self.reasoner.as_deref() else {
            return Ok(DecomposeOutcome::NotNeeded(None));
        };
        match self.store.begin_decomposition(&task.id, self.settings.stale_after_ms)? {
            DecompositionStart::AlreadyDecomposed(subs) => return Ok(DecomposeOutcome::Existing(subs)),
            DecompositionStart::InProgress => return Ok(DecomposeOutcome::InProgress),
            DecompositionStart::Started(_) => {}
        }

        let planned = reasoner
            .reason(&decomposition_prompt(task, max_subtasks, context))
            .map_err(|e| DecomposeError::Reasoner(format!("{e:#}")))
            .and_then(|reply| parse_decomposition(&reply))
            .and_then(|drafts| validate_plan(drafts, max_subtasks));
        let drafts = match planned {
            Ok(d) => d,
            Err(e) => {
                self.store.fail_decomposition(&task.id, &e.to_string())?;
                return Err(e);
            }
        };

        match self.store.create_subtasks(&task.id, &drafts, &trace_text(&trigger, &drafts)) {
            Ok(subs) => Ok(DecomposeOutcome::Created(subs)),
            Err(e) => {
                if let Err(mark) = self.store.fail_decomposition(&task.id, &e.to_string()) {
                    warn!(task = %task.id, error = %mark, "could not record failed decomposition");
                }
                Err(e.into())
            }
        }
    }
}

fn trace_text(trigger: &Trigger, drafts: &[SubtaskDraft]) -> String {
    let why = match trigger {
        Trigger::Complexity(est) => format!("complexity {}/10", est.score),
        Trigger::Bulk(b) => format!("bulk operation: {}", b.signals.join(", ")),
    };
    let mut out = format!("[decomposed into {} subtasks, {why}]", drafts.len());
    for (i, d) in drafts.iter().enumerate() {
        out.push_str(&format!("\n{i}. {}", d.title));
        if !d.depends_on.is_empty() {
            let deps: Vec<String> = d.depends_on.iter().map(|x| x.0.to_string()).collect();
            out.push_str(&format!(" (after {})", deps.join(", ")));
        }
    }
    out
}
