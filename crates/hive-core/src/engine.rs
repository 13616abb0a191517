use std::cmp::Ordering;
use std::collections::HashMap;

use crate::{DecompositionStatus, Task, TaskId, TaskPhase, TaskStatus};

/// Claim order: priority ascending, score descending, then oldest first.
pub fn claim_order(a: &Task, b: &Task) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
        .then(a.created_at.cmp(&b.created_at))
}

/// Pure helper: can `task` be claimed given the statuses of its dependencies?
pub fn task_is_claimable(task: &Task, statuses: &HashMap<TaskId, TaskStatus>, phase: Option<TaskPhase>) -> bool {
    if task.status != TaskStatus::Pending {
        return false;
    }
    if matches!(task.decomposition_status, DecompositionStatus::InProgress | DecompositionStatus::Completed) {
        return false;
    }
    if let Some(p) = phase {
        if task.phase != p {
            return false;
        }
    }
    task.depends_on
        .iter()
        .all(|d| statuses.get(d) == Some(&TaskStatus::Completed))
}

/// Picks the next task to claim from `tasks`, or `None`.
pub fn plan_next_claim<'a>(tasks: &'a [Task], phase: Option<TaskPhase>) -> Option<&'a Task> {
    let statuses: HashMap<TaskId, TaskStatus> = tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
    let mut eligible: Vec<&Task> = tasks
        .iter()
        .filter(|t| task_is_claimable(t, &statuses, phase))
        .collect();
    eligible.sort_by(|a, b| claim_order(a, b));
    eligible.into_iter().next()
}
