use std::collections::HashMap;

use hive_core::*;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::rows::{query_all, query_one, task_from_row, to_json, TASK_COLUMNS};
use crate::store::SqliteStore;

/// Result of marking a task for decomposition.
#[derive(Clone, Debug, PartialEq)]
pub enum DecompositionStart {
    Started(Task),
    /// Another decomposer holds a fresh `in_progress` mark.
    InProgress,
    AlreadyDecomposed(Vec<Task>),
}

fn load_task(conn: &Connection, id: &TaskId) -> StoreResult<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1");
    query_one(conn, &sql, params![id.0], task_from_row)?.ok_or_else(|| StoreError::not_found("task", id.as_str()))
}

fn load_outcome_tasks(conn: &Connection, outcome_id: &OutcomeId) -> StoreResult<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE outcome_id=?1 ORDER BY created_at, rowid");
    query_all(conn, &sql, params![outcome_id.0], task_from_row)
}

fn load_subtasks(conn: &Connection, parent: &TaskId) -> StoreResult<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE decomposed_from_task_id=?1 ORDER BY created_at, rowid");
    query_all(conn, &sql, params![parent.0], task_from_row)
}

fn insert_task(conn: &Connection, t: &Task) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            t.id.0,
            t.outcome_id.0,
            t.title,
            t.description,
            t.status.as_str(),
            t.phase.as_str(),
            t.priority,
            t.score,
            t.attempts as i64,
            t.max_attempts as i64,
            t.claimed_by.as_ref().map(|w| w.0.clone()),
            t.claimed_at,
            to_json(&t.depends_on),
            to_json(&t.required_skills),
            t.decomposition_status.as_str(),
            t.decomposition_started_at,
            t.decomposed_from_task_id.as_ref().map(|p| p.0.clone()),
            t.complexity_score.map(|c| c as i64),
            t.estimated_turns.map(|e| e as i64),
            t.last_error,
            t.created_at,
            t.updated_at,
            t.completed_at
        ],
    )?;
    Ok(())
}

fn dependency_edges(conn: &Connection, outcome_id: &OutcomeId) -> StoreResult<HashMap<TaskId, Vec<TaskId>>> {
    let rows: Vec<(String, String)> = query_all(
        conn,
        "SELECT id, depends_on_json FROM tasks WHERE outcome_id=?1",
        params![outcome_id.0],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let mut edges = HashMap::with_capacity(rows.len());
    for (id, deps) in rows {
        let deps: Vec<TaskId> = serde_json::from_str(&deps).map_err(|e| {
            warn!(task = %id, error = %e, "unreadable dependency list");
            e
        })?;
        edges.insert(TaskId::from_str(id), deps);
    }
    Ok(edges)
}

fn dependency_statuses(conn: &Connection, deps: &[TaskId]) -> StoreResult<HashMap<TaskId, TaskStatus>> {
    let mut out = HashMap::new();
    for dep in deps {
        let status: Option<String> =
            query_one(conn, "SELECT status FROM tasks WHERE id=?1", params![dep.0], |r| r.get(0))?;
        if let Some(s) = status.as_deref().and_then(TaskStatus::parse) {
            out.insert(dep.clone(), s);
        }
    }
    Ok(out)
}

/// Dependencies must exist, share the outcome, and keep the graph acyclic.
fn check_dependencies(conn: &Connection, outcome_id: &OutcomeId, candidate: &TaskId, deps: &[TaskId]) -> StoreResult<()> {
    for dep in deps {
        if dep == candidate {
            return Err(StoreError::CircularDependency { task: candidate.0.clone(), via: vec![dep.0.clone()] });
        }
        let owner: Option<String> =
            query_one(conn, "SELECT outcome_id FROM tasks WHERE id=?1", params![dep.0], |r| r.get(0))?;
        match owner {
            None => return Err(StoreError::InvalidDependency(format!("unknown task {dep}"))),
            Some(o) if o != outcome_id.0 => {
                return Err(StoreError::InvalidDependency(format!("{dep} belongs to outcome {o}")))
            }
            Some(_) => {}
        }
    }
    let edges = dependency_edges(conn, outcome_id)?;
    for dep in deps {
        let own = edges.get(dep).map(Vec::as_slice).unwrap_or(&[]);
        if !find_cycle_sources(dep, own, &edges).is_empty() {
            return Err(StoreError::InvalidDependency(format!("{dep} is part of an existing dependency cycle")));
        }
    }
    let via = find_cycle_sources(candidate, deps, &edges);
    if !via.is_empty() {
        return Err(StoreError::CircularDependency {
            task: candidate.0.clone(),
            via: via.into_iter().map(|t| t.0).collect(),
        });
    }
    Ok(())
}

fn clear_worker_task(conn: &Connection, worker: Option<&WorkerId>, task: &TaskId) -> StoreResult<()> {
    if let Some(w) = worker {
        conn.execute(
            "UPDATE workers SET current_task_id=NULL, updated_at=?1 WHERE id=?2 AND current_task_id=?3",
            params![now_ms(), w.0, task.0],
        )?;
    }
    Ok(())
}

fn mark_claimed(conn: &Connection, task: &Task, worker_id: &WorkerId) -> StoreResult<Task> {
    let now = now_ms();
    conn.execute(
        "UPDATE tasks SET status='claimed', claimed_by=?1, claimed_at=?2, updated_at=?2 WHERE id=?3 AND status='pending'",
        params![worker_id.0, now, task.id.0],
    )?;
    conn.execute(
        "UPDATE workers SET current_task_id=?1, updated_at=?2 WHERE id=?3",
        params![task.id.0, now, worker_id.0],
    )?;
    load_task(conn, &task.id)
}

/// How a task re-enters the queue.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Requeue {
    /// A judged attempt; the count stands.
    Retry,
    /// Interrupted without a verdict; a started attempt is given back.
    Release,
}

/// Reset ownership fields and return a task to `pending`.
fn return_to_pending(conn: &Connection, task: &Task, last_error: Option<&str>, how: Requeue) -> StoreResult<()> {
    let attempts = match how {
        Requeue::Release if task.status == TaskStatus::Running => task.attempts.saturating_sub(1),
        _ => task.attempts,
    };
    conn.execute(
        "UPDATE tasks SET status='pending', claimed_by=NULL, claimed_at=NULL, updated_at=?1,
             last_error=COALESCE(?2, last_error), attempts=?3
         WHERE id=?4",
        params![now_ms(), last_error, attempts as i64, task.id.0],
    )?;
    clear_worker_task(conn, task.claimed_by.as_ref(), &task.id)
}

fn invalid_transition(task: &Task, to: TaskStatus) -> StoreError {
    StoreError::InvalidTransition { id: task.id.0.clone(), from: task.status.to_string(), to: to.to_string() }
}

impl SqliteStore {
    pub fn create_task(&self, new: NewTask) -> StoreResult<Task> {
        self.write_tx(|tx| {
            let outcome: Option<i64> =
                query_one(tx, "SELECT 1 FROM outcomes WHERE id=?1", params![new.outcome_id.0], |r| r.get(0))?;
            if outcome.is_none() {
                return Err(StoreError::not_found("outcome", new.outcome_id.as_str()));
            }
            let now = now_ms();
            let task = Task {
                id: TaskId::new(),
                outcome_id: new.outcome_id,
                title: new.title,
                description: new.description,
                status: TaskStatus::Pending,
                phase: new.phase,
                priority: new.priority,
                score: new.score,
                attempts: 0,
                max_attempts: new.max_attempts.max(1),
                claimed_by: None,
                claimed_at: None,
                depends_on: new.depends_on,
                required_skills: new.required_skills,
                decomposition_status: DecompositionStatus::None,
                decomposition_started_at: None,
                decomposed_from_task_id: new.decomposed_from_task_id,
                complexity_score: new.complexity_score,
                estimated_turns: new.estimated_turns,
                last_error: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            };
            check_dependencies(tx, &task.outcome_id, &task.id, &task.depends_on)?;
            insert_task(tx, &task)?;
            debug!(task = %task.id, outcome = %task.outcome_id, phase = %task.phase, "created task");
            Ok(task)
        })
    }

    pub fn get_task(&self, id: &TaskId) -> StoreResult<Task> {
        load_task(&self.conn(), id)
    }

    pub fn get_tasks_by_outcome(&self, outcome_id: &OutcomeId) -> StoreResult<Vec<Task>> {
        let mut tasks = load_outcome_tasks(&self.conn(), outcome_id)?;
        tasks.sort_by(claim_order);
        Ok(tasks)
    }

    pub fn list_tasks_by_status(&self, outcome_id: &OutcomeId, status: TaskStatus) -> StoreResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE outcome_id=?1 AND status=?2 ORDER BY created_at, rowid");
        query_all(&self.conn(), &sql, params![outcome_id.0, status.as_str()], task_from_row)
    }

    pub fn get_subtasks(&self, parent: &TaskId) -> StoreResult<Vec<Task>> {
        load_subtasks(&self.conn(), parent)
    }

    pub fn task_counts(&self, outcome_id: &OutcomeId) -> StoreResult<TaskCounts> {
        let statuses: Vec<String> = query_all(
            &self.conn(),
            "SELECT status FROM tasks WHERE outcome_id=?1",
            params![outcome_id.0],
            |r| r.get(0),
        )?;
        let mut counts = TaskCounts::default();
        for s in statuses.iter().filter_map(|s| TaskStatus::parse(s)) {
            counts.add(s);
        }
        Ok(counts)
    }

    pub fn update_task(&self, id: &TaskId, upd: TaskUpdate) -> StoreResult<Task> {
        self.write_tx(|tx| {
            let mut task = load_task(tx, id)?;
            if let Some(deps) = upd.depends_on {
                check_dependencies(tx, &task.outcome_id, &task.id, &deps)?;
                task.depends_on = deps;
            }
            if let Some(v) = upd.title {
                task.title = v;
            }
            if let Some(v) = upd.description {
                task.description = v;
            }
            if let Some(v) = upd.priority {
                task.priority = v;
            }
            if let Some(v) = upd.score {
                task.score = v;
            }
            if let Some(v) = upd.max_attempts {
                task.max_attempts = v.max(1);
            }
            if upd.complexity_score.is_some() {
                task.complexity_score = upd.complexity_score;
            }
            if upd.estimated_turns.is_some() {
                task.estimated_turns = upd.estimated_turns;
            }
            task.updated_at = now_ms();
            tx.execute(
                "UPDATE tasks SET title=?1, description=?2, priority=?3, score=?4, max_attempts=?5, depends_on_json=?6,
                     complexity_score=?7, estimated_turns=?8, updated_at=?9
                 WHERE id=?10",
                params![
                    task.title,
                    task.description,
                    task.priority,
                    task.score,
                    task.max_attempts as i64,
                    to_json(&task.depends_on),
                    task.complexity_score.map(|c| c as i64),
                    task.estimated_turns.map(|e| e as i64),
                    task.updated_at,
                    task.id.0
                ],
            )?;
            Ok(task)
        })
    }

    /// Claim one specific task. Loses cleanly when another worker got there first.
    pub fn claim_task(&self, task_id: &TaskId, worker_id: &WorkerId) -> StoreResult<ClaimOutcome> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            let statuses = dependency_statuses(tx, &task.depends_on)?;
            if !task_is_claimable(&task, &statuses, None) {
                return Ok(ClaimOutcome::Unavailable(task.id));
            }
            let claimed = mark_claimed(tx, &task, worker_id)?;
            debug!(task = %claimed.id, worker = %worker_id, "claimed task");
            Ok(ClaimOutcome::Claimed(claimed))
        })
    }

    /// Claim the best eligible task of an outcome, optionally restricted to a phase.
    pub fn claim_next_task(
        &self,
        outcome_id: &OutcomeId,
        worker_id: &WorkerId,
        phase: Option<TaskPhase>,
    ) -> StoreResult<ClaimOutcome> {
        self.write_tx(|tx| {
            let tasks = load_outcome_tasks(tx, outcome_id)?;
            let Some(next) = plan_next_claim(&tasks, phase) else {
                return Ok(ClaimOutcome::NoEligibleTask);
            };
            let claimed = mark_claimed(tx, next, worker_id)?;
            debug!(task = %claimed.id, worker = %worker_id, priority = claimed.priority, "claimed next task");
            Ok(ClaimOutcome::Claimed(claimed))
        })
    }

    /// `claimed -> running`, counting an attempt. `None` when the task is not claimed.
    pub fn start_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            if task.status != TaskStatus::Claimed {
                return Ok(None);
            }
            tx.execute(
                "UPDATE tasks SET status='running', attempts=attempts+1, updated_at=?1 WHERE id=?2",
                params![now_ms(), task.id.0],
            )?;
            Ok(Some(load_task(tx, task_id)?))
        })
    }

    pub fn complete_task(&self, task_id: &TaskId) -> StoreResult<Task> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            if task.status != TaskStatus::Running {
                return Err(invalid_transition(&task, TaskStatus::Completed));
            }
            let now = now_ms();
            tx.execute(
                "UPDATE tasks SET status='completed', completed_at=?1, updated_at=?1, last_error=NULL WHERE id=?2",
                params![now, task.id.0],
            )?;
            clear_worker_task(tx, task.claimed_by.as_ref(), &task.id)?;
            info!(task = %task.id, attempts = task.attempts, "task completed");
            load_task(tx, task_id)
        })
    }

    /// Record a failed attempt. The task returns to `pending` until its attempts run out.
    pub fn fail_task(&self, task_id: &TaskId, error: &str) -> StoreResult<Task> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            if !task.status.is_owned() {
                return Err(invalid_transition(&task, TaskStatus::Failed));
            }
            if task.attempts >= task.max_attempts {
                tx.execute(
                    "UPDATE tasks SET status='failed', last_error=?1, updated_at=?2 WHERE id=?3",
                    params![error, now_ms(), task.id.0],
                )?;
                clear_worker_task(tx, task.claimed_by.as_ref(), &task.id)?;
                warn!(task = %task.id, attempts = task.attempts, error, "task failed permanently");
            } else {
                return_to_pending(tx, &task, Some(error), Requeue::Retry)?;
                info!(task = %task.id, attempts = task.attempts, max = task.max_attempts, "task returned for retry");
            }
            load_task(tx, task_id)
        })
    }

    /// Give an owned task back without judging it, e.g. when its worker is stopped.
    /// A running task gets its attempt back.
    pub fn release_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            if !task.status.is_owned() {
                return Ok(None);
            }
            return_to_pending(tx, &task, None, Requeue::Release)?;
            debug!(task = %task.id, "released task");
            Ok(Some(load_task(tx, task_id)?))
        })
    }

    /// Put a permanently failed task back in the queue with a fresh attempt budget.
    pub fn retry_task(&self, task_id: &TaskId) -> StoreResult<Task> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            if task.status != TaskStatus::Failed {
                return Err(invalid_transition(&task, TaskStatus::Pending));
            }
            tx.execute(
                "UPDATE tasks SET status='pending', attempts=0, claimed_by=NULL, claimed_at=NULL, updated_at=?1 WHERE id=?2",
                params![now_ms(), task.id.0],
            )?;
            load_task(tx, task_id)
        })
    }

    /// Release tasks whose owner stopped heartbeating or is no longer active.
    pub fn cleanup_stale_claims(&self, stale_after_ms: i64) -> StoreResult<Vec<TaskId>> {
        self.write_tx(|tx| {
            let cutoff = now_ms() - stale_after_ms;
            let sql = format!(
                "SELECT {cols} FROM tasks t LEFT JOIN workers w ON w.id = t.claimed_by
                 WHERE t.status IN ('claimed', 'running')
                   AND (w.id IS NULL
                        OR w.status NOT IN ('idle', 'running')
                        OR COALESCE(w.last_heartbeat, w.created_at) < ?1)",
                cols = TASK_COLUMNS
                    .split(", ")
                    .map(|c| format!("t.{}", c.trim()))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let stale = query_all(tx, &sql, params![cutoff], task_from_row)?;
            let mut released = vec![];
            for task in stale {
                return_to_pending(tx, &task, Some("claim released: owner stopped heartbeating"), Requeue::Release)?;
                warn!(task = %task.id, worker = ?task.claimed_by, "recovered stale claim");
                released.push(task.id);
            }
            Ok(released)
        })
    }

    pub fn validate_dependencies(&self, task_id: &TaskId, deps: &[TaskId]) -> StoreResult<()> {
        let conn = self.conn();
        let task = load_task(&conn, task_id)?;
        check_dependencies(&conn, &task.outcome_id, task_id, deps)
    }

    /// Proposed dependencies that would close a cycle through `task_id`.
    pub fn detect_circular_dependencies(&self, task_id: &TaskId, deps: &[TaskId]) -> StoreResult<Vec<TaskId>> {
        let conn = self.conn();
        let task = load_task(&conn, task_id)?;
        let edges = dependency_edges(&conn, &task.outcome_id)?;
        Ok(find_cycle_sources(task_id, deps, &edges))
    }

    /// Mark a task as being decomposed. Marks older than `stale_after_ms` are taken over.
    pub fn begin_decomposition(&self, task_id: &TaskId, stale_after_ms: i64) -> StoreResult<DecompositionStart> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            let now = now_ms();
            match task.decomposition_status {
                DecompositionStatus::Completed => {
                    return Ok(DecompositionStart::AlreadyDecomposed(load_subtasks(tx, task_id)?));
                }
                DecompositionStatus::InProgress => {
                    let started = task.decomposition_started_at.unwrap_or(0);
                    if now - started < stale_after_ms {
                        return Ok(DecompositionStart::InProgress);
                    }
                    warn!(task = %task.id, started, "taking over stale decomposition");
                }
                DecompositionStatus::None | DecompositionStatus::Failed => {}
            }
            tx.execute(
                "UPDATE tasks SET decomposition_status='in_progress', decomposition_started_at=?1, updated_at=?1 WHERE id=?2",
                params![now, task.id.0],
            )?;
            Ok(DecompositionStart::Started(load_task(tx, task_id)?))
        })
    }

    /// Persist a decomposition plan in one transaction.
    ///
    /// All subtasks are inserted before any dependency is wired, positions are
    /// resolved to ids, and tasks that depended on the parent are rewired onto
    /// the subtasks. The parent completes with `trace` appended to its description.
    /// Calling this again for a decomposed parent returns the existing subtasks.
    pub fn create_subtasks(&self, parent_id: &TaskId, drafts: &[SubtaskDraft], trace: &str) -> StoreResult<Vec<Task>> {
        self.write_tx(|tx| {
            let parent = load_task(tx, parent_id)?;
            let existing = load_subtasks(tx, parent_id)?;
            if !existing.is_empty() {
                return Ok(existing);
            }
            if drafts.is_empty() {
                return Err(StoreError::InvalidPlan("no subtasks".into()));
            }
            check_plan_indices(drafts).map_err(StoreError::InvalidPlan)?;

            let now = now_ms();
            let n = drafts.len();
            let mut ids = SubtaskIdMap::default();
            let mut created = Vec::with_capacity(n);
            for (i, d) in drafts.iter().enumerate() {
                let task = Task {
                    id: TaskId::new(),
                    outcome_id: parent.outcome_id.clone(),
                    title: d.title.clone(),
                    description: d.description.clone(),
                    status: TaskStatus::Pending,
                    phase: parent.phase,
                    priority: parent.priority,
                    // Earlier subtasks sort first within the parent's priority.
                    score: parent.score + (n - i) as f64 * 0.001,
                    attempts: 0,
                    max_attempts: parent.max_attempts,
                    claimed_by: None,
                    claimed_at: None,
                    depends_on: vec![],
                    required_skills: parent.required_skills.clone(),
                    decomposition_status: DecompositionStatus::None,
                    decomposition_started_at: None,
                    decomposed_from_task_id: Some(parent.id.clone()),
                    complexity_score: None,
                    estimated_turns: d.estimated_turns,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                };
                insert_task(tx, &task)?;
                ids.push(task.id.clone());
                created.push(task);
            }

            for (i, d) in drafts.iter().enumerate() {
                let deps = if d.depends_on.is_empty() {
                    parent.depends_on.clone()
                } else {
                    d.depends_on
                        .iter()
                        .map(|idx| {
                            ids.resolve(*idx)
                                .cloned()
                                .ok_or_else(|| StoreError::InvalidPlan(format!("unresolved subtask index {}", idx.0)))
                        })
                        .collect::<StoreResult<Vec<_>>>()?
                };
                tx.execute(
                    "UPDATE tasks SET depends_on_json=?1 WHERE id=?2",
                    params![to_json(&deps), created[i].id.0],
                )?;
                created[i].depends_on = deps;
            }

            let plan_edges: HashMap<TaskId, Vec<TaskId>> =
                created.iter().map(|t| (t.id.clone(), t.depends_on.clone())).collect();
            if !is_acyclic(&plan_edges) {
                return Err(StoreError::CircularDependency { task: parent.id.0.clone(), via: vec![] });
            }

            for dependent in load_outcome_tasks(tx, &parent.outcome_id)? {
                if dependent.decomposed_from_task_id.as_ref() == Some(&parent.id)
                    || !dependent.depends_on.contains(&parent.id)
                {
                    continue;
                }
                let mut deps: Vec<TaskId> = vec![];
                for d in &dependent.depends_on {
                    if d == &parent.id {
                        deps.extend(ids.ids().iter().cloned());
                    } else {
                        deps.push(d.clone());
                    }
                }
                deps.dedup();
                tx.execute(
                    "UPDATE tasks SET depends_on_json=?1, updated_at=?2 WHERE id=?3",
                    params![to_json(&deps), now, dependent.id.0],
                )?;
                debug!(task = %dependent.id, parent = %parent.id, "rewired dependent onto subtasks");
            }

            let description = if trace.is_empty() {
                parent.description.clone()
            } else {
                format!("{}\n\n{}", parent.description.trim_end(), trace)
            };
            tx.execute(
                "UPDATE tasks SET status='completed', decomposition_status='completed', description=?1,
                     completed_at=?2, updated_at=?2
                 WHERE id=?3",
                params![description, now, parent.id.0],
            )?;
            clear_worker_task(tx, parent.claimed_by.as_ref(), &parent.id)?;
            info!(task = %parent.id, subtasks = created.len(), "decomposed task");
            Ok(created)
        })
    }

    /// Record a failed decomposition. The parent goes back to the queue to run whole.
    pub fn fail_decomposition(&self, task_id: &TaskId, reason: &str) -> StoreResult<Task> {
        self.write_tx(|tx| {
            let task = load_task(tx, task_id)?;
            tx.execute(
                "UPDATE tasks SET decomposition_status='failed', last_error=?1, updated_at=?2 WHERE id=?3",
                params![reason, now_ms(), task.id.0],
            )?;
            if task.status.is_owned() {
                return_to_pending(tx, &task, None, Requeue::Release)?;
            }
            warn!(task = %task.id, reason, "decomposition failed");
            load_task(tx, task_id)
        })
    }
}
