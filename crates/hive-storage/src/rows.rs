use std::collections::BTreeMap;

use hive_core::*;
use rusqlite::{types::Type, Connection, OptionalExtension, Params, Row};
use serde::de::DeserializeOwned;

use crate::error::StoreResult;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value {value:?}")]
struct UnknownValue {
    kind: &'static str,
    value: String,
}

fn text<T>(r: &Row<'_>, idx: usize, kind: &'static str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let s: String = r.get(idx)?;
    parse(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(UnknownValue { kind, value: s }))
    })
}

fn json_col<T: DeserializeOwned>(r: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = r.get(idx)?;
    serde_json::from_str(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_u32(r: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u32>> {
    Ok(r.get::<_, Option<i64>>(idx)?.map(|v| v as u32))
}

pub(crate) fn to_json<T: serde::Serialize>(v: &T) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Option<T>> {
    Ok(conn.query_row(sql, params, map).optional()?)
}

pub(crate) fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    let mut out = vec![];
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) const OUTCOME_COLUMNS: &str =
    "id, name, status, intent, capability_readiness, git_mode, auto_commit, base_branch, created_at, last_activity_at";

pub(crate) fn outcome_from_row(r: &Row<'_>) -> rusqlite::Result<Outcome> {
    let intent: String = r.get(3)?;
    Ok(Outcome {
        id: OutcomeId::from_str(r.get::<_, String>(0)?),
        name: r.get(1)?,
        status: text(r, 2, "outcome status", OutcomeStatus::parse)?,
        intent: Intent::parse(&intent),
        capability_readiness: CapabilityReadiness::from_level(r.get(4)?),
        isolation: IsolationSettings {
            git_mode: text(r, 5, "git mode", GitMode::parse)?,
            auto_commit: r.get::<_, i64>(6)? != 0,
            base_branch: r.get(7)?,
        },
        created_at: r.get(8)?,
        last_activity_at: r.get(9)?,
    })
}

pub(crate) const TASK_COLUMNS: &str = "id, outcome_id, title, description, status, phase, priority, score, \
     attempts, max_attempts, claimed_by, claimed_at, depends_on_json, required_skills_json, \
     decomposition_status, decomposition_started_at, decomposed_from_task_id, complexity_score, \
     estimated_turns, last_error, created_at, updated_at, completed_at";

pub(crate) fn task_from_row(r: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: TaskId::from_str(r.get::<_, String>(0)?),
        outcome_id: OutcomeId::from_str(r.get::<_, String>(1)?),
        title: r.get(2)?,
        description: r.get(3)?,
        status: text(r, 4, "task status", TaskStatus::parse)?,
        phase: text(r, 5, "task phase", TaskPhase::parse_lenient)?,
        priority: r.get(6)?,
        score: r.get(7)?,
        attempts: r.get::<_, i64>(8)? as u32,
        max_attempts: r.get::<_, i64>(9)? as u32,
        claimed_by: r.get::<_, Option<String>>(10)?.map(WorkerId::from_str),
        claimed_at: r.get(11)?,
        depends_on: json_col(r, 12)?,
        required_skills: json_col(r, 13)?,
        decomposition_status: text(r, 14, "decomposition status", DecompositionStatus::parse)?,
        decomposition_started_at: r.get(15)?,
        decomposed_from_task_id: r.get::<_, Option<String>>(16)?.map(TaskId::from_str),
        complexity_score: r.get::<_, Option<i64>>(17)?.map(|v| v.clamp(0, u8::MAX as i64) as u8),
        estimated_turns: opt_u32(r, 18)?,
        last_error: r.get(19)?,
        created_at: r.get(20)?,
        updated_at: r.get(21)?,
        completed_at: r.get(22)?,
    })
}

pub(crate) const WORKER_COLUMNS: &str = "id, outcome_id, status, phase, current_task_id, iteration, last_heartbeat, \
     pid, cost, consecutive_failures, worktree_path, branch_name, created_at, updated_at";

pub(crate) fn worker_from_row(r: &Row<'_>) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: WorkerId::from_str(r.get::<_, String>(0)?),
        outcome_id: OutcomeId::from_str(r.get::<_, String>(1)?),
        status: text(r, 2, "worker status", WorkerStatus::parse)?,
        phase: text(r, 3, "task phase", TaskPhase::parse_lenient)?,
        current_task_id: r.get::<_, Option<String>>(4)?.map(TaskId::from_str),
        iteration: r.get::<_, i64>(5)? as u32,
        last_heartbeat: r.get(6)?,
        pid: opt_u32(r, 7)?,
        cost: r.get(8)?,
        consecutive_failures: r.get::<_, i64>(9)? as u32,
        worktree_path: r.get(10)?,
        branch_name: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

pub(crate) const PROGRESS_COLUMNS: &str =
    "id, outcome_id, worker_id, iteration, task_id, content, full_output, compacted, compacted_into, created_at";

pub(crate) fn progress_from_row(r: &Row<'_>) -> rusqlite::Result<ProgressEntry> {
    Ok(ProgressEntry {
        id: ProgressId::from_str(r.get::<_, String>(0)?),
        outcome_id: OutcomeId::from_str(r.get::<_, String>(1)?),
        worker_id: WorkerId::from_str(r.get::<_, String>(2)?),
        iteration: r.get::<_, i64>(3)? as u32,
        task_id: r.get::<_, Option<String>>(4)?.map(TaskId::from_str),
        content: r.get(5)?,
        full_output: r.get(6)?,
        compacted: r.get::<_, i64>(7)? != 0,
        compacted_into: r.get::<_, Option<String>>(8)?.map(ProgressId::from_str),
        created_at: r.get(9)?,
    })
}

pub(crate) const ALERT_COLUMNS: &str =
    "id, worker_id, outcome_id, kind, pattern, severity, message, auto_paused, status, created_at, resolved_at";

pub(crate) fn alert_from_row(r: &Row<'_>) -> rusqlite::Result<SupervisorAlert> {
    Ok(SupervisorAlert {
        id: AlertId::from_str(r.get::<_, String>(0)?),
        worker_id: WorkerId::from_str(r.get::<_, String>(1)?),
        outcome_id: OutcomeId::from_str(r.get::<_, String>(2)?),
        kind: text(r, 3, "alert kind", AlertKind::parse)?,
        pattern: r.get(4)?,
        severity: text(r, 5, "severity", Severity::parse)?,
        message: r.get(6)?,
        auto_paused: r.get::<_, i64>(7)? != 0,
        status: text(r, 8, "alert status", AlertStatus::parse)?,
        created_at: r.get(9)?,
        resolved_at: r.get(10)?,
    })
}

pub(crate) const DETECTION_COLUMNS: &str = "id, worker_id, pattern, severity, action, paths_json, alert_id, created_at";

pub(crate) fn detection_from_row(r: &Row<'_>) -> rusqlite::Result<PatternDetection> {
    Ok(PatternDetection {
        id: DetectionId::from_str(r.get::<_, String>(0)?),
        worker_id: WorkerId::from_str(r.get::<_, String>(1)?),
        pattern: r.get(2)?,
        severity: text(r, 3, "severity", Severity::parse)?,
        action: text(r, 4, "pattern action", PatternAction::parse)?,
        paths: json_col(r, 5)?,
        alert_id: r.get::<_, Option<String>>(6)?.map(AlertId::from_str),
        created_at: r.get(7)?,
    })
}

pub(crate) const SNAPSHOT_COLUMNS: &str =
    "id, worker_id, root, created_json, modified_json, deleted_json, pre_images_json, created_at";

pub(crate) fn snapshot_from_row(r: &Row<'_>) -> rusqlite::Result<ChangeSnapshot> {
    Ok(ChangeSnapshot {
        id: SnapshotId::from_str(r.get::<_, String>(0)?),
        worker_id: WorkerId::from_str(r.get::<_, String>(1)?),
        root: r.get(2)?,
        created: json_col(r, 3)?,
        modified: json_col(r, 4)?,
        deleted: json_col(r, 5)?,
        pre_images: json_col::<BTreeMap<String, String>>(r, 6)?,
        created_at: r.get(7)?,
    })
}

pub(crate) const MERGE_COLUMNS: &str = "id, outcome_id, worker_id, source_branch, target_branch, status, \
     conflict_files_json, error_message, merge_commit, created_at, completed_at";

pub(crate) fn merge_from_row(r: &Row<'_>) -> rusqlite::Result<MergeQueueEntry> {
    Ok(MergeQueueEntry {
        id: MergeId::from_str(r.get::<_, String>(0)?),
        outcome_id: OutcomeId::from_str(r.get::<_, String>(1)?),
        worker_id: WorkerId::from_str(r.get::<_, String>(2)?),
        source_branch: r.get(3)?,
        target_branch: r.get(4)?,
        status: text(r, 5, "merge status", MergeStatus::parse)?,
        conflict_files: json_col(r, 6)?,
        error_message: r.get(7)?,
        merge_commit: r.get(8)?,
        created_at: r.get(9)?,
        completed_at: r.get(10)?,
    })
}

pub(crate) const INTERVENTION_COLUMNS: &str =
    "id, outcome_id, worker_id, kind, message, status, created_at, applied_at";

pub(crate) fn intervention_from_row(r: &Row<'_>) -> rusqlite::Result<Intervention> {
    Ok(Intervention {
        id: InterventionId::from_str(r.get::<_, String>(0)?),
        outcome_id: OutcomeId::from_str(r.get::<_, String>(1)?),
        worker_id: WorkerId::from_str(r.get::<_, String>(2)?),
        kind: text(r, 3, "intervention kind", InterventionKind::parse)?,
        message: r.get(4)?,
        status: text(r, 5, "intervention status", InterventionStatus::parse)?,
        created_at: r.get(6)?,
        applied_at: r.get(7)?,
    })
}
