use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use hive_core::{DecompositionStatus, NewOutcome, NewTask, OutcomeId, TaskPhase, TaskStatus};
use hive_decompose::{DecomposeError, DecomposeOutcome, DecomposeSettings, Decomposer, Reasoner};
use hive_storage::SqliteStore;
use tempfile::{tempdir, TempDir};

/// Answers complexity prompts with a fixed score and split prompts with a fixed plan.
struct Scripted {
    score: u8,
    plan: Option<String>,
    split_calls: Mutex<usize>,
}

impl Scripted {
    fn new(score: u8, plan: Option<&str>) -> Arc<Self> {
        Arc::new(Self { score, plan: plan.map(str::to_string), split_calls: Mutex::new(0) })
    }

    fn split_calls(&self) -> usize {
        *self.split_calls.lock().unwrap()
    }
}

impl Reasoner for Scripted {
    fn reason(&self, prompt: &str) -> Result<String> {
        if prompt.starts_with("Estimate the implementation complexity") {
            return Ok(format!("{{\"score\": {}, \"confidence\": \"high\"}}", self.score));
        }
        *self.split_calls.lock().unwrap() += 1;
        self.plan.clone().ok_or_else(|| anyhow!("model unavailable"))
    }
}

const PLAN: &str = "SUBTASK 0: schema\nDESCRIPTION: tables\nDEPENDS_ON: none\n\
                    SUBTASK 1: queries\nDESCRIPTION: crud\nDEPENDS_ON: 0\n\
                    SUBTASK 2: api\nDESCRIPTION: endpoints\nDEPENDS_ON: 0, 1\n";

fn setup() -> (TempDir, Arc<SqliteStore>, OutcomeId) {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("hive.db")).unwrap());
    let outcome = store.create_outcome(NewOutcome { name: "o".into(), ..Default::default() }).unwrap();
    (dir, store, outcome.id)
}

fn decomposer(store: &Arc<SqliteStore>, reasoner: Arc<Scripted>) -> Decomposer {
    Decomposer::new(store.clone(), Some(reasoner), DecomposeSettings::default())
}

#[test]
fn complex_task_is_split_once() {
    let (_d, store, o) = setup();
    let reasoner = Scripted::new(9, Some(PLAN));
    let d = decomposer(&store, reasoner.clone());
    let w = store.register_worker(&o, TaskPhase::Execution).unwrap();
    store.create_task(NewTask::new(o.clone(), "Build the billing service")).unwrap();
    let task = store.claim_next_task(&o, &w.id, None).unwrap().into_task().unwrap();

    let DecomposeOutcome::Created(first) = d.decompose_if_needed(&task, "").unwrap() else {
        panic!("expected a split");
    };
    assert_eq!(first.len(), 3);
    let parent = store.get_task(&task.id).unwrap();
    assert_eq!(parent.status, TaskStatus::Completed);
    assert_eq!(parent.decomposition_status, DecompositionStatus::Completed);
    assert_eq!(parent.complexity_score, Some(9));
    assert!(parent.description.contains("complexity 9/10"));

    let DecomposeOutcome::Existing(second) = d.decompose_if_needed(&task, "").unwrap() else {
        panic!("expected existing subtasks");
    };
    assert_eq!(
        first.iter().map(|t| &t.id).collect::<Vec<_>>(),
        second.iter().map(|t| &t.id).collect::<Vec<_>>()
    );
    assert_eq!(reasoner.split_calls(), 1);

    // Subtasks are never split again.
    assert_eq!(d.decompose_if_needed(&second[0], "").unwrap(), DecomposeOutcome::NotNeeded(None));
}

#[test]
fn simple_task_only_records_its_score() {
    let (_d, store, o) = setup();
    let reasoner = Scripted::new(3, Some(PLAN));
    let d = decomposer(&store, reasoner.clone());
    let task = store.create_task(NewTask::new(o.clone(), "Fix a typo")).unwrap();
    let DecomposeOutcome::NotNeeded(Some(est)) = d.decompose_if_needed(&task, "").unwrap() else {
        panic!("expected no split");
    };
    assert_eq!(est.score, 3);
    assert_eq!(store.get_task(&task.id).unwrap().complexity_score, Some(3));
    assert_eq!(reasoner.split_calls(), 0);
}

#[test]
fn self_referencing_plan_fails_and_parent_stays_pending() {
    let (_d, store, o) = setup();
    let bad = "SUBTASK 0: a\nDEPENDS_ON: none\nSUBTASK 1: b\nDEPENDS_ON: 0\nSUBTASK 2: c\nDEPENDS_ON: 2\n";
    let d = decomposer(&store, Scripted::new(9, Some(bad)));
    let w = store.register_worker(&o, TaskPhase::Execution).unwrap();
    store.create_task(NewTask::new(o.clone(), "Big job")).unwrap();
    let task = store.claim_next_task(&o, &w.id, None).unwrap().into_task().unwrap();

    let err = d.decompose_if_needed(&task, "").unwrap_err();
    assert!(matches!(err, DecomposeError::ForwardDependency { subtask: 2, dependency: 2 }));
    let parent = store.get_task(&task.id).unwrap();
    assert_eq!(parent.status, TaskStatus::Pending);
    assert_eq!(parent.decomposition_status, DecompositionStatus::Failed);
    assert!(store.get_subtasks(&task.id).unwrap().is_empty());

    // A failed decomposition is not retried; the task runs whole.
    assert_eq!(d.decompose_if_needed(&parent, "").unwrap(), DecomposeOutcome::NotNeeded(None));
}

#[test]
fn reasoner_outage_marks_failed() {
    let (_d, store, o) = setup();
    let d = decomposer(&store, Scripted::new(9, None));
    let task = store.create_task(NewTask::new(o.clone(), "Big job")).unwrap();
    assert!(matches!(d.decompose_if_needed(&task, ""), Err(DecomposeError::Reasoner(_))));
    assert_eq!(store.get_task(&task.id).unwrap().decomposition_status, DecompositionStatus::Failed);
}

#[test]
fn concurrent_decomposer_backs_off() {
    let (_d, store, o) = setup();
    let reasoner = Scripted::new(9, Some(PLAN));
    let d = decomposer(&store, reasoner.clone());
    let task = store.create_task(NewTask::new(o.clone(), "Big job")).unwrap();
    store.begin_decomposition(&task.id, 60_000).unwrap();
    assert_eq!(d.decompose_if_needed(&task, "").unwrap(), DecomposeOutcome::InProgress);
    assert_eq!(reasoner.split_calls(), 0);
}

#[test]
fn bulk_tasks_are_split_at_creation() {
    let (_d, store, o) = setup();
    let plan: String = (0..10).map(|i| format!("SUBTASK {i}: page {i}\nDEPENDS_ON: none\n")).collect();
    let d = decomposer(&store, Scripted::new(1, Some(&plan)));
    let task = store.create_task(NewTask::new(o.clone(), "Add alt text to 40 pages")).unwrap();
    let Some(DecomposeOutcome::Created(subs)) = d.check_new_task(&task).unwrap() else {
        panic!("expected proactive split");
    };
    assert_eq!(subs.len(), 8);
    assert!(d.check_new_task(&store.create_task(NewTask::new(o, "Add a logout button")).unwrap()).unwrap().is_none());
}

#[test]
fn without_a_reasoner_nothing_is_split() {
    let (_d, store, o) = setup();
    let d = Decomposer::new(store.clone(), None, DecomposeSettings::default());
    let task = store
        .create_task(NewTask::new(o.clone(), "Migrate authentication across the entire database schema"))
        .unwrap();
    assert!(matches!(d.decompose_if_needed(&task, "").unwrap(), DecomposeOutcome::NotNeeded(Some(_))));
    assert!(d.check_new_task(&task).unwrap().is_none());
}
