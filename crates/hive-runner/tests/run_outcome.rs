use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hive_core::*;
use hive_runner::{Config, Orchestrator, PhaseBlock};
use tempfile::tempdir;

const DONE: &str = r#"echo "ran $HIVE_TASK_ID"; echo DONE >> "$HIVE_PROGRESS_FILE""#;

fn orchestrator(dir: &Path, script: &str) -> Orchestrator {
    let mut cfg = Config::default_for_repo("test");
    cfg.agent.program = "sh".into();
    cfg.agent.args = vec!["-c".into(), script.into()];
    cfg.agent.timeout_secs = 20;
    cfg.agent.poll_interval_ms = 50;
    cfg.agent.pause_grace_ms = 200;
    cfg.workers.idle_poll_ms = 50;
    cfg.workers.heartbeat_interval_secs = 1;
    cfg.decomposition.use_reasoner = false;
    cfg.supervisor.scan_interval_ms = 50;
    Orchestrator::with_config(dir, cfg).unwrap()
}

fn outcome(orch: &Orchestrator) -> Outcome {
    orch.create_outcome(NewOutcome { name: "demo".into(), ..Default::default() }).unwrap()
}

#[tokio::test]
async fn dependent_tasks_run_in_order_and_achieve_the_outcome() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), DONE);
    let o = outcome(&orch);
    let a = orch.submit_task(NewTask::new(o.id.clone(), "write schema")).unwrap();
    let b = orch
        .submit_task(NewTask::new(o.id.clone(), "write docs").depends_on(vec![a.id.clone()]))
        .unwrap();

    let report = orch.run_outcome(&o.id).await.unwrap();
    assert!(report.achieved);
    assert!(report.blocked.is_none());
    assert!(report.capability.is_empty());
    assert_eq!(report.execution.iter().map(|s| s.completed).sum::<u32>(), 2);

    let store = orch.store();
    let a = store.get_task(&a.id).unwrap();
    let b = store.get_task(&b.id).unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Completed);
    assert!(b.completed_at.unwrap() >= a.completed_at.unwrap());

    let o = store.get_outcome(&o.id).unwrap();
    assert_eq!(o.status, OutcomeStatus::Achieved);
    assert_eq!(o.capability_readiness, CapabilityReadiness::Ready);

    let workers = store.list_workers(Some(&o.id)).unwrap();
    assert!(!workers.is_empty());
    let mut outputs = vec![];
    for w in &workers {
        assert_eq!(w.status, WorkerStatus::Completed);
        assert_eq!(w.current_task_id, None);
        outputs.extend(store.progress_tail(&w.id, 10).unwrap());
    }
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|p| p.full_output.as_deref().unwrap_or("").contains("ran task")));
    assert!(orch.registry().is_empty());
}

#[tokio::test]
async fn failing_agent_exhausts_attempts_with_captured_output() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), "echo boom >&2; exit 3");
    let o = outcome(&orch);
    let t = orch.submit_task(NewTask::new(o.id.clone(), "flaky step").max_attempts(2)).unwrap();

    let report = orch.run_outcome(&o.id).await.unwrap();
    assert!(!report.achieved);
    assert_eq!(report.execution.len(), 1);
    assert_eq!(report.execution[0].failed, 2);

    let t = orch.store().get_task(&t.id).unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.attempts, 2);
    assert!(t.last_error.as_deref().unwrap().contains("boom"));

    let w = orch.store().get_worker(&report.execution[0].worker_id).unwrap();
    assert_eq!(w.consecutive_failures, 2);
    assert_ne!(orch.store().get_outcome(&o.id).unwrap().status, OutcomeStatus::Achieved);
}

const SKILL_SCRIPT: &str = r#"
if grep -q "Build skill: deploy" "$HIVE_TASK_DIR/TASK.md"; then
  printf '# Deploy\n\n## Usage\nPush with the release script.\n' > "$HIVE_SKILLS_DIR/deploy.md"
else
  cat "$HIVE_TASK_DIR/TASK.md"
fi
echo DONE >> "$HIVE_PROGRESS_FILE"
"#;

#[tokio::test]
async fn missing_skill_is_built_before_execution() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), SKILL_SCRIPT);
    let o = outcome(&orch);
    let exec = orch
        .submit_task(NewTask::new(o.id.clone(), "ship release").required_skills(vec!["deploy".into()]))
        .unwrap();

    let report = orch.run_outcome(&o.id).await.unwrap();
    assert_eq!(report.skill_tasks.len(), 1);
    assert_eq!(report.capability.iter().map(|s| s.completed).sum::<u32>(), 1);
    assert!(report.achieved, "blocked: {:?}", report.blocked);

    let store = orch.store();
    let skill_task = store.get_task(&report.skill_tasks[0]).unwrap();
    assert_eq!(skill_task.phase, TaskPhase::Capability);
    assert_eq!(skill_task.priority, 0);
    assert_eq!(store.get_outcome(&o.id).unwrap().capability_readiness, CapabilityReadiness::Ready);

    let exec_worker = &report.execution[0].worker_id;
    let entry = store
        .progress_tail(exec_worker, 10)
        .unwrap()
        .into_iter()
        .find(|p| p.task_id.as_ref() == Some(&exec.id))
        .unwrap();
    let output = entry.full_output.unwrap();
    assert!(output.contains("## Skills"));
    assert!(output.contains("Push with the release script."));
}

#[tokio::test]
async fn capability_work_added_after_readiness_still_runs() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), DONE);
    let o = outcome(&orch);
    orch.submit_task(NewTask::new(o.id.clone(), "first pass")).unwrap();
    assert!(orch.run_outcome(&o.id).await.unwrap().achieved);
    assert_eq!(orch.store().get_outcome(&o.id).unwrap().capability_readiness, CapabilityReadiness::Ready);

    let cap = orch
        .submit_task(NewTask::new(o.id.clone(), "set up fixtures").phase(TaskPhase::Capability))
        .unwrap();
    let exec = orch.submit_task(NewTask::new(o.id.clone(), "second pass")).unwrap();

    let report = orch.run_outcome(&o.id).await.unwrap();
    assert_eq!(report.capability.iter().map(|s| s.completed).sum::<u32>(), 1);
    assert!(report.achieved, "blocked: {:?}", report.blocked);

    let store = orch.store();
    assert_eq!(store.get_task(&cap.id).unwrap().status, TaskStatus::Completed);
    assert_eq!(store.get_task(&exec.id).unwrap().status, TaskStatus::Completed);
    assert_eq!(store.get_outcome(&o.id).unwrap().capability_readiness, CapabilityReadiness::Ready);
}

#[tokio::test]
async fn invalid_skill_blocks_the_execution_phase() {
    let dir = tempdir().unwrap();
    let script = r#"printf 'no heading here\n' > "$HIVE_SKILLS_DIR/deploy.md"; echo DONE >> "$HIVE_PROGRESS_FILE""#;
    let orch = orchestrator(dir.path(), script);
    let o = outcome(&orch);
    let exec = orch
        .submit_task(NewTask::new(o.id.clone(), "ship release").required_skills(vec!["deploy".into()]))
        .unwrap();

    let report = orch.run_outcome(&o.id).await.unwrap();
    assert!(matches!(report.blocked, Some(PhaseBlock::InvalidSkills(_))));
    assert!(report.execution.is_empty());
    assert_ne!(orch.store().get_outcome(&o.id).unwrap().capability_readiness, CapabilityReadiness::Ready);
    assert_eq!(orch.store().get_task(&exec.id).unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn pausing_a_running_worker_keeps_output_and_releases_the_task() {
    let dir = tempdir().unwrap();
    let orch = Arc::new(orchestrator(dir.path(), "echo started; exec sleep 30"));
    let o = outcome(&orch);
    let t = orch.submit_task(NewTask::new(o.id.clone(), "long job")).unwrap();

    let runner = orch.clone();
    let outcome_id = o.id.clone();
    let handle = tokio::spawn(async move { runner.run_outcome(&outcome_id).await });

    let worker = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let busy = orch.store().list_active_workers().unwrap().into_iter().find(|w| w.pid.is_some());
            if let Some(w) = busy {
                return w;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("agent started");
    // Give the agent a moment to write its first line.
    tokio::time::sleep(Duration::from_millis(100)).await;
    orch.pause_worker(&worker.id, "operator").unwrap();

    let report = handle.await.unwrap().unwrap();
    assert!(report.interrupted);
    assert!(!report.achieved);

    let store = orch.store();
    let t = store.get_task(&t.id).unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.attempts, 0);
    assert_eq!(t.claimed_by, None);

    let w = store.get_worker(&worker.id).unwrap();
    assert_eq!(w.status, WorkerStatus::Paused);
    assert_eq!(w.pid, None);
    let progress = store.progress_tail(&worker.id, 5).unwrap();
    assert_eq!(progress.len(), 1);
    assert!(progress[0].full_output.as_deref().unwrap().contains("started"));
}

#[tokio::test]
async fn pause_intervention_stops_the_loop_before_claiming() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), DONE);
    let o = outcome(&orch);
    let t = orch.submit_task(NewTask::new(o.id.clone(), "anything")).unwrap();

    // A worker registered earlier with a queued pause picks it up on its first iteration.
    let store = orch.store();
    let w = store.register_worker(&o.id, TaskPhase::Execution).unwrap();
    orch.intervene(&w.id, InterventionKind::Pause, "hold").unwrap();
    let control = orch.registry().register(w.id.clone(), o.id.clone(), TaskPhase::Execution);
    let summary = hive_runner::run_worker(
        orch.worker_context(),
        hive_runner::WorkerSpec { outcome: o.clone(), worker: w.clone(), phase: TaskPhase::Execution, skill_context: Arc::default() },
        control,
    )
    .await;
    assert_eq!(summary.exit, hive_runner::LoopExit::Paused);
    assert_eq!(store.get_task(&t.id).unwrap().status, TaskStatus::Pending);
    assert_eq!(store.get_worker(&w.id).unwrap().status, WorkerStatus::Paused);
    assert!(store.list_interventions(&w.id).unwrap().iter().all(|i| i.status == InterventionStatus::Applied));
}

#[test]
fn sweep_recovers_claims_of_silent_workers() {
    let dir = tempdir().unwrap();
    let mut cfg = Config::default_for_repo("test");
    cfg.workers.stale_after_secs = 0;
    cfg.decomposition.use_reasoner = false;
    let orch = Orchestrator::with_config(dir.path(), cfg).unwrap();
    let o = outcome(&orch);
    let t = orch.submit_task(NewTask::new(o.id.clone(), "orphan")).unwrap();

    let store = orch.store();
    let w = store.register_worker(&o.id, TaskPhase::Execution).unwrap();
    store.set_worker_status(&w.id, WorkerStatus::Running).unwrap();
    assert!(store.claim_task(&t.id, &w.id).unwrap().into_task().is_some());
    std::thread::sleep(Duration::from_millis(5));

    let report = orch.sweep().unwrap();
    assert_eq!(report.released, vec![t.id.clone()]);
    assert_eq!(report.failed_workers, vec![w.id.clone()]);
    assert_eq!(store.get_task(&t.id).unwrap().status, TaskStatus::Pending);
    assert_eq!(store.get_worker(&w.id).unwrap().status, WorkerStatus::Failed);
}

#[test]
fn stop_all_pauses_workers_without_live_loops() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), DONE);
    let o = outcome(&orch);
    let t = orch.submit_task(NewTask::new(o.id.clone(), "held")).unwrap();

    let store = orch.store();
    let w = store.register_worker(&o.id, TaskPhase::Execution).unwrap();
    store.set_worker_status(&w.id, WorkerStatus::Running).unwrap();
    store.claim_task(&t.id, &w.id).unwrap();

    assert_eq!(orch.stop_all(Some(&o.id)).unwrap(), 1);
    assert_eq!(store.get_worker(&w.id).unwrap().status, WorkerStatus::Paused);
    let t = store.get_task(&t.id).unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.attempts, 0);
}

#[test]
fn import_resolves_dependencies_by_title() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(dir.path(), DONE);
    let o = outcome(&orch);
    let yaml = r#"
tasks:
  - title: docs
    depends_on: [schema]
  - title: schema
    priority: 5
  - title: skill
    phase: infrastructure
"#;
    let tasks = orch.import_tasks(&o.id, yaml).unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].title, "docs");
    assert_eq!(tasks[0].depends_on, vec![tasks[1].id.clone()]);
    assert_eq!(tasks[1].priority, 5);
    assert_eq!(tasks[2].phase, TaskPhase::Capability);
}
