use std::path::Path;
use std::sync::Arc;

use hive_core::{MergeStatus, NewOutcome, OutcomeId, TaskPhase, WorkerId};
use hive_storage::SqliteStore;
use hive_vcs_git::{git, init_git_repo, GitWorktrees, MergeQueue, MergeResult};
use tempfile::tempdir;

fn write(dir: &Path, rel: &str, body: &str) {
    let p = dir.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

fn setup(repo: &Path, wt_root: &Path) -> GitWorktrees {
    let trunk = init_git_repo(repo).unwrap();
    write(repo, "src/a.ts", "export const a = 1;\n");
    git(repo, &["add", "."]).unwrap();
    git(repo, &["commit", "-m", "add a"]).unwrap();
    GitWorktrees::new(repo, trunk, wt_root)
}

#[test]
fn worktrees_are_isolated_and_reused() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let gw = setup(&repo, &dir.path().join("worktrees"));
    let o = OutcomeId::from_str("out_1");
    let (w1, w2) = (WorkerId::from_str("wrk_1"), WorkerId::from_str("wrk_2"));

    let a = gw.create_worktree(&o, &w1, None).unwrap();
    let b = gw.create_worktree(&o, &w2, None).unwrap();
    assert_ne!(a.path, b.path);
    assert_eq!(a.branch, "hive/wrk_1");
    assert!(!a.reused);
    assert!(a.path.join("src/a.ts").exists());

    let again = gw.create_worktree(&o, &w1, None).unwrap();
    assert!(again.reused);
    assert_eq!(again.path, a.path);

    write(&a.path, "notes.md", "hi\n");
    assert!(!b.path.join("notes.md").exists());
    assert!(gw.commit_all(&a.path, "notes").unwrap().is_some());
    assert!(gw.commit_all(&a.path, "nothing").unwrap().is_none());

    gw.remove_worktree(&o, &w1, false).unwrap();
    assert!(!a.path.exists());
    // Branch survives removal, so the worktree comes back on the same history.
    let restored = gw.create_worktree(&o, &w1, None).unwrap();
    assert!(restored.path.join("notes.md").exists());
}

#[test]
fn clean_branch_merges_into_trunk() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let gw = setup(&repo, &dir.path().join("worktrees"));
    let o = OutcomeId::from_str("out_1");
    let w = WorkerId::from_str("wrk_1");

    let wt = gw.create_worktree(&o, &w, None).unwrap();
    write(&wt.path, "src/b.ts", "export const b = 2;\n");
    gw.commit_all(&wt.path, "add b").unwrap();

    assert!(gw.can_merge_cleanly(&wt.branch).unwrap().clean);
    let MergeResult::Merged { commit } = gw.merge_worker_branch(&wt.branch, "merge wrk_1").unwrap() else {
        panic!("expected merge");
    };
    assert_eq!(git(&repo, &["rev-parse", "HEAD"]).unwrap(), commit);
    assert!(repo.join("src/b.ts").exists());
}

#[test]
fn conflicting_branch_leaves_trunk_untouched() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let gw = setup(&repo, &dir.path().join("worktrees"));
    let o = OutcomeId::from_str("out_1");
    let w = WorkerId::from_str("wrk_1");

    let wt = gw.create_worktree(&o, &w, None).unwrap();
    write(&wt.path, "src/a.ts", "export const a = 'worker';\n");
    gw.commit_all(&wt.path, "worker edit").unwrap();

    write(&repo, "src/a.ts", "export const a = 'trunk';\n");
    git(&repo, &["commit", "-am", "trunk edit"]).unwrap();
    let head_before = git(&repo, &["rev-parse", "HEAD"]).unwrap();

    let result = gw.merge_worker_branch(&wt.branch, "merge wrk_1").unwrap();
    assert_eq!(result, MergeResult::Conflicts(vec!["src/a.ts".to_string()]));

    assert_eq!(git(&repo, &["rev-parse", "HEAD"]).unwrap(), head_before);
    assert_eq!(git(&repo, &["status", "--porcelain"]).unwrap(), "");
    assert!(git(&repo, &["rev-parse", "-q", "--verify", "MERGE_HEAD"]).is_err());
    assert_eq!(std::fs::read_to_string(repo.join("src/a.ts")).unwrap(), "export const a = 'trunk';\n");
}

#[test]
fn merge_queue_persists_every_outcome() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let gw = setup(&repo, &dir.path().join("worktrees"));
    let store = Arc::new(SqliteStore::open(&dir.path().join("hive.db")).unwrap());
    let outcome = store.create_outcome(NewOutcome { name: "o".into(), ..Default::default() }).unwrap();
    let good = store.register_worker(&outcome.id, TaskPhase::Execution).unwrap();
    let bad = store.register_worker(&outcome.id, TaskPhase::Execution).unwrap();
    let queue = MergeQueue::new(store.clone(), gw.clone());

    let wt = gw.create_worktree(&outcome.id, &good.id, None).unwrap();
    write(&wt.path, "src/c.ts", "export const c = 3;\n");
    gw.commit_all(&wt.path, "add c").unwrap();
    let done = queue.queue_merge(&outcome.id, &good.id).unwrap();
    assert_eq!(done.status, MergeStatus::Completed);
    assert!(done.merge_commit.is_some());

    // No branch was ever created for this worker.
    let failed = queue.queue_merge(&outcome.id, &bad.id).unwrap();
    assert_eq!(failed.status, MergeStatus::Failed);
    assert!(failed.error_message.is_some());
    assert_eq!(store.list_merge_entries(&outcome.id).unwrap().len(), 2);
}
