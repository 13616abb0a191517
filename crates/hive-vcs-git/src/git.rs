use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use hive_core::{OutcomeId, WorkerId};
use tracing::{debug, info, warn};

/// Run git in `dir`, returning trimmed stdout or an error carrying both streams.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("run git {:?}", args))?;
    if !out.status.success() {
        return Err(anyhow!(
            "command failed: git {:?}\nstdout:{}\nstderr:{}",
            args,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Per-worker branches and worktrees on top of one repository with a trunk branch.
#[derive(Clone, Debug)]
pub struct GitWorktrees {
    pub repo_root: PathBuf,
    pub trunk: String,
    /// Worktrees live here, outside the shared workspace tree.
    pub worktrees_root: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
    pub reused: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeCheck {
    pub clean: bool,
    pub conflicts: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeResult {
    Merged { commit: String },
    Conflicts(Vec<String>),
}

const UNMERGED: &[&str] = &["DD", "AU", "UD", "UA", "DU", "AA", "UU"];

/// Paths with an unmerged status code in `git status --porcelain` output.
pub fn parse_unmerged(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter(|l| l.len() > 3 && UNMERGED.contains(&&l[..2]))
        .map(|l| l[3..].trim().trim_matches('"').to_string())
        .collect()
}

fn path_arg(p: &Path) -> Result<&str> {
    p.to_str().ok_or_else(|| anyhow!("non utf-8 path: {}", p.display()))
}

impl GitWorktrees {
    pub fn new(repo_root: impl Into<PathBuf>, trunk: impl Into<String>, worktrees_root: impl Into<PathBuf>) -> Self {
        Self { repo_root: repo_root.into(), trunk: trunk.into(), worktrees_root: worktrees_root.into() }
    }

    pub fn branch_name(worker_id: &WorkerId) -> String {
        format!("hive/{}", worker_id.as_str())
    }

    pub fn worktree_path(&self, outcome_id: &OutcomeId, worker_id: &WorkerId) -> PathBuf {
        self.worktrees_root.join(outcome_id.as_str()).join(worker_id.as_str())
    }

    fn succeeds(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn branch_exists(&self, branch: &str) -> bool {
        Self::succeeds(&self.repo_root, &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
    }

    pub fn has_remote(&self) -> Result<bool> {
        Ok(!git(&self.repo_root, &["remote"])?.is_empty())
    }

    /// Create (or reuse) the worker's branch and worktree.
    pub fn create_worktree(
        &self,
        outcome_id: &OutcomeId,
        worker_id: &WorkerId,
        base_branch: Option<&str>,
    ) -> Result<WorktreeHandle> {
        let path = self.worktree_path(outcome_id, worker_id);
        let branch = Self::branch_name(worker_id);

        if path.join(".git").exists() && Self::succeeds(&path, &["rev-parse", "--is-inside-work-tree"]) {
            debug!(path = %path.display(), "reusing worktree");
            return Ok(WorktreeHandle { path, branch, reused: true });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        // Forget registrations whose directories were deleted out from under git.
        git(&self.repo_root, &["worktree", "prune"])?;

        let target = path_arg(&path)?;
        if self.branch_exists(&branch) {
            git(&self.repo_root, &["worktree", "add", target, &branch])?;
        } else {
            let base = base_branch.unwrap_or(&self.trunk);
            git(&self.repo_root, &["worktree", "add", "-b", &branch, target, base])?;
        }
        info!(worker = %worker_id, branch = %branch, path = %path.display(), "created worktree");
        Ok(WorktreeHandle { path, branch, reused: false })
    }

    /// Best-effort removal of the worktree and, optionally, its branch.
    pub fn remove_worktree(&self, outcome_id: &OutcomeId, worker_id: &WorkerId, delete_branch: bool) -> Result<()> {
        let path = self.worktree_path(outcome_id, worker_id);
        if path.exists() {
            if let Err(e) = git(&self.repo_root, &["worktree", "remove", "--force", path_arg(&path)?]) {
                warn!(path = %path.display(), error = %e, "worktree remove failed");
            }
        }
        let _ = git(&self.repo_root, &["worktree", "prune"]);
        if delete_branch {
            let branch = Self::branch_name(worker_id);
            if self.branch_exists(&branch) {
                git(&self.repo_root, &["branch", "-D", &branch])?;
            }
        }
        Ok(())
    }

    /// Stage and commit everything in `dir`. `None` when there was nothing to commit.
    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<Option<String>> {
        if git(dir, &["status", "--porcelain"])?.is_empty() {
            return Ok(None);
        }
        git(dir, &["add", "-A"])?;
        git(dir, &["commit", "-m", message])?;
        Ok(Some(git(dir, &["rev-parse", "HEAD"])?))
    }

    fn merge_in_progress(&self) -> bool {
        Self::succeeds(&self.repo_root, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])
    }

    /// Abort whatever merge state exists. Falls back to `reset --merge`.
    fn abort_merge(&self) -> Result<()> {
        if !self.merge_in_progress() {
            return Ok(());
        }
        if let Err(e) = git(&self.repo_root, &["merge", "--abort"]) {
            warn!(error = %e, "merge --abort failed, resetting");
            git(&self.repo_root, &["reset", "--merge"])?;
        }
        if self.merge_in_progress() {
            return Err(anyhow!("repository still mid-merge after abort"));
        }
        Ok(())
    }

    fn checkout_trunk(&self) -> Result<()> {
        let head = git(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if head != self.trunk {
            git(&self.repo_root, &["checkout", &self.trunk])?;
        }
        Ok(())
    }

    /// Dry-run merge of `branch` into the current checkout. Never leaves the repo mid-merge.
    pub fn can_merge_cleanly(&self, branch: &str) -> Result<MergeCheck> {
        let attempt = git(&self.repo_root, &["merge", "--no-commit", "--no-ff", branch]);
        let status = git(&self.repo_root, &["status", "--porcelain"]);
        self.abort_merge()?;

        let conflicts = parse_unmerged(&status?);
        if let Err(e) = attempt {
            if conflicts.is_empty() {
                return Err(e.context(format!("dry-run merge of {branch}")));
            }
        }
        Ok(MergeCheck { clean: conflicts.is_empty(), conflicts })
    }

    /// Merge a worker branch into trunk with a merge commit.
    /// Conflicts are reported without touching trunk.
    pub fn merge_worker_branch(&self, branch: &str, message: &str) -> Result<MergeResult> {
        self.checkout_trunk()?;
        if self.has_remote()? {
            if let Err(e) = git(&self.repo_root, &["pull", "--ff-only"]) {
                warn!(error = %e, "fast-forward pull failed, merging against local trunk");
            }
        }

        let check = self.can_merge_cleanly(branch)?;
        if !check.clean {
            info!(branch, conflicts = ?check.conflicts, "merge would conflict");
            return Ok(MergeResult::Conflicts(check.conflicts));
        }

        if let Err(e) = git(&self.repo_root, &["merge", "--no-ff", "-m", message, branch]) {
            self.abort_merge()?;
            return Err(e.context(format!("merge {branch} into {}", self.trunk)));
        }
        let commit = git(&self.repo_root, &["rev-parse", "HEAD"])?;
        info!(branch, trunk = %self.trunk, commit = %commit, "merged worker branch");
        Ok(MergeResult::Merged { commit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmerged_codes_only() {
        let porcelain = "UU src/a.ts\nM  src/b.ts\nAA \"with space.txt\"\nDD gone.rs\n?? new.txt\n";
        assert_eq!(parse_unmerged(porcelain), vec!["src/a.ts", "with space.txt", "gone.rs"]);
    }
}
