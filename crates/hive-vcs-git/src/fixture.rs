use std::path::Path;

use anyhow::Result;

use crate::git::git;

/// Initialize a throwaway git repo with one commit. Returns the initial branch name.
pub fn init_git_repo(dir: &Path) -> Result<String> {
    git(dir, &["init"])?;
    git(dir, &["config", "user.email", "hive@example.com"])?;
    git(dir, &["config", "user.name", "hive"])?;
    std::fs::write(dir.join("README.md"), "fixture\n")?;
    git(dir, &["add", "."])?;
    git(dir, &["commit", "-m", "init"])?;
    git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}
