#[cfg(any(test, feature = "test-util"))]
mod fixture;
mod git;
mod merge_queue;

#[cfg(any(test, feature = "test-util"))]
pub use fixture::init_git_repo;
pub use git::{git, parse_unmerged, GitWorktrees, MergeCheck, MergeResult, WorktreeHandle};
pub use merge_queue::MergeQueue;
