//! Best-effort safety net around a worker's working directory.
//!
//! [`WorkspaceSupervisor`] polls the tree for changes and runs them through an
//! ordered pattern list; [`BehaviorDetector`] watches worker rows for stalls and
//! failure streaks. Neither blocks the worker loop.

mod behavior;
mod patterns;
mod rollback;
mod scan;
mod session;

pub use behavior::{BehaviorDetector, BehaviorSettings, TickReport};
pub use patterns::{evaluate, is_within, FileChange, PatternContext, PatternMatch, PatternSpec, PATTERNS};
pub use rollback::{rollback, RollbackReport};
pub use scan::{diff_states, scan_tree, FileState};
pub use session::{spawn_watch, PauseSink, SupervisorSettings, WorkspaceSupervisor};
