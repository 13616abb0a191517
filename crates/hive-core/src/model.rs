use serde::{Deserialize, Serialize};

/// Enum with a stable snake_case text form used for persistence and the CLI.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s.trim() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(OutcomeStatus {
    Active => "active",
    Dormant => "dormant",
    Achieved => "achieved",
    Archived => "archived",
});

text_enum!(GitMode {
    None => "none",
    Branch => "branch",
    Worktree => "worktree",
});

text_enum!(
    /// Lifecycle of a task. Transitions are owned by the task store.
    TaskStatus {
        Pending => "pending",
        Claimed => "claimed",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    /// Capability (a.k.a. infrastructure) tasks run before execution tasks.
    TaskPhase {
        Capability => "capability",
        Execution => "execution",
    }
);

text_enum!(DecompositionStatus {
    None => "none",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(WorkerStatus {
    Idle => "idle",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

text_enum!(AlertKind {
    Stuck => "stuck",
    NoProgress => "no_progress",
    RepeatedErrors => "repeated_errors",
    SuspiciousPattern => "suspicious_pattern",
});

text_enum!(AlertStatus {
    Active => "active",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
});

text_enum!(PatternAction {
    Log => "log",
    Alert => "alert",
    Pause => "pause",
});

text_enum!(
    /// Which pattern severities the supervisor acts on.
    Sensitivity {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

text_enum!(ChangeKind {
    Created => "created",
    Modified => "modified",
    Deleted => "deleted",
});

text_enum!(MergeStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Conflicted => "conflicted",
    Failed => "failed",
});

text_enum!(InterventionKind {
    Pause => "pause",
    Redirect => "redirect",
    AddTask => "add_task",
    PriorityChange => "priority_change",
});

text_enum!(InterventionStatus {
    Pending => "pending",
    Applied => "applied",
});

impl TaskPhase {
    /// Accepts the `infrastructure` alias used by planners.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim() {
            "infrastructure" | "infra" => Some(TaskPhase::Capability),
            other => Self::parse(other),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Claimed or running: owned by a worker.
    pub fn is_owned(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

impl WorkerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Running)
    }
}

impl Sensitivity {
    /// low: critical only, medium: high and critical, high: everything.
    pub fn admits(&self, severity: Severity) -> bool {
        match self {
            Sensitivity::Low => severity == Severity::Critical,
            Sensitivity::Medium => matches!(severity, Severity::High | Severity::Critical),
            Sensitivity::High => true,
        }
    }
}

/// Phase gate stored on an outcome. Replaces the raw `0|1|2` level.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityReadiness {
    Unanalyzed,
    InProgress,
    Ready,
}

impl CapabilityReadiness {
    pub fn level(&self) -> i64 {
        match self {
            CapabilityReadiness::Unanalyzed => 0,
            CapabilityReadiness::InProgress => 1,
            CapabilityReadiness::Ready => 2,
        }
    }

    pub fn from_level(level: i64) -> Self {
        match level {
            2 => CapabilityReadiness::Ready,
            1 => CapabilityReadiness::InProgress,
            _ => CapabilityReadiness::Unanalyzed,
        }
    }

    /// Phases 0 and 1 run capability work; 2 runs execution.
    pub fn active_phase(&self) -> TaskPhase {
        match self {
            CapabilityReadiness::Ready => TaskPhase::Execution,
            _ => TaskPhase::Capability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_forms_round_trip_for_every_status() {
        for s in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(*s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn infrastructure_is_a_capability_alias() {
        assert_eq!(TaskPhase::parse_lenient("infrastructure"), Some(TaskPhase::Capability));
        assert_eq!(TaskPhase::parse_lenient("execution"), Some(TaskPhase::Execution));
    }

    #[test]
    fn sensitivity_filters_severities() {
        assert!(!Sensitivity::Low.admits(Severity::Medium));
        assert!(!Sensitivity::Low.admits(Severity::High));
        assert!(Sensitivity::Low.admits(Severity::Critical));
        assert!(Sensitivity::Medium.admits(Severity::High));
        assert!(!Sensitivity::Medium.admits(Severity::Medium));
        assert!(Sensitivity::High.admits(Severity::Low));
    }

    #[test]
    fn readiness_levels_map_to_phases() {
        assert_eq!(CapabilityReadiness::from_level(0).active_phase(), TaskPhase::Capability);
        assert_eq!(CapabilityReadiness::from_level(1).active_phase(), TaskPhase::Capability);
        assert_eq!(CapabilityReadiness::from_level(2).active_phase(), TaskPhase::Execution);
        assert_eq!(CapabilityReadiness::Ready.level(), 2);
    }
}
