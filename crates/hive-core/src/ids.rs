use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed id with a namespace prefix, e.g. `task_3f2a...`.
macro_rules! id_newtype {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::new_v4().simple()))
            }
            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(OutcomeId, "out");
id_newtype!(TaskId, "task");
id_newtype!(WorkerId, "wrk");
id_newtype!(ProgressId, "prog");
id_newtype!(AlertId, "alert");
id_newtype!(DetectionId, "det");
id_newtype!(SnapshotId, "snap");
id_newtype!(MergeId, "merge");
id_newtype!(InterventionId, "int");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_namespace() {
        let t = TaskId::new();
        assert!(t.as_str().starts_with("task_"));
        assert!(WorkerId::new().as_str().starts_with("wrk_"));
        assert_ne!(t, TaskId::new());
    }
}
