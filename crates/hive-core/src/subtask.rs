use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// 0-based position of a subtask within one decomposition plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubtaskIndex(pub usize);

/// A subtask before it has an id. Dependencies point at earlier plan positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDraft {
    pub title: String,
    pub description: String,
    pub depends_on: Vec<SubtaskIndex>,
    pub estimated_turns: Option<u32>,
}

/// Resolution of plan positions to persisted task ids, built after all nodes exist.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubtaskIdMap {
    ids: Vec<TaskId>,
}

impl SubtaskIdMap {
    pub fn push(&mut self, id: TaskId) -> SubtaskIndex {
        self.ids.push(id);
        SubtaskIndex(self.ids.len() - 1)
    }

    pub fn resolve(&self, idx: SubtaskIndex) -> Option<&TaskId> {
        self.ids.get(idx.0)
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Every dependency must point at a strictly lower index.
pub fn check_plan_indices(drafts: &[SubtaskDraft]) -> Result<(), String> {
    for (i, d) in drafts.iter().enumerate() {
        for dep in &d.depends_on {
            if dep.0 >= i {
                return Err(format!(
                    "subtask {i} depends on {} which is not an earlier subtask",
                    dep.0
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(deps: &[usize]) -> SubtaskDraft {
        SubtaskDraft {
            title: "t".into(),
            description: String::new(),
            depends_on: deps.iter().map(|d| SubtaskIndex(*d)).collect(),
            estimated_turns: None,
        }
    }

    #[test]
    fn forward_and_self_references_are_rejected() {
        assert!(check_plan_indices(&[draft(&[]), draft(&[0]), draft(&[0, 1])]).is_ok());
        assert!(check_plan_indices(&[draft(&[]), draft(&[]), draft(&[2])]).is_err());
        assert!(check_plan_indices(&[draft(&[1]), draft(&[])]).is_err());
    }

    #[test]
    fn id_map_resolves_positions() {
        let mut map = SubtaskIdMap::default();
        let a = map.push(TaskId::from_str("task_a"));
        map.push(TaskId::from_str("task_b"));
        assert_eq!(map.resolve(a).map(|t| t.as_str()), Some("task_a"));
        assert!(map.resolve(SubtaskIndex(5)).is_none());
    }
}
