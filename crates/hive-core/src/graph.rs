use std::collections::{HashMap, HashSet, VecDeque};

use crate::ids::TaskId;

/// Returns the proposed dependencies from which `candidate` is reachable.
///
/// `edges` maps a task to the tasks it depends on. Adding `candidate -> dep`
/// closes a cycle exactly when `candidate` is reachable from `dep`.
pub fn find_cycle_sources(
    candidate: &TaskId,
    proposed: &[TaskId],
    edges: &HashMap<TaskId, Vec<TaskId>>,
) -> Vec<TaskId> {
    let mut offending = Vec::new();
    for dep in proposed {
        if dep == candidate || reaches(dep, candidate, edges) {
            offending.push(dep.clone());
        }
    }
    offending
}

fn reaches(from: &TaskId, target: &TaskId, edges: &HashMap<TaskId, Vec<TaskId>>) -> bool {
    let mut seen: HashSet<&TaskId> = HashSet::new();
    let mut queue: VecDeque<&TaskId> = VecDeque::new();
    queue.push_back(from);
    while let Some(node) = queue.pop_front() {
        if node == target {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(node) {
            queue.extend(next.iter());
        }
    }
    false
}

/// True when the whole edge set is acyclic.
pub fn is_acyclic(edges: &HashMap<TaskId, Vec<TaskId>>) -> bool {
    edges
        .iter()
        .all(|(node, deps)| find_cycle_sources(node, deps, edges).is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::from_str(s)
    }

    #[test]
    fn detects_transitive_cycle() {
        // b depends on a, c depends on b. Proposing a -> c closes a loop.
        let mut edges = HashMap::new();
        edges.insert(id("b"), vec![id("a")]);
        edges.insert(id("c"), vec![id("b")]);
        assert_eq!(find_cycle_sources(&id("a"), &[id("c")], &edges), vec![id("c")]);
        assert!(find_cycle_sources(&id("c"), &[id("a")], &edges).is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let edges = HashMap::new();
        assert_eq!(find_cycle_sources(&id("a"), &[id("a")], &edges), vec![id("a")]);
    }

    #[test]
    fn acyclic_check_covers_all_nodes() {
        let mut edges = HashMap::new();
        edges.insert(id("b"), vec![id("a")]);
        assert!(is_acyclic(&edges));
        edges.insert(id("a"), vec![id("b")]);
        assert!(!is_acyclic(&edges));
    }
}
