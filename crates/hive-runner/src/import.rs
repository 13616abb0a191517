use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use hive_core::{NewTask, OutcomeId, TaskId, TaskPhase};
use serde::Deserialize;

/// One entry of a planner task file.
#[derive(Clone, Debug, Deserialize)]
pub struct ImportTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<i64>,
    /// Titles of other entries in the same file, or ids of existing tasks.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Wrapped { tasks: Vec<ImportTask> },
    List(Vec<ImportTask>),
}

/// Accepts either a bare YAML list or a `tasks:` mapping.
pub fn parse_import(text: &str) -> Result<Vec<ImportTask>> {
    let file: ImportFile = serde_yaml::from_str(text).context("parse task file")?;
    let tasks = match file {
        ImportFile::Wrapped { tasks } | ImportFile::List(tasks) => tasks,
    };
    let mut seen = HashMap::new();
    for (i, t) in tasks.iter().enumerate() {
        if t.title.trim().is_empty() {
            bail!("entry {i} has an empty title");
        }
        if let Some(prev) = seen.insert(t.title.as_str(), i) {
            bail!("duplicate title {:?} (entries {prev} and {i})", t.title);
        }
    }
    Ok(tasks)
}

/// Order entries so in-file dependencies come first and turn them into creation payloads.
/// `create` receives each payload in order and returns the new id.
pub fn plan_import(
    outcome_id: &OutcomeId,
    tasks: &[ImportTask],
    mut create: impl FnMut(NewTask) -> Result<TaskId>,
) -> Result<Vec<TaskId>> {
    let by_title: HashMap<&str, usize> = tasks.iter().enumerate().map(|(i, t)| (t.title.as_str(), i)).collect();
    let mut ids: Vec<Option<TaskId>> = vec![None; tasks.len()];
    let mut remaining = tasks.len();

    while remaining > 0 {
        let mut progressed = false;
        for (i, t) in tasks.iter().enumerate() {
            if ids[i].is_some() {
                continue;
            }
            let mut deps = Vec::with_capacity(t.depends_on.len());
            let mut ready = true;
            for d in &t.depends_on {
                match by_title.get(d.as_str()) {
                    Some(&j) => match &ids[j] {
                        Some(id) => deps.push(id.clone()),
                        None => ready = false,
                    },
                    None => deps.push(TaskId::from_str(d.clone())),
                }
            }
            if !ready {
                continue;
            }

            let mut new = NewTask::new(outcome_id.clone(), t.title.clone())
                .description(t.description.clone())
                .depends_on(deps)
                .required_skills(t.required_skills.clone());
            if let Some(p) = t.priority {
                new = new.priority(p);
            }
            if let Some(n) = t.max_attempts {
                new = new.max_attempts(n);
            }
            if let Some(phase) = &t.phase {
                new = new.phase(TaskPhase::parse_lenient(phase).ok_or_else(|| anyhow!("{:?}: unknown phase {phase:?}", t.title))?);
            }
            ids[i] = Some(create(new).with_context(|| format!("create {:?}", t.title))?);
            remaining -= 1;
            progressed = true;
        }
        if !progressed {
            let stuck: Vec<&str> =
                tasks.iter().zip(&ids).filter(|(_, id)| id.is_none()).map(|(t, _)| t.title.as_str()).collect();
            bail!("circular dependencies between {}", stuck.join(", "));
        }
    }
    Ok(ids.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
tasks:
  - title: wire api
    depends_on: [schema]
    priority: 20
  - title: schema
    phase: infrastructure
  - title: docs
"#;

    #[test]
    fn dependencies_are_created_first() {
        let tasks = parse_import(FILE).unwrap();
        let mut created = Vec::new();
        let ids = plan_import(&OutcomeId::from_str("out_1"), &tasks, |new| {
            let id = TaskId::from_str(format!("task_{}", new.title.replace(' ', "_")));
            created.push(new);
            Ok(id)
        })
        .unwrap();

        assert_eq!(created.iter().map(|n| n.title.as_str()).collect::<Vec<_>>(), vec!["schema", "docs", "wire api"]);
        assert_eq!(created[0].phase, TaskPhase::Capability);
        assert_eq!(created[2].depends_on, vec![TaskId::from_str("task_schema")]);
        assert_eq!(created[2].priority, 20);
        // Ids come back in file order.
        assert_eq!(ids[0], TaskId::from_str("task_wire_api"));
    }

    #[test]
    fn bare_lists_and_cycles() {
        let tasks = parse_import("- title: a\n  depends_on: [b]\n- title: b\n  depends_on: [a]\n").unwrap();
        let err = plan_import(&OutcomeId::from_str("out_1"), &tasks, |_| Ok(TaskId::new())).unwrap_err();
        assert!(err.to_string().contains("circular"));
        assert!(parse_import("- title: a\n- title: a\n").is_err());
    }
}
