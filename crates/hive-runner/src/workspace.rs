use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hive_core::{Outcome, Task, TaskPhase};

pub const INSTRUCTION_FILE: &str = "TASK.md";
pub const PROGRESS_FILE: &str = "progress.txt";
pub const SKILLS_DIR: &str = "skills";

/// `<workspace_root>/<outcome_id>`: one directory per outcome.
pub fn outcome_dir(workspace_root: &Path, outcome: &Outcome) -> PathBuf {
    workspace_root.join(outcome.id.as_str())
}

/// Capability artifacts for an outcome.
pub fn skills_dir(workspace_root: &Path, outcome: &Outcome) -> PathBuf {
    outcome_dir(workspace_root, outcome).join(SKILLS_DIR)
}

#[derive(Clone, Debug)]
pub struct TaskDir {
    pub path: PathBuf,
}

impl TaskDir {
    pub fn instruction_file(&self) -> PathBuf {
        self.path.join(INSTRUCTION_FILE)
    }

    pub fn progress_file(&self) -> PathBuf {
        self.path.join(PROGRESS_FILE)
    }

    pub fn read_sentinel(&self) -> SentinelState {
        std::fs::read_to_string(self.progress_file()).map(|t| parse_sentinel(&t)).unwrap_or_default()
    }
}

/// What goes into the instruction file besides the task itself.
#[derive(Clone, Debug, Default)]
pub struct Instructions<'a> {
    pub skill_context: &'a str,
    pub notes: &'a [String],
    /// Directory the agent works in, when it is not the task dir.
    pub working_dir: Option<&'a Path>,
    pub skills_dir: Option<&'a Path>,
}

/// Create the task directory with a fresh instruction file and an empty progress sentinel.
pub fn prepare_task_dir(outcome_dir: &Path, outcome: &Outcome, task: &Task, ins: &Instructions<'_>) -> Result<TaskDir> {
    let dir = TaskDir { path: outcome_dir.join(task.id.as_str()) };
    std::fs::create_dir_all(&dir.path).with_context(|| format!("create {}", dir.path.display()))?;
    let body = render_instructions(outcome, task, &dir, ins);
    std::fs::write(dir.instruction_file(), body)
        .with_context(|| format!("write {}", dir.instruction_file().display()))?;
    // Truncate: a sentinel left over from an earlier attempt must not count.
    std::fs::write(dir.progress_file(), "").with_context(|| format!("write {}", dir.progress_file().display()))?;
    Ok(dir)
}

fn render_instructions(outcome: &Outcome, task: &Task, dir: &TaskDir, ins: &Instructions<'_>) -> String {
    let mut out = format!("# {}\n\n", task.title);
    out.push_str(&format!("- task: {}\n- outcome: {} ({})\n- phase: {}\n", task.id, outcome.name, outcome.id, task.phase));
    if let Some(wd) = ins.working_dir {
        out.push_str(&format!("- working directory: {}\n", wd.display()));
    }
    if task.attempts > 1 {
        out.push_str(&format!("- attempt: {} of {}\n", task.attempts, task.max_attempts));
        if let Some(err) = &task.last_error {
            out.push_str(&format!("- previous error: {err}\n"));
        }
    }

    if !task.description.trim().is_empty() {
        out.push_str("\n## Description\n\n");
        out.push_str(task.description.trim());
        out.push('\n');
    }

    let intent = outcome.intent.summary();
    if !intent.trim().is_empty() {
        out.push_str("\n## Outcome intent\n\n");
        out.push_str(intent.trim());
        out.push('\n');
    }

    if !ins.skill_context.trim().is_empty() {
        out.push_str("\n## Skills\n\n");
        out.push_str(ins.skill_context.trim());
        out.push('\n');
    }

    if !ins.notes.is_empty() {
        out.push_str("\n## Operator notes\n\n");
        for n in ins.notes {
            out.push_str(&format!("- {n}\n"));
        }
    }

    if task.phase == TaskPhase::Capability {
        if let Some(skills) = ins.skills_dir {
            out.push_str(&format!(
                "\n## Skill output\n\nWrite each skill to {}/<name>.md with a `# <name>` heading and a `## Usage` section.\n",
                skills.display()
            ));
        }
    }

    out.push_str(&format!(
        "\n## Reporting\n\nAppend lines to {}:\n- `STATUS: <text>` while working\n- `COST: <usd>` for spend, optional\n- `DONE` when the task is finished\n- `ERROR: <reason>` if it cannot be finished\n",
        dir.progress_file().display()
    ));
    out
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    Done,
    Error(String),
}

/// Parsed progress sentinel. The last terminal marker wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SentinelState {
    pub terminal: Option<Terminal>,
    pub status: Option<String>,
    pub cost: f64,
}

pub fn parse_sentinel(text: &str) -> SentinelState {
    let mut state = SentinelState::default();
    for line in text.lines().map(str::trim) {
        if line == "DONE" {
            state.terminal = Some(Terminal::Done);
        } else if let Some(reason) = line.strip_prefix("ERROR:") {
            state.terminal = Some(Terminal::Error(reason.trim().to_string()));
        } else if let Some(status) = line.strip_prefix("STATUS:") {
            state.status = Some(status.trim().to_string());
        } else if let Some(cost) = line.strip_prefix("COST:") {
            if let Ok(v) = cost.trim().trim_start_matches('$').parse::<f64>() {
                if v.is_finite() && v > 0.0 {
                    state.cost += v;
                }
            }
        }
    }
    state
}
